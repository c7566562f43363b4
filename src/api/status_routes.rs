use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use warp::Filter;

use crate::session::{RoleBehavior, SessionOrchestrator, SessionSnapshot};

/// Anything that can report the live session state.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn snapshot(&self) -> SessionSnapshot;
}

#[async_trait]
impl<R: RoleBehavior> SnapshotSource for SessionOrchestrator<R> {
    async fn snapshot(&self) -> SessionSnapshot {
        SessionOrchestrator::snapshot(self).await
    }
}

/// `GET /session/health` and `GET /session/state`.
pub fn status_routes(
    source: Arc<dyn SnapshotSource>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    session_health_check().or(session_state(source))
}

pub fn session_health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("session" / "health")
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "proctor-session",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

pub fn session_state(
    source: Arc<dyn SnapshotSource>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("session" / "state")
        .and(warp::get())
        .and(with_source(source))
        .and_then(|source: Arc<dyn SnapshotSource>| async move {
            let snapshot = source.snapshot().await;
            Ok::<_, Infallible>(warp::reply::json(&snapshot))
        })
}

fn with_source(
    source: Arc<dyn SnapshotSource>,
) -> impl Filter<Extract = (Arc<dyn SnapshotSource>,), Error = Infallible> + Clone {
    warp::any().map(move || source.clone())
}
