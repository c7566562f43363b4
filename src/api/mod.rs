pub mod status_routes;

pub use status_routes::{status_routes, SnapshotSource};
