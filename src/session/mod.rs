//! Role-specific reactions to signaling events, wired to the peer sessions.

mod candidate;
mod proctor;

use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{Result, SessionError};
use crate::identity::{ParticipantId, Role};
use crate::lock;
use crate::media::{LocalMediaStream, MediaConstraints};
use crate::peer::{NegotiationState, PeerSessionManager, RemoteMediaStream};
use crate::signaling::{
    ConnectionState, ExamResult, SignalEvent, SignalPayload, SignalingChannel, SignalingMessage,
};

pub use candidate::{CandidateRole, ExamState};
pub use proctor::{Participant, ProctorRole};

pub type ProctorSession = SessionOrchestrator<ProctorRole>;
pub type CandidateSession = SessionOrchestrator<CandidateRole>;

/// Notifications for whatever presents the session (console, UI).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SignalingStateChanged(ConnectionState),
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    RemoteStream {
        participant: ParticipantId,
        stream: RemoteMediaStream,
    },
    PeerStateChanged {
        participant: ParticipantId,
        transport: RTCPeerConnectionState,
    },
    NegotiationFailed {
        participant: ParticipantId,
        reason: String,
    },
    ExamStarted,
    ExamEnded,
    ExamCompleted {
        participant: ParticipantId,
        result: ExamResult,
    },
}

/// What differs between the proctor and candidate sides of a session.
#[async_trait]
pub trait RoleBehavior: Sized + Send + Sync + 'static {
    const ROLE: Role;

    /// Events handled by `on_signal`. `ice-candidate` is handled for every role.
    fn subscriptions() -> &'static [SignalEvent];

    /// The `participant` field of an envelope sent to `remote`.
    fn address(own: ParticipantId, remote: ParticipantId) -> ParticipantId;

    async fn on_signal(
        session: &Arc<SessionOrchestrator<Self>>,
        origin: ParticipantId,
        payload: SignalPayload,
    ) -> Result<()>;

    fn on_remote_stream(&self, _participant: ParticipantId, _stream: &RemoteMediaStream) {}

    fn on_peer_state(&self, _participant: ParticipantId, _transport: RTCPeerConnectionState) {}

    async fn on_peer_failed(
        session: &Arc<SessionOrchestrator<Self>>,
        participant: ParticipantId,
        reason: String,
    );

    /// Role-specific part of the status snapshot.
    fn describe(&self) -> serde_json::Value;
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub participant: ParticipantId,
    pub state: NegotiationState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub role: Role,
    pub participant_id: ParticipantId,
    pub signaling: ConnectionState,
    pub peers: Vec<PeerSnapshot>,
    pub role_state: serde_json::Value,
}

/// Joins one signaling channel to one peer-session manager on behalf of a role.
pub struct SessionOrchestrator<R: RoleBehavior> {
    own_id: ParticipantId,
    channel: Arc<SignalingChannel>,
    peers: Arc<PeerSessionManager>,
    role: R,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_forwarder: StdMutex<Option<JoinHandle<()>>>,
}

impl<R: RoleBehavior> SessionOrchestrator<R> {
    pub fn new(
        channel: Arc<SignalingChannel>,
        peers: Arc<PeerSessionManager>,
        role: R,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let endpoint = channel.endpoint();
        if endpoint.role() != R::ROLE {
            tracing::warn!(
                endpoint_role = %endpoint.role(),
                session_role = %R::ROLE,
                "Signaling endpoint role does not match session role"
            );
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            own_id: endpoint.participant_id(),
            channel,
            peers,
            role,
            events,
            state_forwarder: StdMutex::new(None),
        });
        (orchestrator, receiver)
    }

    pub fn own_id(&self) -> ParticipantId {
        self.own_id
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn channel(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    pub fn peers(&self) -> &Arc<PeerSessionManager> {
        &self.peers
    }

    pub async fn initialize_media(&self, video: bool, audio: bool) -> Result<LocalMediaStream> {
        self.peers.initialize_local_stream(video, audio).await
    }

    pub async fn initialize_media_with(&self, constraints: MediaConstraints) -> Result<LocalMediaStream> {
        self.peers.initialize_local_stream_with(constraints).await
    }

    /// Registers the role's signaling handlers and connects.
    pub async fn start(self: &Arc<Self>) {
        let events = std::iter::once(&SignalEvent::IceCandidate).chain(R::subscriptions());
        for event in events {
            let weak = Arc::downgrade(self);
            self.channel
                .on(event.as_str(), move |message: SignalingMessage| {
                    let weak = weak.clone();
                    async move {
                        if let Some(session) = weak.upgrade() {
                            session.dispatch(message).await;
                        }
                    }
                })
                .await;
        }

        let mut states = self.channel.subscribe();
        let weak = Arc::downgrade(self);
        let forwarder = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                match weak.upgrade() {
                    Some(session) => session.emit(SessionEvent::SignalingStateChanged(state)),
                    None => break,
                }
            }
        });
        if let Some(previous) = lock(&self.state_forwarder).replace(forwarder) {
            previous.abort();
        }

        tracing::info!(
            role = %R::ROLE,
            participant = self.own_id,
            "Starting session"
        );
        self.channel.connect().await;
    }

    /// Disconnects signaling and releases every peer session and the local stream.
    pub async fn shutdown(&self) {
        self.channel.disconnect().await;
        self.peers.cleanup().await;
        if let Some(forwarder) = lock(&self.state_forwarder).take() {
            forwarder.abort();
        }
        tracing::info!(role = %R::ROLE, participant = self.own_id, "Session shut down");
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let mut peers = Vec::new();
        for participant in self.peers.participants().await {
            if let Some(state) = self.peers.session_state(participant).await {
                peers.push(PeerSnapshot { participant, state });
            }
        }

        SessionSnapshot {
            role: R::ROLE,
            participant_id: self.own_id,
            signaling: self.channel.state(),
            peers,
            role_state: self.role.describe(),
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Sends `payload` to `remote`, addressed per the role.
    pub(crate) fn relay(&self, remote: ParticipantId, payload: &SignalPayload) -> Result<()> {
        let envelope =
            SignalingMessage::new(payload, R::address(self.own_id, remote), Some(self.own_id))?;
        self.channel.send_message(&envelope)
    }

    async fn dispatch(self: &Arc<Self>, message: SignalingMessage) {
        let origin = message.origin();
        let payload = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(
                    event = %message.event,
                    origin,
                    error = %e,
                    "Dropping undecodable signaling payload"
                );
                return;
            }
        };
        let event = payload.event();
        tracing::debug!(event = %event, origin, "Handling signaling event");

        let result = match payload {
            SignalPayload::IceCandidate(candidate) => {
                self.peers.handle_ice_candidate(origin, candidate).await
            }
            other => R::on_signal(self, origin, other).await,
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_rejected_operation() => {
                tracing::info!(event = %event, origin, reason = %e, "Ignoring signaling event");
            }
            Err(SessionError::Negotiation { participant, reason }) => {
                R::on_peer_failed(self, participant, reason).await;
            }
            Err(e) => {
                tracing::warn!(event = %event, origin, error = %e, "Signaling event failed");
            }
        }
    }

    /// Ensures a peer session exists for `participant` with this
    /// orchestrator's observers installed.
    pub(crate) async fn attach_peer(self: &Arc<Self>, participant: ParticipantId) -> Result<()> {
        self.peers.create_peer_session(participant).await?;

        let on_track = Arc::downgrade(self);
        let on_candidate = Arc::downgrade(self);
        let on_state = Arc::downgrade(self);

        self.peers
            .setup_session_handlers(
                participant,
                move |id, stream| {
                    if let Some(session) = on_track.upgrade() {
                        session.role.on_remote_stream(id, &stream);
                        session.emit(SessionEvent::RemoteStream {
                            participant: id,
                            stream,
                        });
                    }
                },
                move |id, candidate| {
                    if let Some(session) = on_candidate.upgrade() {
                        if let Err(e) = session.relay(id, &SignalPayload::IceCandidate(candidate)) {
                            tracing::warn!(participant = id, error = %e, "Failed to relay local ICE candidate");
                        }
                    }
                },
                move |id, transport| {
                    let Some(session) = on_state.upgrade() else {
                        return;
                    };
                    session.role.on_peer_state(id, transport);
                    session.emit(SessionEvent::PeerStateChanged {
                        participant: id,
                        transport,
                    });
                    if transport == RTCPeerConnectionState::Failed {
                        spawn_peer_failed(Arc::downgrade(&session), id);
                    }
                },
            )
            .await
    }

    /// Creates and relays an offer, then lets local candidates follow it.
    pub(crate) async fn offer_to(self: &Arc<Self>, participant: ParticipantId) -> Result<()> {
        self.attach_peer(participant).await?;
        let offer = self.peers.create_offer(participant).await?;
        self.relay(participant, &SignalPayload::Offer(offer))?;
        self.peers.release_local_candidates(participant).await?;
        tracing::info!(participant, "Offer relayed");
        Ok(())
    }

    /// Applies a remote offer and relays the answer, then lets local
    /// candidates follow it.
    pub(crate) async fn answer_offer(
        self: &Arc<Self>,
        participant: ParticipantId,
        offer: RTCSessionDescription,
    ) -> Result<()> {
        self.attach_peer(participant).await?;
        let answer = self.peers.handle_remote_offer(participant, offer).await?;
        self.relay(participant, &SignalPayload::Answer(answer))?;
        self.peers.release_local_candidates(participant).await?;
        tracing::info!(participant, "Answer relayed");
        Ok(())
    }
}

/// Failure handling awaits peer teardown, which must not happen inside a
/// webrtc state callback.
fn spawn_peer_failed<R: RoleBehavior>(session: Weak<SessionOrchestrator<R>>, participant: ParticipantId) {
    tokio::spawn(async move {
        if let Some(session) = session.upgrade() {
            R::on_peer_failed(&session, participant, "peer connection failed".to_string()).await;
        }
    });
}
