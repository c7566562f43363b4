use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::Mutex;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Result, SessionError};
use crate::identity::ParticipantId;
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    LocalOfferCreated,
    RemoteOfferReceived,
    DescriptionsExchanged,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    /// Both descriptions are committed, so ICE candidates may be applied.
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            NegotiationState::DescriptionsExchanged | NegotiationState::Connected
        )
    }
}

/// Remote tracks received from one participant, grouped as one stream.
#[derive(Clone)]
pub struct RemoteMediaStream {
    id: String,
    tracks: Vec<Arc<TrackRemote>>,
}

impl RemoteMediaStream {
    fn new(id: String) -> Self {
        Self {
            id,
            tracks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<TrackRemote>] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: RTPCodecType) -> bool {
        self.tracks.iter().any(|track| track.kind() == kind)
    }

    fn upsert(&mut self, track: Arc<TrackRemote>) {
        let track_id = track.id();
        self.tracks.retain(|existing| existing.id() != track_id);
        self.tracks.push(track);
    }
}

impl fmt::Debug for RemoteMediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

pub type RemoteTrackHandler = Arc<dyn Fn(ParticipantId, RemoteMediaStream) + Send + Sync>;
pub type LocalCandidateHandler = Arc<dyn Fn(ParticipantId, RTCIceCandidateInit) + Send + Sync>;
pub type ConnectionStateHandler = Arc<dyn Fn(ParticipantId, RTCPeerConnectionState) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct SessionHandlers {
    pub on_remote_track: RemoteTrackHandler,
    pub on_local_ice_candidate: LocalCandidateHandler,
    pub on_connection_state_change: ConnectionStateHandler,
}

/// Local candidates are held until the description that produced them has
/// been relayed, so the remote side never sees a candidate before its offer.
#[derive(Default)]
struct LocalCandidateGate {
    released: bool,
    held: Vec<RTCIceCandidateInit>,
}

/// Negotiation and connection lifecycle with one remote participant.
pub struct PeerSession {
    participant: ParticipantId,
    peer_connection: Arc<RTCPeerConnection>,
    state: StdMutex<NegotiationState>,
    pending_remote: StdMutex<Vec<RTCIceCandidateInit>>,
    local_gate: StdMutex<LocalCandidateGate>,
    remote_stream: StdMutex<Option<RemoteMediaStream>>,
    handlers: StdMutex<Option<SessionHandlers>>,
    negotiation: Mutex<()>,
    closed: AtomicBool,
}

impl PeerSession {
    pub(crate) fn new(participant: ParticipantId, peer_connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            participant,
            peer_connection,
            state: StdMutex::new(NegotiationState::Idle),
            pending_remote: StdMutex::new(Vec::new()),
            local_gate: StdMutex::new(LocalCandidateGate::default()),
            remote_stream: StdMutex::new(None),
            handlers: StdMutex::new(None),
            negotiation: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    pub fn state(&self) -> NegotiationState {
        *lock(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remote candidates waiting for both descriptions, in arrival order.
    pub fn queued_candidates(&self) -> Vec<RTCIceCandidateInit> {
        lock(&self.pending_remote).clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteMediaStream> {
        lock(&self.remote_stream).clone()
    }

    pub(crate) fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    /// Serializes negotiation steps on this session.
    pub(crate) async fn negotiation_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.negotiation.lock().await
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::NoSession(self.participant));
        }
        Ok(())
    }

    pub(crate) fn set_state(&self, next: NegotiationState) {
        let previous = {
            let mut state = lock(&self.state);
            if *state == NegotiationState::Closed {
                return;
            }
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            tracing::debug!(
                participant = self.participant,
                from = ?previous,
                to = ?next,
                "Peer session state changed"
            );
        }
    }

    pub(crate) fn enqueue_remote_candidate(&self, candidate: RTCIceCandidateInit) -> usize {
        let mut pending = lock(&self.pending_remote);
        pending.push(candidate);
        pending.len()
    }

    pub(crate) fn take_remote_candidates(&self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut *lock(&self.pending_remote))
    }

    pub(crate) fn set_handlers(&self, handlers: SessionHandlers) {
        *lock(&self.handlers) = Some(handlers);
        self.flush_local_candidates();
    }

    pub(crate) fn handlers(&self) -> Option<SessionHandlers> {
        lock(&self.handlers).clone()
    }

    pub(crate) fn release_local_candidates(&self) {
        lock(&self.local_gate).released = true;
        self.flush_local_candidates();
    }

    fn flush_local_candidates(&self) {
        let mut gate = lock(&self.local_gate);
        if !gate.released || gate.held.is_empty() {
            return;
        }
        let Some(handlers) = self.handlers() else {
            return;
        };

        for candidate in gate.held.drain(..) {
            (handlers.on_local_ice_candidate)(self.participant, candidate);
        }
    }

    pub(crate) fn on_local_candidate(&self, candidate: RTCIceCandidateInit) {
        if self.is_closed() {
            return;
        }

        let mut gate = lock(&self.local_gate);
        match self.handlers() {
            Some(handlers) if gate.released => {
                (handlers.on_local_ice_candidate)(self.participant, candidate);
            }
            _ => gate.held.push(candidate),
        }
    }

    pub(crate) fn on_remote_track(&self, track: Arc<TrackRemote>) {
        if self.is_closed() {
            return;
        }

        tracing::info!(
            participant = self.participant,
            track_id = %track.id(),
            kind = %track.kind(),
            "Received remote track"
        );

        let stream = {
            let mut slot = lock(&self.remote_stream);
            let stream = slot.get_or_insert_with(|| RemoteMediaStream::new(track.stream_id()));
            stream.upsert(track);
            stream.clone()
        };

        if let Some(handlers) = self.handlers() {
            (handlers.on_remote_track)(self.participant, stream);
        }
    }

    /// Maps a transport state report onto the negotiation state machine.
    pub(crate) fn on_transport_state(&self, transport: RTCPeerConnectionState) {
        if self.is_closed() {
            return;
        }

        match transport {
            RTCPeerConnectionState::Connected => {
                if self.state() == NegotiationState::DescriptionsExchanged {
                    self.set_state(NegotiationState::Connected);
                }
            }
            RTCPeerConnectionState::Failed => self.set_state(NegotiationState::Failed),
            RTCPeerConnectionState::Closed => self.set_state(NegotiationState::Closed),
            _ => {}
        }

        tracing::info!(
            participant = self.participant,
            transport = %transport,
            state = ?self.state(),
            "Peer connection state changed"
        );

        if let Some(handlers) = self.handlers() {
            (handlers.on_connection_state_change)(self.participant, transport);
        }
    }

    /// Stops all further callback dispatch. Runs before the underlying
    /// connection is closed so stale completions see a closed session.
    pub(crate) fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.state) = NegotiationState::Closed;
        lock(&self.handlers).take();
        lock(&self.pending_remote).clear();
        lock(&self.local_gate).held.clear();
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("participant", &self.participant)
            .field("state", &self.state())
            .field("queued_candidates", &lock(&self.pending_remote).len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
