use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::session::{NegotiationState, PeerSession, RemoteMediaStream, SessionHandlers};
use super::webrtc_utils::{create_webrtc_api, rtc_configuration};
use crate::config::IceConfig;
use crate::error::{Result, SessionError};
use crate::identity::ParticipantId;
use crate::media::{LocalMediaStream, MediaConstraints, MediaDeviceInfo, MediaDevices};

/// Owns the local capture stream and one `PeerSession` per remote participant.
pub struct PeerSessionManager {
    api: Arc<API>,
    rtc_config: RTCConfiguration,
    devices: Arc<dyn MediaDevices>,
    sessions: RwLock<HashMap<ParticipantId, Arc<PeerSession>>>,
    local_stream: RwLock<Option<LocalMediaStream>>,
}

impl PeerSessionManager {
    pub fn new(api: Arc<API>, rtc_config: RTCConfiguration, devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            api,
            rtc_config,
            devices,
            sessions: RwLock::new(HashMap::new()),
            local_stream: RwLock::new(None),
        }
    }

    pub fn from_ice_config(ice: &IceConfig, devices: Arc<dyn MediaDevices>) -> Result<Self> {
        Ok(Self::new(create_webrtc_api()?, rtc_configuration(ice), devices))
    }

    /// Acquires the default capture devices once. Later calls hand back the
    /// same stream.
    pub async fn initialize_local_stream(&self, video: bool, audio: bool) -> Result<LocalMediaStream> {
        self.initialize_local_stream_with(MediaConstraints::new(video, audio)).await
    }

    pub async fn initialize_local_stream_with(&self, constraints: MediaConstraints) -> Result<LocalMediaStream> {
        let mut slot = self.local_stream.write().await;
        if let Some(existing) = slot.as_ref() {
            tracing::warn!(stream_id = %existing.id(), "Local stream already initialized, reusing it");
            return Ok(existing.clone());
        }

        let (video, audio) = (constraints.video, constraints.audio);
        let stream = self.devices.acquire(constraints).await?;
        tracing::info!(stream_id = %stream.id(), video, audio, "Local stream initialized");
        *slot = Some(stream.clone());
        Ok(stream)
    }

    pub async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
        self.devices.enumerate().await
    }

    pub async fn local_stream(&self) -> Option<LocalMediaStream> {
        self.local_stream.read().await.clone()
    }

    pub async fn session(&self, participant: ParticipantId) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(&participant).cloned()
    }

    pub async fn session_state(&self, participant: ParticipantId) -> Option<NegotiationState> {
        self.session(participant).await.map(|session| session.state())
    }

    pub async fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn queued_candidates(&self, participant: ParticipantId) -> Vec<RTCIceCandidateInit> {
        match self.session(participant).await {
            Some(session) => session.queued_candidates(),
            None => Vec::new(),
        }
    }

    pub async fn local_description(&self, participant: ParticipantId) -> Option<RTCSessionDescription> {
        let session = self.session(participant).await?;
        session.peer_connection().local_description().await
    }

    pub async fn remote_stream(&self, participant: ParticipantId) -> Option<RemoteMediaStream> {
        self.session(participant).await?.remote_stream()
    }

    async fn require(&self, participant: ParticipantId) -> Result<Arc<PeerSession>> {
        self.session(participant)
            .await
            .ok_or(SessionError::NoSession(participant))
    }

    /// Returns the existing session for `participant`, or creates one in `Idle`
    /// with every local track attached.
    pub async fn create_peer_session(&self, participant: ParticipantId) -> Result<Arc<PeerSession>> {
        if let Some(existing) = self.session(participant).await {
            return Ok(existing);
        }

        let session = self.build_session(participant).await?;

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&participant) {
            // Lost a creation race; keep the one already registered
            let existing = existing.clone();
            drop(sessions);
            session.mark_closed();
            let _ = session.peer_connection().close().await;
            return Ok(existing);
        }
        sessions.insert(participant, session.clone());
        drop(sessions);

        tracing::info!(participant, "Peer session created");
        Ok(session)
    }

    async fn build_session(&self, participant: ParticipantId) -> Result<Arc<PeerSession>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);
        let session = Arc::new(PeerSession::new(participant, peer_connection.clone()));
        register_callbacks(&session);

        if let Some(stream) = self.local_stream().await {
            for track in stream.tracks() {
                let sender = peer_connection
                    .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;

                // RTCP has to be read for the interceptors to process it
                tokio::spawn(async move {
                    let mut rtcp_buf = vec![0u8; 1500];
                    while sender.read(&mut rtcp_buf).await.is_ok() {}
                });
            }
        }

        Ok(session)
    }

    pub async fn setup_session_handlers<T, C, S>(
        &self,
        participant: ParticipantId,
        on_remote_track: T,
        on_local_ice_candidate: C,
        on_connection_state_change: S,
    ) -> Result<()>
    where
        T: Fn(ParticipantId, RemoteMediaStream) + Send + Sync + 'static,
        C: Fn(ParticipantId, RTCIceCandidateInit) + Send + Sync + 'static,
        S: Fn(ParticipantId, RTCPeerConnectionState) + Send + Sync + 'static,
    {
        let session = self.require(participant).await?;
        session.ensure_open()?;
        session.set_handlers(SessionHandlers {
            on_remote_track: Arc::new(on_remote_track),
            on_local_ice_candidate: Arc::new(on_local_ice_candidate),
            on_connection_state_change: Arc::new(on_connection_state_change),
        });
        Ok(())
    }

    /// Lets local candidates through once the description that produced them
    /// has been sent to the remote side.
    pub async fn release_local_candidates(&self, participant: ParticipantId) -> Result<()> {
        let session = self.require(participant).await?;
        session.ensure_open()?;
        session.release_local_candidates();
        Ok(())
    }

    pub async fn create_offer(&self, participant: ParticipantId) -> Result<RTCSessionDescription> {
        let session = self.require(participant).await?;
        let _guard = session.negotiation_guard().await;
        session.ensure_open()?;

        let state = session.state();
        if !matches!(
            state,
            NegotiationState::Idle | NegotiationState::LocalOfferCreated
        ) {
            return Err(SessionError::InvalidState {
                participant,
                state,
                operation: "create an offer",
            });
        }

        let peer_connection = session.peer_connection().clone();
        let result = async {
            if state == NegotiationState::Idle {
                self.ensure_receive_transceivers(&session).await?;
            }
            let offer = peer_connection.create_offer(None).await?;
            peer_connection.set_local_description(offer.clone()).await?;
            Ok::<_, webrtc::Error>(offer)
        }
        .await;

        let offer = settle(&session, "create offer", result)?;
        session.ensure_open()?;
        session.set_state(NegotiationState::LocalOfferCreated);

        tracing::info!(participant, "Local offer created");
        Ok(offer)
    }

    /// Adds a receive transceiver for each media kind no local track covers,
    /// so the offer still asks the remote side for it.
    async fn ensure_receive_transceivers(&self, session: &PeerSession) -> webrtc::error::Result<()> {
        let peer_connection = session.peer_connection();
        let transceivers = peer_connection.get_transceivers().await;

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            if !transceivers.iter().any(|t| t.kind() == kind) {
                peer_connection.add_transceiver_from_kind(kind, None).await?;
                tracing::debug!(participant = session.participant(), kind = %kind, "Added receive transceiver");
            }
        }
        Ok(())
    }

    pub async fn handle_answer(&self, participant: ParticipantId, answer: RTCSessionDescription) -> Result<()> {
        let session = self.require(participant).await?;
        let _guard = session.negotiation_guard().await;
        session.ensure_open()?;

        let state = session.state();
        if state != NegotiationState::LocalOfferCreated {
            return Err(SessionError::InvalidState {
                participant,
                state,
                operation: "apply an answer",
            });
        }

        let result = session.peer_connection().set_remote_description(answer).await;
        settle(&session, "apply answer", result)?;
        session.ensure_open()?;

        self.complete_exchange(&session).await;
        tracing::info!(participant, "Remote answer applied");
        Ok(())
    }

    /// Applies a remote offer and returns the committed answer. A session that
    /// already negotiated is replaced, keeping its handlers.
    pub async fn handle_remote_offer(
        &self,
        participant: ParticipantId,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        let session = match self.session(participant).await {
            Some(existing) if existing.state() == NegotiationState::Idle => existing,
            Some(existing) => self.replace_session(&existing).await?,
            None => self.create_peer_session(participant).await?,
        };

        let _guard = session.negotiation_guard().await;
        session.ensure_open()?;

        let state = session.state();
        if state != NegotiationState::Idle {
            return Err(SessionError::InvalidState {
                participant,
                state,
                operation: "apply a remote offer",
            });
        }

        let result = session.peer_connection().set_remote_description(offer).await;
        settle(&session, "apply offer", result)?;
        session.ensure_open()?;
        session.set_state(NegotiationState::RemoteOfferReceived);

        let peer_connection = session.peer_connection().clone();
        let result = async {
            let answer = peer_connection.create_answer(None).await?;
            peer_connection.set_local_description(answer.clone()).await?;
            Ok::<_, webrtc::Error>(answer)
        }
        .await;
        let answer = settle(&session, "create answer", result)?;
        session.ensure_open()?;

        self.complete_exchange(&session).await;
        tracing::info!(participant, "Remote offer answered");
        Ok(answer)
    }

    async fn replace_session(&self, previous: &Arc<PeerSession>) -> Result<Arc<PeerSession>> {
        let participant = previous.participant();
        let fresh = self.build_session(participant).await?;
        if let Some(handlers) = previous.handlers() {
            fresh.set_handlers(handlers);
        }

        self.sessions.write().await.insert(participant, fresh.clone());
        previous.mark_closed();
        if let Err(e) = previous.peer_connection().close().await {
            tracing::warn!(participant, error = %e, "Failed to close replaced peer connection");
        }

        tracing::info!(participant, previous_state = ?previous.state(), "Peer session replaced for renegotiation");
        Ok(fresh)
    }

    /// Records that both descriptions are committed and drains the candidates
    /// that arrived early, oldest first.
    async fn complete_exchange(&self, session: &PeerSession) {
        session.set_state(NegotiationState::DescriptionsExchanged);
        if session.peer_connection().connection_state() == RTCPeerConnectionState::Connected {
            session.set_state(NegotiationState::Connected);
        }

        let pending = session.take_remote_candidates();
        if pending.is_empty() {
            return;
        }

        tracing::info!(
            participant = session.participant(),
            count = pending.len(),
            "Applying queued ICE candidates"
        );
        for candidate in pending {
            if let Err(e) = session.peer_connection().add_ice_candidate(candidate).await {
                tracing::warn!(
                    participant = session.participant(),
                    error = %e,
                    "Failed to apply queued ICE candidate"
                );
            }
        }
    }

    pub async fn handle_ice_candidate(&self, participant: ParticipantId, candidate: RTCIceCandidateInit) -> Result<()> {
        let session = self.require(participant).await?;
        let _guard = session.negotiation_guard().await;
        session.ensure_open()?;

        match session.state() {
            NegotiationState::DescriptionsExchanged | NegotiationState::Connected => {
                // One unusable candidate leaves the others to connect
                match session.peer_connection().add_ice_candidate(candidate).await {
                    Ok(()) => tracing::debug!(participant, "Applied remote ICE candidate"),
                    Err(e) => tracing::warn!(participant, error = %e, "Rejected remote ICE candidate"),
                }
                Ok(())
            }
            NegotiationState::Idle
            | NegotiationState::LocalOfferCreated
            | NegotiationState::RemoteOfferReceived => {
                let queued = session.enqueue_remote_candidate(candidate);
                tracing::debug!(participant, queued, "Queued remote ICE candidate");
                Ok(())
            }
            state @ (NegotiationState::Failed | NegotiationState::Closed) => Err(SessionError::InvalidState {
                participant,
                state,
                operation: "apply an ICE candidate",
            }),
        }
    }

    /// Closes and forgets the session. Returns `false` if there was none.
    pub async fn close_peer_session(&self, participant: ParticipantId) -> bool {
        let removed = self.sessions.write().await.remove(&participant);
        match removed {
            Some(session) => {
                close_session(&session).await;
                tracing::info!(participant, "Peer session closed");
                true
            }
            None => false,
        }
    }

    /// Closes every session, then releases the local stream.
    pub async fn cleanup(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let closed = sessions.len();
        for session in sessions {
            close_session(&session).await;
        }

        let stream = self.local_stream.write().await.take();
        if let Some(stream) = stream {
            stream.stop();
        }

        if closed > 0 {
            tracing::info!(sessions = closed, "Peer sessions cleaned up");
        }
    }
}

async fn close_session(session: &PeerSession) {
    session.mark_closed();
    if let Err(e) = session.peer_connection().close().await {
        tracing::warn!(participant = session.participant(), error = %e, "Failed to close peer connection");
    }
}

/// Maps a webrtc failure on `session` to `Negotiation` and fails the session.
/// A session closed meanwhile reports `NoSession` instead.
fn settle<T>(session: &PeerSession, step: &str, result: std::result::Result<T, webrtc::Error>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(_) if session.is_closed() => Err(SessionError::NoSession(session.participant())),
        Err(e) => {
            session.set_state(NegotiationState::Failed);
            tracing::warn!(participant = session.participant(), step, error = %e, "Negotiation step failed");
            Err(SessionError::negotiation(session.participant(), format!("{}: {}", step, e)))
        }
    }
}

/// Routes webrtc callbacks into the session. Callbacks hold a weak reference
/// so a dropped session is never kept alive by its own connection.
fn register_callbacks(session: &Arc<PeerSession>) {
    let peer_connection = session.peer_connection();

    let weak: Weak<PeerSession> = Arc::downgrade(session);
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let weak = weak.clone();
        Box::pin(async move {
            let (Some(session), Some(candidate)) = (weak.upgrade(), candidate) else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => session.on_local_candidate(init),
                Err(e) => tracing::warn!(
                    participant = session.participant(),
                    error = %e,
                    "Failed to serialize local ICE candidate"
                ),
            }
        })
    }));

    let weak = Arc::downgrade(session);
    peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(session) = weak.upgrade() {
                session.on_remote_track(track);
            }
        })
    }));

    let weak = Arc::downgrade(session);
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(session) = weak.upgrade() {
                session.on_transport_state(state);
            }
        })
    }));
}
