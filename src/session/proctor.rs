use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::json;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::{RoleBehavior, SessionEvent, SessionOrchestrator};
use crate::error::{Result, SessionError};
use crate::identity::{ParticipantId, Role};
use crate::lock;
use crate::peer::{NegotiationState, RemoteMediaStream};
use crate::signaling::{ExamResult, SignalEvent, SignalPayload};

/// One candidate on the proctor's roster.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub stream: Option<RemoteMediaStream>,
    pub result: Option<ExamResult>,
}

impl Participant {
    fn new(id: ParticipantId) -> Self {
        Self {
            id,
            name: format!("Student {}", id),
            stream: None,
            result: None,
        }
    }
}

/// Supervises any number of candidates, offering to each one that announces
/// itself.
pub struct ProctorRole {
    roster: StdMutex<BTreeMap<ParticipantId, Participant>>,
    restarts: StdMutex<HashMap<ParticipantId, u32>>,
    max_restarts: u32,
}

impl ProctorRole {
    pub fn new(max_restarts: u32) -> Self {
        Self {
            roster: StdMutex::new(BTreeMap::new()),
            restarts: StdMutex::new(HashMap::new()),
            max_restarts,
        }
    }

    /// Adds `participant` if absent. Returns `true` when it was added.
    fn upsert(&self, participant: ParticipantId) -> bool {
        let mut roster = lock(&self.roster);
        if roster.contains_key(&participant) {
            return false;
        }
        roster.insert(participant, Participant::new(participant));
        true
    }

    fn contains(&self, participant: ParticipantId) -> bool {
        lock(&self.roster).contains_key(&participant)
    }

    fn remove(&self, participant: ParticipantId) -> bool {
        lock(&self.restarts).remove(&participant);
        lock(&self.roster).remove(&participant).is_some()
    }

    /// Stores the result on the roster entry. Returns `false` for a
    /// participant that is not on the roster.
    fn record_result(&self, participant: ParticipantId, result: ExamResult) -> bool {
        match lock(&self.roster).get_mut(&participant) {
            Some(entry) => {
                entry.result = Some(result);
                true
            }
            None => {
                tracing::trace!(participant, "Result for a participant not on the roster, ignoring");
                false
            }
        }
    }

    /// Counts a restart. Returns `false` once the budget is spent.
    fn take_restart(&self, participant: ParticipantId) -> bool {
        let mut restarts = lock(&self.restarts);
        let used = restarts.entry(participant).or_insert(0);
        if *used >= self.max_restarts {
            return false;
        }
        *used += 1;
        true
    }

    pub fn participants(&self) -> Vec<Participant> {
        lock(&self.roster).values().cloned().collect()
    }
}

impl Default for ProctorRole {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl RoleBehavior for ProctorRole {
    const ROLE: Role = Role::Proctor;

    fn subscriptions() -> &'static [SignalEvent] {
        &[
            SignalEvent::JoinRequest,
            SignalEvent::WebrtcAnswer,
            SignalEvent::StudentLeft,
            SignalEvent::ExamCompleted,
        ]
    }

    fn address(_own: ParticipantId, remote: ParticipantId) -> ParticipantId {
        remote
    }

    async fn on_signal(
        session: &Arc<SessionOrchestrator<Self>>,
        origin: ParticipantId,
        payload: SignalPayload,
    ) -> Result<()> {
        match payload {
            SignalPayload::JoinRequest => session.handle_join(origin).await,
            SignalPayload::Answer(answer) => session.peers().handle_answer(origin, answer).await,
            SignalPayload::StudentLeft => {
                session.remove_participant(origin).await;
                Ok(())
            }
            SignalPayload::ExamCompleted(result) => {
                if !session.role().record_result(origin, result.clone()) {
                    return Ok(());
                }
                tracing::info!(participant = origin, score = result.score, "Exam completed");
                session.emit(SessionEvent::ExamCompleted {
                    participant: origin,
                    result,
                });
                Ok(())
            }
            other => {
                tracing::debug!(event = %other.event(), origin, "Event not handled by proctor");
                Ok(())
            }
        }
    }

    fn on_remote_stream(&self, participant: ParticipantId, stream: &RemoteMediaStream) {
        if let Some(entry) = lock(&self.roster).get_mut(&participant) {
            entry.stream = Some(stream.clone());
        }
    }

    fn on_peer_state(&self, participant: ParticipantId, transport: RTCPeerConnectionState) {
        if transport == RTCPeerConnectionState::Connected {
            lock(&self.restarts).remove(&participant);
        }
    }

    async fn on_peer_failed(
        session: &Arc<SessionOrchestrator<Self>>,
        participant: ParticipantId,
        reason: String,
    ) {
        session.restart_peer(participant, reason).await;
    }

    fn describe(&self) -> serde_json::Value {
        let roster: Vec<_> = lock(&self.roster)
            .values()
            .map(|p| {
                let has = |kind| p.stream.as_ref().is_some_and(|s| s.has_kind(kind));
                json!({
                    "id": p.id,
                    "name": p.name,
                    "streaming": p.stream.is_some(),
                    "video": has(RTPCodecType::Video),
                    "audio": has(RTPCodecType::Audio),
                    "result": p.result,
                })
            })
            .collect();
        json!({ "participants": roster })
    }
}

impl SessionOrchestrator<ProctorRole> {
    async fn handle_join(self: &Arc<Self>, participant: ParticipantId) -> Result<()> {
        if self.role().upsert(participant) {
            tracing::info!(participant, "Candidate joined");
            self.emit(SessionEvent::ParticipantJoined(participant));
        }

        match self.peers().session_state(participant).await {
            None | Some(NegotiationState::Idle) => self.offer_to(participant).await,
            Some(NegotiationState::Closed) => {
                self.peers().close_peer_session(participant).await;
                self.offer_to(participant).await
            }
            Some(NegotiationState::LocalOfferCreated) => {
                // The first offer may have been lost; send the committed one again
                let offer = self
                    .peers()
                    .local_description(participant)
                    .await
                    .ok_or(SessionError::NoSession(participant))?;
                self.relay(participant, &SignalPayload::Offer(offer))?;
                self.peers().release_local_candidates(participant).await?;
                tracing::info!(participant, "Re-sent pending offer");
                Ok(())
            }
            Some(NegotiationState::Failed) => {
                self.restart_peer(participant, "rejoined after failure".to_string())
                    .await;
                Ok(())
            }
            Some(state) => {
                tracing::debug!(participant, state = ?state, "Candidate already negotiated, ignoring join");
                Ok(())
            }
        }
    }

    /// Tears down the failed session and offers again, within the restart budget.
    async fn restart_peer(self: &Arc<Self>, participant: ParticipantId, reason: String) {
        if !self.role().contains(participant) {
            return;
        }
        if !self.role().take_restart(participant) {
            tracing::error!(participant, reason = %reason, "Peer restarts exhausted");
            self.peers().close_peer_session(participant).await;
            self.emit(SessionEvent::NegotiationFailed {
                participant,
                reason,
            });
            return;
        }

        tracing::warn!(participant, reason = %reason, "Restarting peer session");
        self.peers().close_peer_session(participant).await;
        if let Err(e) = self.offer_to(participant).await {
            tracing::warn!(participant, error = %e, "Restart offer failed");
        }
    }

    pub async fn start_exam(&self, participant: ParticipantId) -> Result<()> {
        self.send_control(participant, SignalPayload::StartExam)
    }

    pub async fn end_exam(&self, participant: ParticipantId) -> Result<()> {
        self.send_control(participant, SignalPayload::ExamEnd)
    }

    fn send_control(&self, participant: ParticipantId, payload: SignalPayload) -> Result<()> {
        if !self.role().contains(participant) {
            return Err(SessionError::NoSession(participant));
        }
        self.relay(participant, &payload)?;
        tracing::info!(participant, event = %payload.event(), "Sent exam control");
        Ok(())
    }

    /// Closes the participant's peer session and drops it from the roster.
    pub async fn remove_participant(&self, participant: ParticipantId) -> bool {
        let closed = self.peers().close_peer_session(participant).await;
        let removed = self.role().remove(participant);
        if closed || removed {
            tracing::info!(participant, "Candidate removed");
            self.emit(SessionEvent::ParticipantLeft(participant));
        }
        removed
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.role().participants()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roster_upsert_never_duplicates() {
        let role = ProctorRole::default();
        assert!(role.upsert(7));
        assert!(!role.upsert(7));
        assert!(role.upsert(3));

        let ids: Vec<_> = role.participants().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 7]);
        assert_eq!(role.participants()[1].name, "Student 7");
    }

    #[test]
    fn test_restart_budget() {
        let role = ProctorRole::new(2);
        assert!(role.take_restart(4));
        assert!(role.take_restart(4));
        assert!(!role.take_restart(4));

        // A connected peer earns a fresh budget
        role.on_peer_state(4, RTCPeerConnectionState::Connected);
        assert!(role.take_restart(4));
    }

    #[test]
    fn test_result_recorded_on_roster() {
        let role = ProctorRole::default();
        role.upsert(9);
        assert!(role.record_result(
            9,
            ExamResult {
                score: 4,
                answers: vec![Some(1), None],
            },
        ));

        let described = role.describe();
        assert_eq!(described["participants"][0]["result"]["score"], 4);
        assert_eq!(described["participants"][0]["streaming"], false);
        assert_eq!(described["participants"][0]["video"], false);
        assert!(role.remove(9));
        assert!(role.participants().is_empty());
    }

    #[test]
    fn test_result_for_unknown_participant_is_ignored() {
        let role = ProctorRole::default();
        let result = ExamResult {
            score: 1,
            answers: vec![Some(2)],
        };

        assert!(!role.record_result(5, result.clone()));
        assert!(role.participants().is_empty());

        // A participant that already left stays off the roster
        role.upsert(6);
        role.remove(6);
        assert!(!role.record_result(6, result));
        assert!(role.participants().is_empty());
    }
}
