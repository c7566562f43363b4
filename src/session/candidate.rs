use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;

use super::{RoleBehavior, SessionEvent, SessionOrchestrator};
use crate::error::{Result, SessionError};
use crate::identity::{ParticipantId, Role};
use crate::lock;
use crate::peer::RemoteMediaStream;
use crate::signaling::{ExamResult, SignalEvent, SignalPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamState {
    Locked,
    InProgress,
    Finished,
}

impl fmt::Display for ExamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExamState::Locked => "locked",
            ExamState::InProgress => "in progress",
            ExamState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// The examinee side: answers the proctor's offer and follows its exam
/// controls.
pub struct CandidateRole {
    exam: watch::Sender<ExamState>,
    proctor: StdMutex<Option<ParticipantId>>,
    proctor_stream: StdMutex<Option<RemoteMediaStream>>,
}

impl CandidateRole {
    pub fn new() -> Self {
        let (exam, _) = watch::channel(ExamState::Locked);
        Self {
            exam,
            proctor: StdMutex::new(None),
            proctor_stream: StdMutex::new(None),
        }
    }

    pub fn exam_state(&self) -> ExamState {
        *self.exam.borrow()
    }

    pub fn exam_updates(&self) -> watch::Receiver<ExamState> {
        self.exam.subscribe()
    }

    pub fn proctor_id(&self) -> Option<ParticipantId> {
        *lock(&self.proctor)
    }

    pub fn proctor_stream(&self) -> Option<RemoteMediaStream> {
        lock(&self.proctor_stream).clone()
    }

    /// Moves the exam to `next` if it is currently `from`.
    fn advance(&self, from: ExamState, next: ExamState) -> bool {
        self.exam.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = next;
            true
        })
    }
}

impl Default for CandidateRole {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoleBehavior for CandidateRole {
    const ROLE: Role = Role::Candidate;

    fn subscriptions() -> &'static [SignalEvent] {
        &[
            SignalEvent::WebrtcOffer,
            SignalEvent::StartExam,
            SignalEvent::ExamEnd,
        ]
    }

    fn address(own: ParticipantId, _remote: ParticipantId) -> ParticipantId {
        own
    }

    async fn on_signal(
        session: &Arc<SessionOrchestrator<Self>>,
        origin: ParticipantId,
        payload: SignalPayload,
    ) -> Result<()> {
        match payload {
            SignalPayload::Offer(offer) => {
                let previous = lock(&session.role().proctor).replace(origin);
                if previous.is_some_and(|id| id != origin) {
                    tracing::warn!(previous = ?previous, proctor = origin, "Offer from a different proctor");
                }
                session.answer_offer(origin, offer).await
            }
            SignalPayload::StartExam => {
                if session.role().advance(ExamState::Locked, ExamState::InProgress) {
                    tracing::info!(proctor = origin, "Exam unlocked");
                    session.emit(SessionEvent::ExamStarted);
                } else {
                    tracing::debug!(state = %session.role().exam_state(), "Ignoring start-exam");
                }
                Ok(())
            }
            SignalPayload::ExamEnd => {
                let ended = session.role().advance(ExamState::InProgress, ExamState::Finished)
                    || session.role().advance(ExamState::Locked, ExamState::Finished);
                if ended {
                    tracing::info!(proctor = origin, "Exam ended by proctor");
                    session.emit(SessionEvent::ExamEnded);
                }
                Ok(())
            }
            other => {
                tracing::debug!(event = %other.event(), origin, "Event not handled by candidate");
                Ok(())
            }
        }
    }

    fn on_remote_stream(&self, _participant: ParticipantId, stream: &RemoteMediaStream) {
        *lock(&self.proctor_stream) = Some(stream.clone());
    }

    async fn on_peer_failed(
        session: &Arc<SessionOrchestrator<Self>>,
        participant: ParticipantId,
        reason: String,
    ) {
        // The proctor re-offers; nothing to restart from this side
        tracing::warn!(proctor = participant, reason = %reason, "Peer connection to proctor failed");
        session.emit(SessionEvent::NegotiationFailed {
            participant,
            reason,
        });
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "exam_state": self.exam_state(),
            "proctor_id": self.proctor_id(),
            "proctor_streaming": lock(&self.proctor_stream).is_some(),
        })
    }
}

impl SessionOrchestrator<CandidateRole> {
    /// Reports the finished exam to the proctor.
    pub async fn submit_result(&self, result: ExamResult) -> Result<()> {
        let state = self.role().exam_state();
        if state != ExamState::InProgress {
            return Err(SessionError::ExamNotInProgress {
                state: state.to_string(),
                operation: "submit a result",
            });
        }

        let proctor = self.role().proctor_id().unwrap_or(self.own_id());
        self.relay(proctor, &SignalPayload::ExamCompleted(result))?;
        self.role().advance(ExamState::InProgress, ExamState::Finished);
        tracing::info!("Exam result submitted");
        Ok(())
    }

    pub fn exam_state(&self) -> ExamState {
        self.role().exam_state()
    }

    pub fn exam_updates(&self) -> watch::Receiver<ExamState> {
        self.role().exam_updates()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exam_advances_in_order() {
        let role = CandidateRole::new();
        let updates = role.exam_updates();

        assert!(!role.advance(ExamState::InProgress, ExamState::Finished));
        assert_eq!(role.exam_state(), ExamState::Locked);

        assert!(role.advance(ExamState::Locked, ExamState::InProgress));
        assert!(!role.advance(ExamState::Locked, ExamState::InProgress));
        assert_eq!(*updates.borrow(), ExamState::InProgress);
    }

    #[test]
    fn test_describe_reports_exam_state() {
        let role = CandidateRole::new();
        let described = role.describe();
        assert_eq!(described["exam_state"], "locked");
        assert!(described["proctor_id"].is_null());
    }
}
