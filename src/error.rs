use thiserror::Error;

use crate::identity::ParticipantId;
use crate::peer::NegotiationState;

/// Error taxonomy for the signaling and peer-session layer
#[derive(Debug, Error)]
pub enum SessionError {
    /// Signaling transport errors
    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Malformed signaling message: {0}")]
    MalformedMessage(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Media errors
    #[error("Failed to acquire local media: {0}")]
    MediaAcquisition(String),

    /// Peer session errors
    #[error("No peer session for participant {0}")]
    NoSession(ParticipantId),

    #[error("Cannot {operation} for participant {participant} in state {state:?}")]
    InvalidState {
        participant: ParticipantId,
        state: NegotiationState,
        operation: &'static str,
    },

    #[error("Negotiation failed for participant {participant}: {reason}")]
    Negotiation {
        participant: ParticipantId,
        reason: String,
    },

    #[error("Cannot {operation} while the exam is {state}")]
    ExamNotInProgress {
        state: String,
        operation: &'static str,
    },

    /// WebRTC API errors
    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    pub fn transport(msg: impl Into<String>) -> Self {
        SessionError::Transport(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        SessionError::MalformedMessage(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        SessionError::Configuration(msg.into())
    }

    pub fn negotiation(participant: ParticipantId, reason: impl ToString) -> Self {
        SessionError::Negotiation {
            participant,
            reason: reason.to_string(),
        }
    }

    /// Errors caused by a session that is gone or not ready, as opposed to a
    /// genuine negotiation fault.
    pub fn is_rejected_operation(&self) -> bool {
        matches!(
            self,
            SessionError::NoSession(_)
                | SessionError::InvalidState { .. }
                | SessionError::ExamNotInProgress { .. }
        )
    }
}

impl From<webrtc::Error> for SessionError {
    fn from(err: webrtc::Error) -> Self {
        SessionError::WebRtcApi(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Authentication(err.to_string())
    }
}
