use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{Result, SessionError};
use crate::identity::ParticipantId;

/// Event names understood on the signaling wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalEvent {
    JoinRequest,
    WebrtcOffer,
    WebrtcAnswer,
    IceCandidate,
    StartExam,
    ExamCompleted,
    ExamEnd,
    StudentLeft,
}

impl SignalEvent {
    pub const ALL: [SignalEvent; 8] = [
        SignalEvent::JoinRequest,
        SignalEvent::WebrtcOffer,
        SignalEvent::WebrtcAnswer,
        SignalEvent::IceCandidate,
        SignalEvent::StartExam,
        SignalEvent::ExamCompleted,
        SignalEvent::ExamEnd,
        SignalEvent::StudentLeft,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalEvent::JoinRequest => "join-request",
            SignalEvent::WebrtcOffer => "webrtc-offer",
            SignalEvent::WebrtcAnswer => "webrtc-answer",
            SignalEvent::IceCandidate => "ice-candidate",
            SignalEvent::StartExam => "start-exam",
            SignalEvent::ExamCompleted => "exam-completed",
            SignalEvent::ExamEnd => "exam-end",
            SignalEvent::StudentLeft => "student-left",
        }
    }
}

impl fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalEvent {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        SignalEvent::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| SessionError::malformed(format!("unknown event '{}'", s)))
    }
}

/// Exam outcome reported by a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamResult {
    pub score: u32,
    pub answers: Vec<Option<u32>>,
}

/// Typed view of an envelope's `message`, keyed by its event.
#[derive(Debug, Clone)]
pub enum SignalPayload {
    JoinRequest,
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    IceCandidate(RTCIceCandidateInit),
    StartExam,
    ExamCompleted(ExamResult),
    ExamEnd,
    StudentLeft,
}

impl SignalPayload {
    pub fn event(&self) -> SignalEvent {
        match self {
            SignalPayload::JoinRequest => SignalEvent::JoinRequest,
            SignalPayload::Offer(_) => SignalEvent::WebrtcOffer,
            SignalPayload::Answer(_) => SignalEvent::WebrtcAnswer,
            SignalPayload::IceCandidate(_) => SignalEvent::IceCandidate,
            SignalPayload::StartExam => SignalEvent::StartExam,
            SignalPayload::ExamCompleted(_) => SignalEvent::ExamCompleted,
            SignalPayload::ExamEnd => SignalEvent::ExamEnd,
            SignalPayload::StudentLeft => SignalEvent::StudentLeft,
        }
    }

    fn encode(&self) -> Result<String> {
        let encoded = match self {
            SignalPayload::Offer(description) | SignalPayload::Answer(description) => {
                serde_json::to_string(description)?
            }
            SignalPayload::IceCandidate(candidate) => serde_json::to_string(candidate)?,
            SignalPayload::ExamCompleted(result) => serde_json::to_string(result)?,
            SignalPayload::JoinRequest
            | SignalPayload::StartExam
            | SignalPayload::ExamEnd
            | SignalPayload::StudentLeft => String::new(),
        };
        Ok(encoded)
    }

    fn decode(event: SignalEvent, message: &str) -> Result<Self> {
        let payload = match event {
            SignalEvent::JoinRequest => SignalPayload::JoinRequest,
            SignalEvent::StartExam => SignalPayload::StartExam,
            SignalEvent::ExamEnd => SignalPayload::ExamEnd,
            SignalEvent::StudentLeft => SignalPayload::StudentLeft,
            SignalEvent::WebrtcOffer => {
                SignalPayload::Offer(decode_description(event, message, RTCSdpType::Offer)?)
            }
            SignalEvent::WebrtcAnswer => {
                SignalPayload::Answer(decode_description(event, message, RTCSdpType::Answer)?)
            }
            SignalEvent::IceCandidate => {
                let candidate: RTCIceCandidateInit = decode_json(event, message)?;
                SignalPayload::IceCandidate(candidate)
            }
            SignalEvent::ExamCompleted => SignalPayload::ExamCompleted(decode_json(event, message)?),
        };
        Ok(payload)
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(event: SignalEvent, message: &str) -> Result<T> {
    serde_json::from_str(message)
        .map_err(|e| SessionError::malformed(format!("{} payload: {}", event, e)))
}

fn decode_description(
    event: SignalEvent,
    message: &str,
    expected: RTCSdpType,
) -> Result<RTCSessionDescription> {
    let description: RTCSessionDescription = decode_json(event, message)?;
    if description.sdp_type != expected {
        return Err(SessionError::malformed(format!(
            "{} carries a {} description",
            event, description.sdp_type
        )));
    }
    if description.sdp.trim().is_empty() {
        return Err(SessionError::malformed(format!("{} has an empty sdp", event)));
    }
    Ok(description)
}

/// The wire envelope exchanged with the coordination server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub event: String,
    #[serde(default)]
    pub message: String,
    pub participant: ParticipantId,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_sender_id"
    )]
    pub sender_id: Option<String>,
}

/// Servers are inconsistent about quoting `sender_id`.
fn lenient_sender_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSender {
        Text(String),
        Number(i64),
    }

    Ok(Option::<RawSender>::deserialize(deserializer)?.map(|raw| match raw {
        RawSender::Text(text) => text,
        RawSender::Number(number) => number.to_string(),
    }))
}

impl SignalingMessage {
    pub fn new(
        payload: &SignalPayload,
        participant: ParticipantId,
        sender: Option<ParticipantId>,
    ) -> Result<Self> {
        Ok(Self {
            event: payload.event().as_str().to_string(),
            message: payload.encode()?,
            participant,
            sender_id: sender.map(|id| id.to_string()),
        })
    }

    /// Parses one inbound text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SessionError::malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn signal_event(&self) -> Option<SignalEvent> {
        self.event.parse().ok()
    }

    /// Decodes `message` into the payload variant selected by `event`.
    pub fn payload(&self) -> Result<SignalPayload> {
        let event: SignalEvent = self.event.parse()?;
        SignalPayload::decode(event, &self.message)
    }

    /// The party this message came from: `sender_id` when it is present and
    /// numeric, otherwise `participant`.
    pub fn origin(&self) -> ParticipantId {
        self.sender_id
            .as_deref()
            .and_then(|sender| sender.trim().parse().ok())
            .unwrap_or(self.participant)
    }
}
