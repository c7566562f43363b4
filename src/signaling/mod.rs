mod channel;
mod message;
mod reconnect;

pub use channel::{ConnectionState, MessageHandler, SignalingChannel};
pub use message::{ExamResult, SignalEvent, SignalPayload, SignalingMessage};
pub use reconnect::ReconnectPolicy;
