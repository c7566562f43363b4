mod manager;
mod session;
pub mod webrtc_utils;

pub use manager::PeerSessionManager;
pub use session::{
    ConnectionStateHandler, LocalCandidateHandler, NegotiationState, PeerSession,
    RemoteMediaStream, RemoteTrackHandler,
};
