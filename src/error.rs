use thiserror::Error;

/// Crate-wide error type.
///
/// Negotiation violations are deliberately their own variant: the orchestrator
/// logs and drops the offending message instead of propagating, so one bad
/// remote participant cannot take down the others.
#[derive(Debug, Error)]
pub enum Error {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("negotiation violation: {0}")]
    Negotiation(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("room error: {0}")]
    Room(String),
}

pub type Result<T> = std::result::Result<T, Error>;
