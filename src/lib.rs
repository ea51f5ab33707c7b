//! Room-based signaling coordination for peer-to-peer audio/video calls.
//!
//! The coordinator side ([`server`]) tracks which connections belong to which
//! room and relays opaque session-description payloads between them. The
//! participant side ([`client`]) drives one [`client::PeerSession`] per remote
//! participant through the offer/answer state machine and fans sessions out as
//! the room changes. Media always flows directly between peers; the
//! coordinator never touches it.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::media::{LocalMedia, SessionConfig};
pub use client::orchestrator::{CallEvent, CallOrchestrator};
pub use client::session::{NegotiationState, PeerSession, Role, SessionState, TrackAttachment};
pub use client::signaling::SignalingClient;
pub use error::{Error, Result};
pub use protocol::{ClientEvent, ServerEvent};
pub use server::registry::{AllowAll, RoomAuthorizer, RoomRegistry};
pub use server::Coordinator;
