//! Participant side: signaling transport, per-remote peer sessions, and the
//! orchestrator that maps room membership onto sessions.

pub mod media;
pub mod orchestrator;
pub mod session;
pub mod signaling;
