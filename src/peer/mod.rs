//! WebRTC peer connection management
//!
//! Handles peer lifecycle, offer/answer negotiation, and the per-session
//! media wiring between the camera relay and each remote peer.

pub mod connection;
pub mod manager;
pub mod state;

pub use connection::PeerSession;
pub use manager::{ConnectionInfo, NegotiatedAnswer, PeerManager};
pub use state::{ConnectionEvent, ConnectionState};
