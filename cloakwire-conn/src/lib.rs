//! Client and server connections for the cloakwire tunnel
//!
//! Each endpoint owns a raw packet interface and runs one connection toward
//! one peer. The client initiates a TCP-shaped handshake, keeps the session
//! alive with heartbeats and tears everything down when the peer goes
//! silent; the server accepts one handshake at a time and returns to
//! accepting after any error, so a single instance outlives many sessions.
//!
//! The TCP shape exists to cross middleboxes, nothing more: there is no
//! retransmission and no reordering, and a frame is trusted only when its
//! window field carries the tunnel's magic marker.

pub mod client;
pub mod config;
pub mod event;
pub mod keeper;
pub mod server;

pub use client::ClientConn;
pub use config::ConnConfig;
pub use event::{ClientHandler, ServerHandler};
pub use keeper::Keeper;
pub use server::ServerConn;

/// Initial sequence number used by both endpoints.
///
/// Deliberately fixed rather than random; the handshake arithmetic is
/// documented in terms of these constants.
pub const INITIAL_SEQ: u32 = 1000;

/// Acknowledgment number carried on the client's SYN.
pub const INITIAL_ACK: u32 = 1100;
