//! TUN device abstraction for the cloakwire tunnel
//!
//! The connection layer talks to a raw packet interface through the
//! [`TunDevice`] trait: read one frame at a time into device-owned buffers,
//! write frames back, recycle buffers after use, and interrupt the device to
//! release every blocked reader during teardown.
//!
//! The [`mock`] module provides an in-memory implementation with frame
//! injection and capture, plus a back-to-back device pair that lets a client
//! and a server converse inside a test.

pub mod device;
pub mod error;
pub mod mock;

pub use device::{TunDevice, TunInfo};
pub use error::{Error, Result};
