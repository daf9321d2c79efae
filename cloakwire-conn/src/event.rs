//! Handler seams toward the upper layer
//!
//! Connections never surface errors synchronously; everything the upper
//! layer learns arrives through these callbacks. They run on the
//! device-reader task and therefore must not block; a handler that stalls
//! stalls the whole receive path.

use std::sync::Arc;

use crate::{ClientConn, ServerConn};

/// Callbacks of a client connection's upper layer.
pub trait ClientHandler: Send + Sync {
    /// The handshake completed; the tunnel is usable.
    fn on_connect(&self, conn: &Arc<ClientConn>);

    /// One payload arrived from the peer.
    fn on_data(&self, payload: &[u8]);

    /// The connection is gone: handshake timeout, peer reset or dead peer.
    /// Invoked exactly once per connection.
    fn on_disconnect(&self, conn: &Arc<ClientConn>);
}

/// Callbacks of a server connection's upper layer.
pub trait ServerHandler: Send + Sync {
    /// A client completed the handshake.
    fn on_connect(&self, _conn: &Arc<ServerConn>) {}

    /// One payload arrived from the current peer.
    fn on_data(&self, payload: &[u8], conn: &Arc<ServerConn>);

    /// The current session ended; the server is accepting again.
    fn on_disconnect(&self);
}
