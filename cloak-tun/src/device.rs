//! The device trait consumed by the connection layer

use async_trait::async_trait;
use cloak_protocol::DataBuffer;

use crate::error::Result;

/// Information about a TUN device
#[derive(Debug, Clone)]
pub struct TunInfo {
    /// Interface name (e.g., "tun0", "utun3")
    pub name: String,
    /// Maximum transmission unit size
    pub mtu: u16,
}

/// One raw packet interface.
///
/// Frames read from the device arrive in buffers the device owns; every
/// consumer path must hand them back through [`recycle`](Self::recycle),
/// including paths that drop the frame. [`interrupt`](Self::interrupt) is the
/// teardown signal: idempotent and terminal, it releases every blocked reader
/// and makes all subsequent reads and writes return the zero sentinel.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one frame, blocking until one is available.
    ///
    /// Returns `None` once the device has been interrupted.
    async fn read(&self) -> Option<DataBuffer>;

    /// Write one frame. Returns the number of bytes written; `Ok(0)` once
    /// the device has been interrupted.
    async fn write(&self, frame: &[u8]) -> Result<usize>;

    /// Return a buffer handed out by [`read`](Self::read).
    fn recycle(&self, buf: DataBuffer);

    /// Interrupt the device. Idempotent.
    fn interrupt(&self);

    /// Information about the device
    fn info(&self) -> &TunInfo;

    /// Interface name
    fn name(&self) -> &str {
        &self.info().name
    }

    /// Interface MTU
    fn mtu(&self) -> u16 {
        self.info().mtu
    }
}
