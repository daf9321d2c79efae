//! Mock TUN device for testing
//!
//! Simulates a raw packet interface entirely in memory: tests inject frames
//! that the device hands to `read`, and every frame passed to `write` is
//! captured for inspection. [`MockTun::pair`] wires two devices back to back
//! so frames written on one side surface as reads on the other, which is
//! enough to run a real client/server handshake inside a test.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use cloak_protocol::{BufferPool, DataBuffer};
use tokio::sync::Notify;
use tracing::trace;

use crate::device::{TunDevice, TunInfo};
use crate::error::{Error, Result};

/// In-memory TUN device with frame injection and capture.
pub struct MockTun {
    info: TunInfo,
    /// Frames waiting to be handed to `read`
    inbound: Mutex<VecDeque<Vec<u8>>>,
    readable: Notify,
    interrupted: AtomicBool,
    /// Device-owned buffers handed out by `read`
    pool: BufferPool,
    /// Every frame passed to `write`, in order
    written: Mutex<Vec<Vec<u8>>>,
    /// Loopback peer; frames written here are injected there
    peer: Mutex<Option<Weak<MockTun>>>,
}

impl MockTun {
    /// Create a standalone mock device.
    pub fn new(name: &str, mtu: u16) -> Arc<Self> {
        Arc::new(Self {
            info: TunInfo {
                name: name.to_string(),
                mtu,
            },
            inbound: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            interrupted: AtomicBool::new(false),
            pool: BufferPool::new(),
            written: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
        })
    }

    /// Create two devices wired back to back: frames written to one are
    /// injected into the other.
    pub fn pair(mtu: u16) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new("mock-a", mtu);
        let b = Self::new("mock-b", mtu);
        *a.peer.lock().expect("peer lock poisoned") = Some(Arc::downgrade(&b));
        *b.peer.lock().expect("peer lock poisoned") = Some(Arc::downgrade(&a));
        (a, b)
    }

    /// Queue a frame for delivery through `read`.
    pub fn inject(&self, frame: &[u8]) {
        self.inbound
            .lock()
            .expect("inbound lock poisoned")
            .push_back(frame.to_vec());
        self.readable.notify_waiters();
    }

    /// Snapshot of every frame written so far.
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.written.lock().expect("written lock poisoned").clone()
    }

    /// Number of frames written so far.
    pub fn written_count(&self) -> usize {
        self.written.lock().expect("written lock poisoned").len()
    }

    /// The most recently written frame, if any.
    pub fn last_written(&self) -> Option<Vec<u8>> {
        self.written
            .lock()
            .expect("written lock poisoned")
            .last()
            .cloned()
    }

    /// Forget all captured frames.
    pub fn clear_written(&self) {
        self.written.lock().expect("written lock poisoned").clear();
    }
}

#[async_trait]
impl TunDevice for MockTun {
    async fn read(&self) -> Option<DataBuffer> {
        loop {
            // Register for wakeup before checking state so an inject or
            // interrupt between the check and the await is not lost.
            let readable = self.readable.notified();

            if self.interrupted.load(Ordering::Acquire) {
                return None;
            }

            let frame = self
                .inbound
                .lock()
                .expect("inbound lock poisoned")
                .pop_front();

            if let Some(frame) = frame {
                let mut buf = self.pool.get();
                let len = frame.len().min(buf.capacity());
                buf.space()[..len].copy_from_slice(&frame[..len]);
                buf.set_len(len);
                return Some(buf);
            }

            readable.await;
        }
    }

    async fn write(&self, frame: &[u8]) -> Result<usize> {
        if self.interrupted.load(Ordering::Acquire) {
            return Ok(0);
        }
        if frame.len() > self.info.mtu as usize + cloak_protocol::HEADER_LEN {
            return Err(Error::FrameTooLarge {
                len: frame.len(),
                max: self.info.mtu as usize + cloak_protocol::HEADER_LEN,
            });
        }

        self.written
            .lock()
            .expect("written lock poisoned")
            .push(frame.to_vec());

        let peer = self.peer.lock().expect("peer lock poisoned").clone();
        if let Some(peer) = peer.and_then(|weak| weak.upgrade()) {
            trace!("{} -> {}: {} bytes", self.info.name, peer.info.name, frame.len());
            peer.inject(frame);
        }

        Ok(frame.len())
    }

    fn recycle(&self, buf: DataBuffer) {
        self.pool.put(buf);
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.readable.notify_waiters();
    }

    fn info(&self) -> &TunInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_inject_then_read() {
        let tun = MockTun::new("tun-test", 1500);
        tun.inject(&[1, 2, 3]);

        let buf = tun.read().await.unwrap();
        assert_eq!(buf.bytes(), &[1, 2, 3]);
        tun.recycle(buf);
    }

    #[tokio::test]
    async fn test_read_blocks_until_inject() {
        let tun = MockTun::new("tun-test", 1500);

        let reader = {
            let tun = Arc::clone(&tun);
            tokio::spawn(async move { tun.read().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        tun.inject(&[7]);
        let buf = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(buf.bytes(), &[7]);
    }

    #[tokio::test]
    async fn test_interrupt_releases_reader() {
        let tun = MockTun::new("tun-test", 1500);

        let reader = {
            let tun = Arc::clone(&tun);
            tokio::spawn(async move { tun.read().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        tun.interrupt();

        let result = timeout(Duration::from_secs(1), reader).await.unwrap();
        assert!(result.unwrap().is_none());

        // Terminal: later reads and writes return the sentinel immediately.
        assert!(tun.read().await.is_none());
        assert_eq!(tun.write(&[1]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_captured() {
        let tun = MockTun::new("tun-test", 1500);
        tun.write(&[9, 9]).await.unwrap();
        tun.write(&[8]).await.unwrap();

        assert_eq!(tun.written_count(), 2);
        assert_eq!(tun.written_frames()[0], vec![9, 9]);
        assert_eq!(tun.last_written().unwrap(), vec![8]);
    }

    #[tokio::test]
    async fn test_pair_loopback() {
        let (a, b) = MockTun::pair(1500);

        a.write(&[1, 2, 3]).await.unwrap();
        let buf = b.read().await.unwrap();
        assert_eq!(buf.bytes(), &[1, 2, 3]);
        b.recycle(buf);

        b.write(&[4]).await.unwrap();
        let buf = a.read().await.unwrap();
        assert_eq!(buf.bytes(), &[4]);
        a.recycle(buf);
    }
}
