//! Reusable frame buffers
//!
//! Hot paths encode one frame per upper-layer write; pooling the buffers
//! keeps those paths allocation-free. Buffers have a fixed capacity of
//! [`IFACE_BUFSIZE`](crate::IFACE_BUFSIZE) bytes and a writable length, and
//! move between the upper layer, the bounded queue and the device writer
//! before returning to the pool.

use std::sync::Mutex;

use crate::IFACE_BUFSIZE;

/// Maximum number of idle buffers the pool retains
const MAX_POOL_SIZE: usize = 64;

/// A fixed-capacity byte buffer with an explicit payload length.
#[derive(Debug)]
pub struct DataBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl DataBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// The valid bytes of this buffer
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The full writable capacity
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Current payload length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no payload
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the payload length after writing into [`space`](Self::space).
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len());
        self.len = len;
    }

    /// Buffer capacity in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// A thread-safe pool of [`DataBuffer`]s with explicit acquire/release.
///
/// `get` never blocks: it pops an idle buffer or allocates a fresh one.
/// `put` resets the buffer's length and retains it up to a bounded idle
/// count, dropping the surplus.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<DataBuffer>>,
    buf_capacity: usize,
}

impl BufferPool {
    /// Create a pool of [`IFACE_BUFSIZE`](crate::IFACE_BUFSIZE)-byte buffers.
    pub fn new() -> Self {
        Self::with_capacity(IFACE_BUFSIZE)
    }

    /// Create a pool handing out buffers of `buf_capacity` bytes.
    pub fn with_capacity(buf_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buf_capacity,
        }
    }

    /// Acquire a buffer. Never blocks; allocates when the pool is empty.
    pub fn get(&self) -> DataBuffer {
        self.free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| DataBuffer::new(self.buf_capacity))
    }

    /// Release a buffer back to the pool.
    pub fn put(&self, mut buf: DataBuffer) {
        buf.len = 0;
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < MAX_POOL_SIZE {
            free.push(buf);
        }
    }

    /// Number of idle buffers currently retained
    pub fn idle(&self) -> usize {
        self.free.lock().expect("buffer pool lock poisoned").len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
