//! Wire codec and data structures for the cloakwire tunnel.
//!
//! The tunnel carries arbitrary datagrams framed as plain TCP/IPv4 segments
//! so they traverse middleboxes unmolested. This crate holds the pieces the
//! connection layer is built from: the [`ConnPacket`] codec, the reusable
//! [`BufferPool`], the interruptible [`BoundedQueue`] and the table-driven
//! [`Fsm`] that drives both endpoints.
//!
//! None of this is a TCP implementation. The framing is shaped like TCP and
//! checksums like TCP, but there is no retransmission, no reordering and no
//! window management; the window field doubles as an in-band marker instead.

mod buffer_pool;
mod error;
mod flags;
mod fsm;
mod packet;
mod queue;

pub use buffer_pool::{BufferPool, DataBuffer};
pub use error::{Error, Result};
pub use flags::TcpFlags;
pub use fsm::{Event, Fsm};
pub use packet::{ConnPacket, HEADER_LEN, IPV4_HEADER_LEN, TCP_HEADER_LEN};
pub use queue::BoundedQueue;

/// Magic value carried in the TCP window field of every tunnel frame.
///
/// Frames arriving with any other window are unrelated TCP traffic that
/// happened to reach the device and must be dropped.
pub const MAGIC_WINDOW: u16 = 6543;

/// Fixed capacity of pooled frame buffers (MTU plus headroom).
pub const IFACE_BUFSIZE: usize = 2000;
