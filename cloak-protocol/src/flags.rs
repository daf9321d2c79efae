//! TCP flag byte handling

use std::fmt;

/// TCP flag bit constants (low byte of the flags field)
pub mod consts {
    /// No more data from sender
    pub const TCP_FLG_FIN: u8 = 0x01;
    /// Synchronize sequence numbers
    pub const TCP_FLG_SYN: u8 = 0x02;
    /// Reset the connection
    pub const TCP_FLG_RST: u8 = 0x04;
    /// Push function; the tunnel uses it to mark heartbeats
    pub const TCP_FLG_PSH: u8 = 0x08;
    /// Acknowledgment field significant
    pub const TCP_FLG_ACK: u8 = 0x10;
}

/// TCP flags wrapper with helper methods
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    /// Create new flags from the raw byte
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Flags of a plain data frame (ACK only)
    pub const fn ack() -> Self {
        Self(consts::TCP_FLG_ACK)
    }

    /// Flags of a connection request
    pub const fn syn() -> Self {
        Self(consts::TCP_FLG_SYN)
    }

    /// Flags of a reset frame
    pub const fn rst() -> Self {
        Self(consts::TCP_FLG_RST)
    }

    /// Check if SYN is set
    pub const fn is_syn(&self) -> bool {
        self.0 & consts::TCP_FLG_SYN != 0
    }

    /// Check if ACK is set
    pub const fn is_ack(&self) -> bool {
        self.0 & consts::TCP_FLG_ACK != 0
    }

    /// Check if RST is set
    pub const fn is_rst(&self) -> bool {
        self.0 & consts::TCP_FLG_RST != 0
    }

    /// Check if PSH is set
    pub const fn is_push(&self) -> bool {
        self.0 & consts::TCP_FLG_PSH != 0
    }

    /// Check if FIN is set
    pub const fn is_fin(&self) -> bool {
        self.0 & consts::TCP_FLG_FIN != 0
    }

    /// Check if this is a handshake reply (SYN and ACK both set)
    pub const fn is_syn_ack(&self) -> bool {
        self.is_syn() && self.is_ack()
    }

    /// Set the SYN flag
    pub const fn with_syn(self) -> Self {
        Self(self.0 | consts::TCP_FLG_SYN)
    }

    /// Set the ACK flag
    pub const fn with_ack(self) -> Self {
        Self(self.0 | consts::TCP_FLG_ACK)
    }

    /// Set the PSH flag
    pub const fn with_push(self) -> Self {
        Self(self.0 | consts::TCP_FLG_PSH)
    }

    /// Get the raw byte value
    pub const fn as_u8(&self) -> u8 {
        self.0
    }
}

impl From<u8> for TcpFlags {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<TcpFlags> for u8 {
    fn from(flags: TcpFlags) -> Self {
        flags.0
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if self.is_syn() {
            parts.push("SYN");
        }
        if self.is_ack() {
            parts.push("ACK");
        }
        if self.is_rst() {
            parts.push("RST");
        }
        if self.is_push() {
            parts.push("PSH");
        }
        if self.is_fin() {
            parts.push("FIN");
        }

        if parts.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
