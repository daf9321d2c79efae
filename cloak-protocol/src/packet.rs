//! Tunnel frame codec
//!
//! Every frame on the wire is a plain IPv4+TCP segment with no options on
//! either layer:
//!
//! ```text
//! +--------------------+--------------------+------------------+
//! | IPv4 header (20 B) | TCP header (20 B)  | payload (0..N B) |
//! +--------------------+--------------------+------------------+
//! ```
//!
//! The TCP window field of every legitimate tunnel frame carries
//! [`MAGIC_WINDOW`](crate::MAGIC_WINDOW); receivers use it to tell tunnel
//! traffic from unrelated TCP that reaches the same device. Both checksums
//! are computed on encode. Decode parses structurally and leaves checksum
//! validation to the network path.

use std::net::Ipv4Addr;

use crate::{Error, Result, TcpFlags, MAGIC_WINDOW};

/// IPv4 header length (no options)
pub const IPV4_HEADER_LEN: usize = 20;
/// TCP header length (no options)
pub const TCP_HEADER_LEN: usize = 20;
/// Combined header length of every tunnel frame
pub const HEADER_LEN: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;

const IP_PROTO_TCP: u8 = 6;
const IP_FLAG_DF: u16 = 0x4000;
const IP_TTL: u8 = 64;

/// Decoded view of one tunnel frame.
///
/// The payload borrows from the buffer the frame was decoded from (or from
/// the caller on encode); the struct itself owns no heap memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnPacket<'a> {
    /// Source IPv4 address
    pub src_ip: Ipv4Addr,
    /// Destination IPv4 address
    pub dst_ip: Ipv4Addr,
    /// Source TCP port
    pub src_port: u16,
    /// Destination TCP port
    pub dst_port: u16,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// IPv4 identification field
    pub ip_id: u16,
    /// Advertised window; [`MAGIC_WINDOW`](crate::MAGIC_WINDOW) on tunnel frames
    pub window: u16,
    /// TCP flags
    pub flags: TcpFlags,
    /// Payload bytes after the combined header
    pub payload: &'a [u8],
}

impl<'a> ConnPacket<'a> {
    /// Create an empty frame for the given 4-tuple with the magic window set.
    pub fn new(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            seq: 0,
            ack: 0,
            ip_id: 0,
            window: MAGIC_WINDOW,
            flags: TcpFlags::default(),
            payload: &[],
        }
    }

    /// Total encoded length of this frame
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode into `out`, returning the number of bytes written.
    ///
    /// Writes both headers, copies the payload and fills in the IPv4 and TCP
    /// checksums.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        let total = self.encoded_len();
        if out.len() < total {
            return Err(Error::BufferTooSmall {
                needed: total,
                capacity: out.len(),
            });
        }

        // IPv4 header
        out[0] = 0x45; // version 4, ihl 5
        out[1] = 0;
        out[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        out[4..6].copy_from_slice(&self.ip_id.to_be_bytes());
        out[6..8].copy_from_slice(&IP_FLAG_DF.to_be_bytes());
        out[8] = IP_TTL;
        out[9] = IP_PROTO_TCP;
        out[10..12].fill(0);
        out[12..16].copy_from_slice(&self.src_ip.octets());
        out[16..20].copy_from_slice(&self.dst_ip.octets());

        let ip_csum = checksum(&out[..IPV4_HEADER_LEN]);
        out[10..12].copy_from_slice(&ip_csum.to_be_bytes());

        // TCP header
        out[20..22].copy_from_slice(&self.src_port.to_be_bytes());
        out[22..24].copy_from_slice(&self.dst_port.to_be_bytes());
        out[24..28].copy_from_slice(&self.seq.to_be_bytes());
        out[28..32].copy_from_slice(&self.ack.to_be_bytes());
        out[32] = 5 << 4; // data offset 5 words, no options
        out[33] = self.flags.as_u8();
        out[34..36].copy_from_slice(&self.window.to_be_bytes());
        out[36..38].fill(0);
        out[38..40].fill(0); // urgent pointer

        out[HEADER_LEN..total].copy_from_slice(self.payload);

        let tcp_csum = tcp_checksum(
            self.src_ip,
            self.dst_ip,
            &out[IPV4_HEADER_LEN..total],
        );
        out[36..38].copy_from_slice(&tcp_csum.to_be_bytes());

        Ok(total)
    }

    /// Decode a frame from `buf`.
    ///
    /// Structural parse only: version, protocol and the three length fields
    /// must be consistent. Checksums are not validated.
    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::FrameTooShort {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }

        let version = buf[0] >> 4;
        if version != 4 {
            return Err(Error::UnsupportedVersion(version));
        }
        if buf[9] != IP_PROTO_TCP {
            return Err(Error::NotTcp(buf[9]));
        }

        let ihl = ((buf[0] & 0x0F) as usize) * 4;
        let total_length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if ihl < IPV4_HEADER_LEN || total_length > buf.len() || ihl + TCP_HEADER_LEN > total_length
        {
            return Err(Error::HeaderLength {
                ihl,
                doff: 0,
                frame: buf.len(),
            });
        }

        let tcp = &buf[ihl..total_length];
        let doff = ((tcp[12] >> 4) as usize) * 4;
        if doff < TCP_HEADER_LEN || doff > tcp.len() {
            return Err(Error::HeaderLength {
                ihl,
                doff,
                frame: buf.len(),
            });
        }

        Ok(Self {
            src_ip: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst_ip: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
            dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
            seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
            ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
            ip_id: u16::from_be_bytes([buf[4], buf[5]]),
            window: u16::from_be_bytes([tcp[14], tcp[15]]),
            flags: TcpFlags::new(tcp[13]),
            payload: &buf[ihl + doff..total_length],
        })
    }
}

/// RFC 1071 internet checksum over `data`.
fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0))
}

/// TCP checksum over the pseudo-header and the segment.
fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut acc = 0u32;
    acc = sum_words(&src.octets(), acc);
    acc = sum_words(&dst.octets(), acc);
    acc += IP_PROTO_TCP as u32;
    acc += segment.len() as u32;
    !fold(sum_words(segment, acc))
}

fn sum_words(data: &[u8], mut acc: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        acc += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u32) << 8;
    }
    acc
}

fn fold(mut acc: u32) -> u16 {
    while acc > 0xFFFF {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    acc as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample<'a>(payload: &'a [u8]) -> ConnPacket<'a> {
        let mut cp = ConnPacket::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            5000,
            6000,
        );
        cp.seq = 1000;
        cp.ack = 1100;
        cp.ip_id = 7;
        cp.flags = TcpFlags::ack();
        cp.payload = payload;
        cp
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let payload = [0x41, 0x42, 0x43];
        let cp = sample(&payload);

        let mut buf = [0u8; 128];
        let n = cp.encode(&mut buf).unwrap();
        assert_eq!(n, HEADER_LEN + 3);

        let decoded = ConnPacket::decode(&buf[..n]).unwrap();
        assert_eq!(decoded, cp);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let mut cp = sample(&[]);
        cp.flags = TcpFlags::syn();

        let mut buf = [0u8; HEADER_LEN];
        let n = cp.encode(&mut buf).unwrap();
        assert_eq!(n, HEADER_LEN);

        let decoded = ConnPacket::decode(&buf).unwrap();
        assert_eq!(decoded, cp);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_header_layout() {
        let payload = [0xAA; 5];
        let cp = sample(&payload);

        let mut buf = [0u8; 64];
        let n = cp.encode(&mut buf).unwrap();

        assert_eq!(buf[0], 0x45);
        // total_length covers both headers and the payload
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]) as usize, n);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 7);
        assert_eq!(buf[9], 6);
        // window carries the magic marker
        assert_eq!(u16::from_be_bytes([buf[34], buf[35]]), MAGIC_WINDOW);
        assert_eq!(buf[33], TcpFlags::ack().as_u8());
    }

    #[test]
    fn test_checksums_verify() {
        let payload = [1, 2, 3, 4, 5, 6, 7]; // odd length exercises the trailing byte
        let cp = sample(&payload);

        let mut buf = [0u8; 64];
        let n = cp.encode(&mut buf).unwrap();

        // Summing a header over its own checksum field folds to 0xFFFF.
        assert_eq!(fold(sum_words(&buf[..IPV4_HEADER_LEN], 0)), 0xFFFF);

        let mut acc = 0u32;
        acc = sum_words(&cp.src_ip.octets(), acc);
        acc = sum_words(&cp.dst_ip.octets(), acc);
        acc += 6;
        acc += (n - IPV4_HEADER_LEN) as u32;
        assert_eq!(fold(sum_words(&buf[IPV4_HEADER_LEN..n], acc)), 0xFFFF);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            ConnPacket::decode(&[0u8; 10]),
            Err(Error::FrameTooShort { .. })
        ));

        let mut buf = [0u8; HEADER_LEN];
        sample(&[]).encode(&mut buf).unwrap();

        let mut v6 = buf;
        v6[0] = 0x60;
        assert!(matches!(
            ConnPacket::decode(&v6),
            Err(Error::UnsupportedVersion(6))
        ));

        let mut udp = buf;
        udp[9] = 17;
        assert!(matches!(ConnPacket::decode(&udp), Err(Error::NotTcp(17))));

        // total_length larger than the frame
        let mut long = buf;
        long[2..4].copy_from_slice(&500u16.to_be_bytes());
        assert!(matches!(
            ConnPacket::decode(&long),
            Err(Error::HeaderLength { .. })
        ));
    }

    #[test]
    fn test_decode_trailing_bytes_ignored() {
        // Devices may hand over more bytes than total_length; the payload
        // slice must follow the header fields, not the buffer length.
        let payload = [9, 9, 9];
        let cp = sample(&payload);

        let mut buf = [0u8; 128];
        let n = cp.encode(&mut buf).unwrap();
        let decoded = ConnPacket::decode(&buf[..n + 13]).unwrap();
        assert_eq!(decoded.payload, &payload);
    }

    #[test]
    fn test_encode_buffer_too_small() {
        let payload = [0u8; 16];
        let cp = sample(&payload);
        let mut buf = [0u8; HEADER_LEN];
        assert!(matches!(
            cp.encode(&mut buf),
            Err(Error::BufferTooSmall { .. })
        ));
    }
}
