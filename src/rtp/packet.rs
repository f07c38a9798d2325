//! RTP fixed-header codec
//!
//! Decodes the 12-byte RTP header (RFC 3550 §5.1) that prefixes every
//! datagram on the data channel. The receiver only needs the sequence
//! number; the other fields are decoded so a datagram can be validated and
//! re-encoded by test servers.

use std::fmt;

// ============ Constants ============

/// RTP protocol version carried in the top two bits of the first byte
pub const RTP_VERSION: u8 = 2;

/// Size of the fixed header without CSRC list or extension
pub const RTP_HEADER_LEN: usize = 12;

/// Payload type used by the streaming server for MPEG audio
pub const PAYLOAD_TYPE_MPA: u8 = 14;

// ============ Errors ============

/// Errors from decoding a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than the header it claims to carry
    TooShort { len: usize, needed: usize },
    /// Version bits are not 2
    BadVersion(u8),
    /// Padding count larger than the remaining payload
    BadPadding(u8),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::TooShort { len, needed } => {
                write!(f, "datagram too short: {} bytes, need {}", len, needed)
            }
            PacketError::BadVersion(v) => write!(f, "unsupported RTP version {}", v),
            PacketError::BadPadding(p) => write!(f, "invalid padding length {}", p),
        }
    }
}

impl std::error::Error for PacketError {}

// ============ Header ============

/// Decoded RTP fixed header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

impl RtpHeader {
    /// Header for a packet with the given sequence number and defaults elsewhere
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type: PAYLOAD_TYPE_MPA,
            sequence,
            timestamp,
            ssrc,
            csrc: Vec::new(),
        }
    }

    /// Serialize this header followed by `payload` into a datagram
    pub fn encode_with(&self, payload: &[u8]) -> Vec<u8> {
        let cc = self.csrc.len().min(15);
        let mut out = Vec::with_capacity(RTP_HEADER_LEN + cc * 4 + payload.len());

        out.push((RTP_VERSION << 6) | cc as u8);
        out.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in self.csrc.iter().take(cc) {
            out.extend_from_slice(&csrc.to_be_bytes());
        }
        out.extend_from_slice(payload);
        out
    }
}

// ============ Packet ============

/// A decoded datagram borrowing its payload from the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub header: RtpHeader,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Decode a datagram
    ///
    /// CSRC entries and header extensions are skipped; trailing padding is
    /// stripped from the payload.
    pub fn decode(data: &'a [u8]) -> Result<Self, PacketError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(PacketError::TooShort {
                len: data.len(),
                needed: RTP_HEADER_LEN,
            });
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(PacketError::BadVersion(version));
        }
        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;

        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if data.len() < offset {
            return Err(PacketError::TooShort {
                len: data.len(),
                needed: offset,
            });
        }
        let csrc = data[RTP_HEADER_LEN..offset]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if has_extension {
            if data.len() < offset + 4 {
                return Err(PacketError::TooShort {
                    len: data.len(),
                    needed: offset + 4,
                });
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if data.len() < offset {
                return Err(PacketError::TooShort {
                    len: data.len(),
                    needed: offset,
                });
            }
        }

        let mut end = data.len();
        if has_padding {
            let pad = data[end - 1];
            if pad == 0 || offset + pad as usize > end {
                return Err(PacketError::BadPadding(pad));
            }
            end -= pad as usize;
        }

        Ok(Self {
            header: RtpHeader {
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
                csrc,
            },
            payload: &data[offset..end],
        })
    }

    /// Serialize back into a datagram (extension and padding are not kept)
    pub fn encode(&self) -> Vec<u8> {
        self.header.encode_with(self.payload)
    }
}
