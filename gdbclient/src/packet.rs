/// RSP packet framing
/// 
/// A packet travels as `$<payload>#<checksum>`, where the checksum is the
/// unsigned 8-bit sum of the payload bytes written as two lowercase hex digits.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet payload cannot be empty")]
    InvalidPayload,
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    #[error("Checksum mismatch: packet says {expected:02x}, payload sums to {computed:02x}")]
    ChecksumMismatch { expected: u8, computed: u8 },
}

pub type Result<T> = std::result::Result<T, PacketError>;

/// Unsigned byte sum modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// A single framed RSP packet. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: String,
    checksum: u8,
}

impl Packet {
    /// Build an outbound packet from a command string
    pub fn new(payload: impl Into<String>) -> Result<Self> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(PacketError::InvalidPayload);
        }
        let checksum = checksum(payload.as_bytes());
        Ok(Packet { payload, checksum })
    }

    /// Parse a raw `$...#xx` span, verifying its checksum
    pub fn decode(raw: impl AsRef<[u8]>) -> Result<Self> {
        let raw = raw.as_ref();

        if raw.first() != Some(&b'$') {
            return Err(PacketError::MalformedPacket(
                "packet must start with '$'".into(),
            ));
        }

        let hash = raw
            .iter()
            .rposition(|b| *b == b'#')
            .ok_or_else(|| PacketError::MalformedPacket("missing '#' terminator".into()))?;

        let digits = &raw[hash + 1..];
        if digits.len() != 2 {
            return Err(PacketError::MalformedPacket(format!(
                "expected 2 checksum digits, found {}",
                digits.len()
            )));
        }

        let expected = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| {
                PacketError::MalformedPacket(format!(
                    "invalid checksum digits '{}'",
                    String::from_utf8_lossy(digits)
                ))
            })?;

        let body = &raw[1..hash];
        let computed = checksum(body);
        if computed != expected {
            return Err(PacketError::ChecksumMismatch { expected, computed });
        }

        Ok(Packet {
            payload: String::from_utf8_lossy(body).into_owned(),
            checksum: expected,
        })
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Wire form of the packet
    pub fn encode(&self) -> Vec<u8> {
        format!("${}#{:02x}", self.payload, self.checksum).into_bytes()
    }

    /// `S` and `T` payloads announce that the target stopped
    pub fn is_stop_reply(&self) -> bool {
        self.payload.starts_with('S') || self.payload.starts_with('T')
    }

    pub fn is_error(&self) -> bool {
        self.payload.starts_with('E') || self.payload.starts_with('e')
    }

    pub fn is_ok(&self) -> bool {
        self.payload == "OK"
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}#{:02x}", self.payload, self.checksum)
    }
}

/// Frame a payload for the wire
pub fn encode(payload: &str) -> Result<Vec<u8>> {
    Packet::new(payload).map(|packet| packet.encode())
}

/// Parse and verify a framed packet
pub fn decode(raw: impl AsRef<[u8]>) -> Result<Packet> {
    Packet::decode(raw)
}
