// Copyright (c) 2024 Botho Foundation

//! Packet envelope and message type tags.
//!
//! ```text
//! ┌────────────┬──────────┬────────────────────┐
//! │ len (4 LE) │ type (1) │ body (len - 1)     │
//! └────────────┴──────────┴────────────────────┘
//! ```
//!
//! `len` counts the type byte and the body. Once the channel is encrypted
//! the whole envelope is sealed as one record (see [`crate::crypto::cipher`]).

use bytes::Bytes;

use crate::crypto::cipher::LENGTH_FIELD_SIZE;
use crate::error::FramingError;

/// Size of the type tag in bytes.
pub const TYPE_SIZE: usize = 1;

/// Size of the cleartext envelope header in bytes.
pub const HEADER_SIZE: usize = LENGTH_FIELD_SIZE + TYPE_SIZE;

/// Outer type tag of a packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Complete message in one fragment.
    Single = 1,
    /// Fragment 0 of a multi-fragment message.
    FragmentHeader = 2,
    /// Fragment 1.. of a multi-fragment message.
    Fragment = 3,

    AeadSetup = 11,
    PresentPubkey = 12,
    Encinit = 14,
    Encack = 15,
    Rekey = 16,

    AuthChallenge = 21,
    AuthReply = 22,
    AuthPropose = 23,

    Heartbeat = 30,
    Disconnect = 31,
}

/// Tags from this value up are AEAD control packets.
pub const AEAD_THRESHOLD: u8 = 10;

/// Tags from this value up are BIP150 auth packets.
pub const AUTH_THRESHOLD: u8 = 20;

impl MessageType {
    pub fn from_byte(byte: u8) -> Result<Self, FramingError> {
        let kind = match byte {
            1 => MessageType::Single,
            2 => MessageType::FragmentHeader,
            3 => MessageType::Fragment,
            11 => MessageType::AeadSetup,
            12 => MessageType::PresentPubkey,
            14 => MessageType::Encinit,
            15 => MessageType::Encack,
            16 => MessageType::Rekey,
            21 => MessageType::AuthChallenge,
            22 => MessageType::AuthReply,
            23 => MessageType::AuthPropose,
            30 => MessageType::Heartbeat,
            31 => MessageType::Disconnect,
            other => return Err(FramingError::UnknownType(other)),
        };
        Ok(kind)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Data framing (types 1 to 3).
    pub fn is_data(self) -> bool {
        self.as_byte() < AEAD_THRESHOLD
    }

    /// Handshake and session control packets.
    pub fn is_control(self) -> bool {
        !self.is_data()
    }

    /// Packets that are always sent in the clear.
    pub fn is_cleartext(self) -> bool {
        matches!(
            self,
            MessageType::AeadSetup
                | MessageType::PresentPubkey
                | MessageType::Encinit
                | MessageType::Encack
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Single => "single",
            MessageType::FragmentHeader => "fragment_header",
            MessageType::Fragment => "fragment",
            MessageType::AeadSetup => "aead_setup",
            MessageType::PresentPubkey => "present_pubkey",
            MessageType::Encinit => "encinit",
            MessageType::Encack => "encack",
            MessageType::Rekey => "rekey",
            MessageType::AuthChallenge => "auth_challenge",
            MessageType::AuthReply => "auth_reply",
            MessageType::AuthPropose => "auth_propose",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Disconnect => "disconnect",
        }
    }
}

/// A decoded (cleartext) packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: MessageType,
    pub body: Bytes,
}

impl Packet {
    pub fn new(kind: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// A control packet with no body.
    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Serialize to `[len][type][body]`.
    pub fn encode(&self) -> Vec<u8> {
        encode_packet(self.kind, &self.body)
    }

    /// Parse a full `[len][type][body]` buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < HEADER_SIZE {
            return Err(FramingError::Underrun {
                needed: HEADER_SIZE,
                remaining: buf.len(),
            });
        }
        let mut len = [0u8; LENGTH_FIELD_SIZE];
        len.copy_from_slice(&buf[..LENGTH_FIELD_SIZE]);
        let len = u32::from_le_bytes(len) as usize;

        let available = buf.len() - LENGTH_FIELD_SIZE;
        if len != available {
            return Err(FramingError::LengthOverrun {
                declared: len as u64,
                available,
            });
        }

        let kind = MessageType::from_byte(buf[LENGTH_FIELD_SIZE])?;
        Ok(Self::new(
            kind,
            Bytes::copy_from_slice(&buf[HEADER_SIZE..]),
        ))
    }
}

/// Serialize `[len][type][body]`.
pub fn encode_packet(kind: MessageType, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&((TYPE_SIZE + body.len()) as u32).to_le_bytes());
    out.push(kind.as_byte());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags() {
        for byte in 0..=u8::MAX {
            if let Ok(kind) = MessageType::from_byte(byte) {
                assert_eq!(kind.as_byte(), byte);
            }
        }
        assert_eq!(MessageType::from_byte(13), Err(FramingError::UnknownType(13)));
        assert!(MessageType::Fragment.is_data());
        assert!(MessageType::Rekey.is_control());
        assert!(MessageType::Encack.is_cleartext());
        assert!(!MessageType::AuthReply.is_cleartext());
        assert!(MessageType::AuthReply.as_byte() >= AUTH_THRESHOLD);
    }

    #[test]
    fn test_envelope() {
        let packet = Packet::new(MessageType::Heartbeat, vec![1, 2, 3]);
        let encoded = packet.encode();
        assert_eq!(&encoded[..5], &[4, 0, 0, 0, 30]);
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_envelope_errors() {
        assert!(matches!(
            Packet::decode(&[1, 0, 0]),
            Err(FramingError::Underrun { .. })
        ));
        assert!(matches!(
            Packet::decode(&[9, 0, 0, 0, 30, 1]),
            Err(FramingError::LengthOverrun { declared: 9, .. })
        ));
        assert_eq!(
            Packet::decode(&[1, 0, 0, 0, 99]),
            Err(FramingError::UnknownType(99))
        );
    }
}
