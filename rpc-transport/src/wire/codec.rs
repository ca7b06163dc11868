// Copyright (c) 2024 Botho Foundation

//! Splits the inbound byte stream into packets.
//!
//! Before both BIP151 sessions are keyed, packets are read by their
//! cleartext length prefix. Afterwards the length field is encrypted, so the
//! codec asks the connection state to decrypt it first. Decrypting the
//! length does not consume a sequence number; the read loop opens the whole
//! packet before the next one is decoded.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio_util::codec::Decoder;

use crate::crypto::cipher::{LENGTH_FIELD_SIZE, TAG_SIZE};
use crate::error::{FramingError, TransportError};
use crate::handshake::ConnectionState;

/// One packet cut from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPacket {
    /// `[len][type][body]` in the clear.
    Clear(BytesMut),
    /// A sealed record including its tag.
    Sealed(BytesMut),
}

/// Decoder producing [`RawPacket`]s.
pub struct PacketCodec {
    state: Arc<Mutex<ConnectionState>>,
    max_packet: usize,
}

impl PacketCodec {
    pub fn new(state: Arc<Mutex<ConnectionState>>, max_packet: usize) -> Self {
        Self { state, max_packet }
    }
}

impl Decoder for PacketCodec {
    type Item = RawPacket;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawPacket>, TransportError> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let (len, sealed) = {
            let state = self.state.lock();
            if state.connection_complete() {
                (state.peek_length(&src[..LENGTH_FIELD_SIZE])?, true)
            } else {
                let mut len = [0u8; LENGTH_FIELD_SIZE];
                len.copy_from_slice(&src[..LENGTH_FIELD_SIZE]);
                (u32::from_le_bytes(len) as usize, false)
            }
        };

        if len > self.max_packet {
            return Err(FramingError::PacketTooLarge(len, self.max_packet).into());
        }

        let total = LENGTH_FIELD_SIZE + len + if sealed { TAG_SIZE } else { 0 };
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let packet = src.split_to(total);
        Ok(Some(if sealed {
            RawPacket::Sealed(packet)
        } else {
            RawPacket::Clear(packet)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoContext;
    use crate::handshake::Role;
    use crate::peers::InMemoryPeerStore;
    use crate::wire::message::{encode_packet, MessageType};

    fn codec(max: usize) -> PacketCodec {
        let state = ConnectionState::new(
            CryptoContext::from_seed(50),
            Arc::new(InMemoryPeerStore::without_identity()),
            Role::Requester,
        );
        PacketCodec::new(Arc::new(Mutex::new(state)), max)
    }

    #[test]
    fn test_cleartext_split() {
        let mut codec = codec(1024);
        let first = encode_packet(MessageType::AeadSetup, &[]);
        let second = encode_packet(MessageType::Encinit, &[5u8; 34]);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second[..10]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(RawPacket::Clear(BytesMut::from(&first[..])))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&second[10..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(RawPacket::Clear(BytesMut::from(&second[..])))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut codec = codec(16);
        let mut buf = BytesMut::from(&encode_packet(MessageType::Single, &[0u8; 64])[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::Framing(FramingError::PacketTooLarge(65, 16)))
        ));
    }
}
