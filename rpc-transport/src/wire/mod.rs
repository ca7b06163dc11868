// Copyright (c) 2024 Botho Foundation

//! Wire format: packet envelope, fragment framing and stream codec.

pub mod codec;
pub mod framer;
pub mod message;

pub use codec::{PacketCodec, RawPacket};
pub use framer::{
    parse_fragment, serialize, ByteReader, Fragment, PartialMessage, Reassembler, Reassembly,
    INVALID_ID, MAX_FRAGMENTS, PUSH_ID,
};
pub use message::{MessageType, Packet};
