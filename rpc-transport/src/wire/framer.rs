// Copyright (c) 2024 Botho Foundation

//! Fragmentation and reassembly of application messages.
//!
//! # Overview
//!
//! A message larger than the fragment size is split into at most 255
//! fragments, each carried by its own data packet:
//!
//! ```text
//! ┌────────────┬───────────┬───────────┬────────────┬──────────────┐
//! │ msgId (4)  │ count (1) │ index (1) │ varint len │ payload      │
//! └────────────┴───────────┴───────────┴────────────┴──────────────┘
//! ```
//!
//! Fragments may arrive in any order. [`Reassembler`] buffers them per
//! message id and hands back the concatenated payload once every index from
//! 0 to `count - 1` is present.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bytes::{Bytes, BytesMut};

use crate::error::FramingError;
use crate::wire::message::{encode_packet, MessageType};

/// Maximum number of fragments per message.
pub const MAX_FRAGMENTS: usize = 255;

/// Default payload bytes per fragment.
pub const DEFAULT_FRAGMENT_PAYLOAD: usize = 65_536;

/// Message id reserved for server push notifications.
pub const PUSH_ID: u32 = 0xFFFF_FFFE;

/// Message id that is never valid on the wire.
pub const INVALID_ID: u32 = 0xFFFF_FFFF;

/// Fixed part of a fragment header (id, count, index).
const FRAGMENT_FIXED_SIZE: usize = 6;

/// How many completed ids are remembered for stale detection.
const COMPLETED_HISTORY: usize = 4096;

/// Messages a peer may have in progress at once.
pub const MAX_PARTIAL_MESSAGES: usize = 256;

/// Default cap on bytes buffered across all partial messages.
pub const DEFAULT_REASSEMBLY_BYTES: usize = 64 * 1024 * 1024;

/// Bounds-checked reader over an immutable byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], FramingError> {
        if n > self.remaining() {
            return Err(FramingError::Underrun {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, FramingError> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, FramingError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, FramingError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    /// Read a Bitcoin CompactSize integer.
    pub fn read_varint(&mut self) -> Result<u64, FramingError> {
        match self.read_u8()? {
            0xfd => Ok(u64::from(self.read_u16_le()?)),
            0xfe => Ok(u64::from(self.read_u32_le()?)),
            0xff => self.read_u64_le(),
            small => Ok(u64::from(small)),
        }
    }

    /// Read a varint length followed by that many bytes.
    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], FramingError> {
        let declared = self.read_varint()?;
        if declared > self.remaining() as u64 {
            return Err(FramingError::LengthOverrun {
                declared,
                available: self.remaining(),
            });
        }
        self.take(declared as usize)
    }
}

/// Append a Bitcoin CompactSize integer.
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// One fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: u32,
    pub count: u8,
    pub index: u8,
    pub payload: Bytes,
}

impl Fragment {
    /// Packet type carrying this fragment.
    pub fn message_type(&self) -> MessageType {
        match (self.count, self.index) {
            (1, _) => MessageType::Single,
            (_, 0) => MessageType::FragmentHeader,
            _ => MessageType::Fragment,
        }
    }

    /// Encode the fragment header and payload (the packet body).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_FIXED_SIZE + 9 + self.payload.len());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.push(self.count);
        out.push(self.index);
        write_varint(&mut out, self.payload.len() as u64);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Encode as a full `[len][type][body]` packet.
    pub fn to_packet(&self) -> Vec<u8> {
        encode_packet(self.message_type(), &self.encode_body())
    }
}

/// Split `payload` into fragments of at most `max_fragment_payload` bytes.
///
/// An empty payload yields one empty fragment. Payloads that would need more
/// than [`MAX_FRAGMENTS`] fragments are rejected.
pub fn serialize(
    id: u32,
    payload: &[u8],
    max_fragment_payload: usize,
) -> Result<Vec<Fragment>, FramingError> {
    if max_fragment_payload == 0 {
        return Err(FramingError::InvalidHeader(
            "fragment size must be positive".to_string(),
        ));
    }
    if id == INVALID_ID {
        return Err(FramingError::InvalidHeader(format!("reserved id {id:#x}")));
    }

    let needed = payload.len().div_ceil(max_fragment_payload).max(1);
    if needed > MAX_FRAGMENTS {
        return Err(FramingError::TooManyFragments {
            size: payload.len(),
            needed,
        });
    }

    let payload = Bytes::copy_from_slice(payload);
    let fragments = (0..needed)
        .map(|index| {
            let start = index * max_fragment_payload;
            let end = (start + max_fragment_payload).min(payload.len());
            Fragment {
                id,
                count: needed as u8,
                index: index as u8,
                payload: payload.slice(start..end),
            }
        })
        .collect();
    Ok(fragments)
}

/// Parse a data packet body into a fragment.
///
/// `kind` must agree with the header: type 1 for a single fragment, type 2
/// for index 0 of several, type 3 for the rest.
pub fn parse_fragment(kind: MessageType, body: &[u8]) -> Result<Fragment, FramingError> {
    let mut reader = ByteReader::new(body);
    let id = reader.read_u32_le()?;
    let count = reader.read_u8()?;
    let index = reader.read_u8()?;
    let payload = reader.read_var_bytes()?;

    if !reader.is_empty() {
        return Err(FramingError::InvalidHeader(format!(
            "{} trailing bytes after fragment",
            reader.remaining()
        )));
    }
    if id == INVALID_ID {
        return Err(FramingError::InvalidHeader(format!("reserved id {id:#x}")));
    }
    if count == 0 || index >= count {
        return Err(FramingError::InvalidHeader(format!(
            "fragment {index} of {count}"
        )));
    }

    let fragment = Fragment {
        id,
        count,
        index,
        payload: Bytes::copy_from_slice(payload),
    };
    if fragment.message_type() != kind {
        return Err(FramingError::InvalidHeader(format!(
            "fragment {index} of {count} sent as {}",
            kind.name()
        )));
    }
    Ok(fragment)
}

/// Fragments of one message received so far.
#[derive(Debug, Clone)]
pub struct PartialMessage {
    id: u32,
    count: Option<u8>,
    fragments: BTreeMap<u8, Bytes>,
    buffered: usize,
}

impl PartialMessage {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            count: None,
            fragments: BTreeMap::new(),
            buffered: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload bytes held so far.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Store a fragment by index. Returns false for a duplicate index.
    pub fn accumulate(&mut self, fragment: Fragment) -> Result<bool, FramingError> {
        match self.count {
            Some(first) if first != fragment.count => {
                return Err(FramingError::InconsistentCount {
                    id: self.id,
                    first,
                    other: fragment.count,
                });
            }
            Some(_) => {}
            None => self.count = Some(fragment.count),
        }

        if self.fragments.contains_key(&fragment.index) {
            return Ok(false);
        }
        self.buffered += fragment.payload.len();
        self.fragments.insert(fragment.index, fragment.payload);
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.count
            .is_some_and(|count| self.fragments.len() == count as usize)
    }

    /// Concatenate fragments in index order.
    pub fn reconstruct(&self) -> Result<Bytes, FramingError> {
        let count = self.count.ok_or(FramingError::MissingFragment {
            id: self.id,
            index: 0,
        })?;

        let total = self.fragments.values().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for index in 0..count {
            let part = self
                .fragments
                .get(&index)
                .ok_or(FramingError::MissingFragment { id: self.id, index })?;
            out.extend_from_slice(part);
        }
        Ok(out.freeze())
    }
}

/// Result of feeding one fragment to a [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More fragments are needed.
    Pending,
    /// The message is complete.
    Complete { id: u32, payload: Bytes },
    /// Same index seen twice for a message still in progress.
    Duplicate(u32),
    /// Fragment for a message that already completed.
    Stale(u32),
}

/// Reassembles interleaved messages by id.
///
/// The number of open messages and the bytes they hold are capped; a peer
/// that exceeds either gets [`FramingError::ReassemblyOverflow`].
#[derive(Debug)]
pub struct Reassembler {
    partial: HashMap<u32, PartialMessage>,
    completed: HashSet<u32>,
    history: VecDeque<u32>,
    buffered: usize,
    max_partials: usize,
    max_buffered: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_limits(MAX_PARTIAL_MESSAGES, DEFAULT_REASSEMBLY_BYTES)
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_partials: usize, max_buffered: usize) -> Self {
        Self {
            partial: HashMap::new(),
            completed: HashSet::new(),
            history: VecDeque::new(),
            buffered: 0,
            max_partials,
            max_buffered,
        }
    }

    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }

    /// Payload bytes held across all partial messages.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Feed a fragment.
    ///
    /// An inconsistent fragment count drops the partial message and returns
    /// the error; the caller decides how far it propagates.
    pub fn accept(&mut self, fragment: Fragment) -> Result<Reassembly, FramingError> {
        let id = fragment.id;
        if self.completed.contains(&id) {
            return Ok(Reassembly::Stale(id));
        }

        let opens = !self.partial.contains_key(&id);
        if (opens && self.partial.len() >= self.max_partials)
            || self.buffered + fragment.payload.len() > self.max_buffered
        {
            return Err(FramingError::ReassemblyOverflow {
                partials: self.partial.len(),
                buffered: self.buffered,
            });
        }

        let partial = self
            .partial
            .entry(id)
            .or_insert_with(|| PartialMessage::new(id));
        let before = partial.buffered();
        match partial.accumulate(fragment) {
            Ok(true) => {}
            Ok(false) => return Ok(Reassembly::Duplicate(id)),
            Err(err) => {
                self.release(id);
                return Err(err);
            }
        }
        self.buffered += partial.buffered() - before;
        if !partial.is_complete() {
            return Ok(Reassembly::Pending);
        }

        let payload = partial.reconstruct();
        self.release(id);
        let payload = payload?;
        self.remember(id);
        Ok(Reassembly::Complete { id, payload })
    }

    fn release(&mut self, id: u32) {
        if let Some(partial) = self.partial.remove(&id) {
            self.buffered -= partial.buffered();
        }
    }

    fn remember(&mut self, id: u32) {
        // Every push notification reuses the same id.
        if id == PUSH_ID {
            return;
        }
        if self.history.len() == COMPLETED_HISTORY {
            if let Some(old) = self.history.pop_front() {
                self.completed.remove(&old);
            }
        }
        self.completed.insert(id);
        self.history.push_back(id);
    }

    /// Drop every partial message.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(fragment: &Fragment) -> Fragment {
        parse_fragment(fragment.message_type(), &fragment.encode_body()).unwrap()
    }

    #[test]
    fn test_varint_encoding() {
        for (value, len) in [
            (0u64, 1usize),
            (0xfc, 1),
            (0xfd, 3),
            (0xffff, 3),
            (0x1_0000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
        ] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            assert_eq!(out.len(), len, "value {value:#x}");
            assert_eq!(ByteReader::new(&out).read_varint().unwrap(), value);
        }
    }

    #[test]
    fn test_reader_underrun() {
        let mut reader = ByteReader::new(&[1, 2]);
        assert_eq!(
            reader.read_u32_le(),
            Err(FramingError::Underrun {
                needed: 4,
                remaining: 2
            })
        );
        assert_eq!(reader.read_u16_le().unwrap(), 0x0201);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_serialize_single() {
        let fragments = serialize(5, b"small", 1024).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].message_type(), MessageType::Single);

        let body = fragments[0].encode_body();
        assert_eq!(&body[..6], &[5, 0, 0, 0, 1, 0]);
        assert_eq!(body[6], 5);
        assert_eq!(&body[7..], b"small");
    }

    #[test]
    fn test_serialize_empty_payload() {
        let fragments = serialize(1, &[], 16).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].payload.is_empty());
    }

    #[test]
    fn test_serialize_fragment_types() {
        let payload = vec![7u8; 25];
        let fragments = serialize(9, &payload, 10).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].message_type(), MessageType::FragmentHeader);
        assert_eq!(fragments[1].message_type(), MessageType::Fragment);
        assert_eq!(fragments[2].payload.len(), 5);
    }

    #[test]
    fn test_capacity_limit() {
        assert!(serialize(1, &vec![0u8; 255 * 4], 4).is_ok());
        assert_eq!(
            serialize(1, &vec![0u8; 255 * 4 + 1], 4),
            Err(FramingError::TooManyFragments {
                size: 1021,
                needed: 256
            })
        );
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        let fragments = serialize(3, b"abcdef", 2).unwrap();
        let body = fragments[1].encode_body();

        // Wrong outer type.
        assert!(matches!(
            parse_fragment(MessageType::Single, &body),
            Err(FramingError::InvalidHeader(_))
        ));

        // Declared length overruns.
        let mut long = body.clone();
        long[6] = 50;
        assert!(matches!(
            parse_fragment(MessageType::Fragment, &long),
            Err(FramingError::LengthOverrun { declared: 50, .. })
        ));

        // Index out of range.
        let mut bad_index = body.clone();
        bad_index[5] = 9;
        assert!(parse_fragment(MessageType::Fragment, &bad_index).is_err());

        // Truncated header.
        assert!(matches!(
            parse_fragment(MessageType::Fragment, &body[..3]),
            Err(FramingError::Underrun { .. })
        ));

        // Reserved id.
        let mut invalid = body;
        invalid[..4].copy_from_slice(&INVALID_ID.to_le_bytes());
        assert!(parse_fragment(MessageType::Fragment, &invalid).is_err());
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let payload: Vec<u8> = (0..30u8).collect();
        let fragments = serialize(7, &payload, 10).unwrap();
        let mut reassembler = Reassembler::new();

        assert_eq!(
            reassembler.accept(parse(&fragments[2])).unwrap(),
            Reassembly::Pending
        );
        assert_eq!(
            reassembler.accept(parse(&fragments[0])).unwrap(),
            Reassembly::Pending
        );
        assert_eq!(
            reassembler.accept(parse(&fragments[1])).unwrap(),
            Reassembly::Complete {
                id: 7,
                payload: Bytes::from(payload)
            }
        );
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_duplicates_and_stale() {
        let fragments = serialize(4, &[1u8; 20], 10).unwrap();
        let mut reassembler = Reassembler::new();

        reassembler.accept(fragments[0].clone()).unwrap();
        assert_eq!(
            reassembler.accept(fragments[0].clone()).unwrap(),
            Reassembly::Duplicate(4)
        );
        assert!(matches!(
            reassembler.accept(fragments[1].clone()).unwrap(),
            Reassembly::Complete { id: 4, .. }
        ));
        assert_eq!(
            reassembler.accept(fragments[1].clone()).unwrap(),
            Reassembly::Stale(4)
        );
    }

    #[test]
    fn test_inconsistent_count() {
        let mut reassembler = Reassembler::new();
        let a = serialize(2, &[0u8; 30], 10).unwrap().remove(0);
        let b = serialize(2, &[0u8; 40], 10).unwrap().remove(1);

        reassembler.accept(a).unwrap();
        assert_eq!(
            reassembler.accept(b),
            Err(FramingError::InconsistentCount {
                id: 2,
                first: 3,
                other: 4
            })
        );
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_push_id_never_stale() {
        let mut reassembler = Reassembler::new();
        for _ in 0..3 {
            let fragment = serialize(PUSH_ID, b"event", 64).unwrap().remove(0);
            assert!(matches!(
                reassembler.accept(fragment).unwrap(),
                Reassembly::Complete { id: PUSH_ID, .. }
            ));
        }
    }

    #[test]
    fn test_abandoned_messages_are_capped() {
        let mut reassembler = Reassembler::new();
        let opener = |id: u32| Fragment {
            id,
            count: 255,
            index: 0,
            payload: Bytes::from_static(b"x"),
        };

        for id in 0..MAX_PARTIAL_MESSAGES as u32 {
            assert_eq!(reassembler.accept(opener(id)).unwrap(), Reassembly::Pending);
        }
        assert_eq!(reassembler.in_progress(), MAX_PARTIAL_MESSAGES);
        assert!(matches!(
            reassembler.accept(opener(50_000)),
            Err(FramingError::ReassemblyOverflow { .. })
        ));
        assert_eq!(reassembler.in_progress(), MAX_PARTIAL_MESSAGES);

        // Open messages may still finish.
        let rest = Fragment {
            id: 3,
            count: 255,
            index: 1,
            payload: Bytes::from_static(b"y"),
        };
        assert_eq!(reassembler.accept(rest).unwrap(), Reassembly::Pending);
    }

    #[test]
    fn test_buffered_bytes_are_capped() {
        let mut reassembler = Reassembler::with_limits(8, 25);
        let fragments = serialize(5, &[0u8; 30], 10).unwrap();

        reassembler.accept(fragments[0].clone()).unwrap();
        reassembler.accept(fragments[1].clone()).unwrap();
        assert_eq!(reassembler.buffered(), 20);
        assert_eq!(
            reassembler.accept(fragments[2].clone()),
            Err(FramingError::ReassemblyOverflow {
                partials: 1,
                buffered: 20
            })
        );

        // Completed messages release their bytes.
        let mut reassembler = Reassembler::with_limits(8, 30);
        for fragment in fragments {
            reassembler.accept(fragment).unwrap();
        }
        assert_eq!(reassembler.buffered(), 0);
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_missing_fragment() {
        let fragments = serialize(8, &[0u8; 30], 10).unwrap();
        let mut partial = PartialMessage::new(8);
        partial.accumulate(fragments[0].clone()).unwrap();
        partial.accumulate(fragments[2].clone()).unwrap();
        assert!(!partial.is_complete());
        assert_eq!(
            partial.reconstruct(),
            Err(FramingError::MissingFragment { id: 8, index: 1 })
        );
    }
}
