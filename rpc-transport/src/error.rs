// Copyright (c) 2024 Botho Foundation

//! Error types for the secure RPC transport.
//!
//! Errors are split by layer. The crypto, session, handshake and framing
//! layers each have their own enum; [`TransportError`] is what callers of the
//! driver see, and every lower-layer error converts into it.
//!
//! Crypto and framing failures are fatal to the connection. The only errors
//! that stay scoped to a single request are [`TransportError::Decode`] and
//! [`TransportError::DuplicateOrStaleMessage`].

use std::io;

use thiserror::Error;

/// Errors raised by the elliptic-curve and hashing primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid private key")]
    InvalidPrivateKey,

    #[error("ECDH key agreement failed")]
    KeyAgreement,

    #[error("signature verification failed")]
    BadSignature,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
}

/// Errors raised by a single BIP151 session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("unsupported cipher suite: {0:#04x}")]
    UnsupportedCipher(u8),

    #[error("encinit already processed on session {0}")]
    DuplicateEncinit(String),

    #[error("encack received before encinit")]
    EncackBeforeEncinit,

    #[error("encinit received on the outbound session")]
    EncinitOnOutbound,

    #[error("rekey message received on the outbound session")]
    RekeyOnOutbound,

    #[error("non-rekey encack received on the inbound session")]
    UnexpectedEncack,

    #[error("session keys are not established")]
    NotReady,

    #[error("ephemeral key already consumed")]
    EphemeralKeyConsumed,

    #[error("bad {kind} message size: expected {expected}, got {actual}")]
    BadMessageSize {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("authentication tag failure at sequence {seq}")]
    AuthenticationTagFailure { seq: u64 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors raised by the BIP150 identity authentication state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("{step} not allowed in state {state}")]
    InvalidState {
        step: &'static str,
        state: &'static str,
    },

    #[error("BIP151 handshake incomplete")]
    EncryptionIncomplete,

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("own identity key is not available")]
    MissingOwnKey,

    #[error("challenge could not be verified")]
    ChallengeMismatch,

    #[error("reply signature could not be verified")]
    ReplyMismatch,

    #[error("proposed identity is not authorized")]
    UnknownProposal,

    #[error("peer identity key not verified")]
    UnverifiedPeerKey,

    #[error("bad {kind} message size: expected {expected}, got {actual}")]
    BadMessageSize {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unexpected handshake message {0}")]
    UnexpectedMessage(String),

    #[error("connection is not authenticated yet")]
    NotAuthenticated,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors raised while parsing or building wire packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("buffer underrun: needed {needed} bytes, {remaining} remaining")]
    Underrun { needed: usize, remaining: usize },

    #[error("declared length {declared} overruns buffer of {available} bytes")]
    LengthOverrun { declared: u64, available: usize },

    #[error("packet length {0} exceeds the maximum of {1}")]
    PacketTooLarge(usize, usize),

    #[error("payload of {size} bytes needs {needed} fragments, maximum is 255")]
    TooManyFragments { size: usize, needed: usize },

    #[error("invalid fragment header: {0}")]
    InvalidHeader(String),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("fragment count mismatch for message {id}: {first} vs {other}")]
    InconsistentCount { id: u32, first: u8, other: u8 },

    #[error("message {id} is missing fragment {index}")]
    MissingFragment { id: u32, index: u8 },

    #[error("reassembly limit exceeded: {partials} messages holding {buffered} bytes")]
    ReassemblyOverflow { partials: usize, buffered: usize },

    #[error("cleartext {0} packet received on an encrypted channel")]
    UnexpectedCleartext(&'static str),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid key material for {name}: {reason}")]
    InvalidKey { name: String, reason: String },
}

/// Errors surfaced by the transport driver and delivered to continuations.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// Identity or key agreement failed. Fatal, no resume.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// Malformed or oversized packet. Fatal.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// AEAD tag mismatch. Fatal, the connection is dropped immediately.
    #[error("authentication tag failure")]
    AuthenticationTagFailure,

    /// Duplicate or stale fragment. Dropped, never fatal.
    #[error("duplicate or stale message {0}")]
    DuplicateOrStaleMessage(u32),

    /// The connection is gone. Delivered to every pending request at teardown.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer stopped answering heartbeats.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Connect did not finish in time.
    #[error("connect timed out")]
    Timeout,

    /// A response could not be decoded. Scoped to that request only.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether this error tears down the whole connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::DuplicateOrStaleMessage(_) | TransportError::Decode(_)
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => TransportError::ConnectionClosed,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

impl From<HandshakeError> for TransportError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Session(SessionError::AuthenticationTagFailure { .. }) => {
                TransportError::AuthenticationTagFailure
            }
            other => TransportError::HandshakeFailure(other.to_string()),
        }
    }
}

impl From<SessionError> for TransportError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AuthenticationTagFailure { .. } => TransportError::AuthenticationTagFailure,
            other => TransportError::HandshakeFailure(other.to_string()),
        }
    }
}

impl From<ConfigError> for TransportError {
    fn from(err: ConfigError) -> Self {
        TransportError::Config(err.to_string())
    }
}

/// Result alias for driver-level operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::HandshakeFailure("bad reply".to_string());
        assert_eq!(err.to_string(), "handshake failed: bad reply");

        let err = TransportError::ConnectionClosed;
        assert_eq!(err.to_string(), "connection closed");

        let err = FramingError::TooManyFragments {
            size: 10,
            needed: 300,
        };
        assert_eq!(
            err.to_string(),
            "payload of 10 bytes needs 300 fragments, maximum is 255"
        );
    }

    #[test]
    fn test_error_from_io() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(
            TransportError::from(eof),
            TransportError::ConnectionClosed
        ));

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(TransportError::from(other), TransportError::Io(_)));
    }

    #[test]
    fn test_tag_failure_maps_to_transport_variant() {
        let err: TransportError = SessionError::AuthenticationTagFailure { seq: 4 }.into();
        assert!(matches!(err, TransportError::AuthenticationTagFailure));

        let err: TransportError =
            HandshakeError::Session(SessionError::AuthenticationTagFailure { seq: 1 }).into();
        assert!(matches!(err, TransportError::AuthenticationTagFailure));

        let err: TransportError = HandshakeError::ChallengeMismatch.into();
        assert!(matches!(err, TransportError::HandshakeFailure(_)));
    }

    #[test]
    fn test_fatality() {
        assert!(TransportError::AuthenticationTagFailure.is_fatal());
        assert!(TransportError::ConnectionClosed.is_fatal());
        assert!(!TransportError::Decode("x".into()).is_fatal());
        assert!(!TransportError::DuplicateOrStaleMessage(3).is_fatal());
        let overflow = FramingError::ReassemblyOverflow {
            partials: 256,
            buffered: 0,
        };
        assert!(TransportError::from(overflow).is_fatal());
    }
}
