// Copyright (c) 2024 Botho Foundation

//! Secure RPC transport between a wallet and its indexer.
//!
//! A connection runs BIP151 (ECDH key agreement, then ChaCha20-Poly1305
//! sealed packets with periodic rekeying) and BIP150 (mutual identity
//! authentication bound to the session id) before any application data
//! flows. On top of that, messages are fragmented, reassembled and
//! correlated with their requests by id.
//!
//! ```text
//!   application ── ConnectionHandle / ServerConnection
//!        │
//!   rpc::multiplexer    request id → completion, push fan-out
//!   wire::framer        fragments ⇄ messages
//!   handshake           BIP151 sessions + BIP150 state machine
//!   wire::codec         packet boundaries on the byte stream
//!        │
//!   AsyncRead + AsyncWrite (TCP, Unix socket, in-memory duplex)
//! ```

#![deny(clippy::print_stdout)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod peers;
pub mod rpc;
pub mod wire;

// Re-export commands module for CLI binary
pub mod commands;

pub use config::{FileConfig, TransportConfig};
pub use crypto::{fingerprint, CryptoContext, IdentityKeypair, PublicKey};
pub use error::{TransportError, TransportResult};
pub use peers::{InMemoryPeerStore, PeerKeyStore};
pub use rpc::{
    ConnectionHandle, ConnectionStatus, IncomingRequest, KeyVerifier, RequestHandle,
    ServerConnection, TransportDriver,
};
