// Copyright (c) 2024 Botho Foundation

//! One direction of a BIP151 encrypted channel.
//!
//! A [`Session`] owns an ephemeral ECDH key, the symmetric keys derived from
//! it, the session ID, the packet sequence number and the number of bytes
//! processed since the last key change.
//!
//! # Key agreement
//!
//! ```text
//! outbound session                      peer inbound session
//!   build_encinit ── pub || cipher ──▶    process_encinit  (keys derived)
//!   process_encack ◀──── pub ─────────    build_encack
//!   (keys derived)
//! ```
//!
//! Keys come from HKDF-SHA256 over `ecdh_x || cipher_id` with the salt
//! `bitcoinecdh`. The sequence number is never reset, not even by a rekey.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::cipher::{self, CipherKeys, KEY_SIZE, LENGTH_FIELD_SIZE, TAG_SIZE};
use crate::crypto::{sha256d, CryptoContext, EphemeralKey, PublicKey, PUBKEY_SIZE};
use crate::error::{CryptoError, SessionError};

/// Size of an ENCINIT message: ephemeral public key plus cipher id.
pub const ENCINIT_SIZE: usize = PUBKEY_SIZE + 1;

/// Size of an ENCACK (and rekey) message.
pub const ENCACK_SIZE: usize = PUBKEY_SIZE;

/// Size of a session ID in bytes.
pub const SESSION_ID_SIZE: usize = 32;

/// Bytes allowed on one key set before a rekey is mandatory.
pub const DEFAULT_REKEY_BYTE_LIMIT: u64 = 1_000_000_000;

const HKDF_SALT: &[u8] = b"bitcoinecdh";
const INFO_PAYLOAD_KEY: &[u8] = b"BitcoinK2";
const INFO_LENGTH_KEY: &[u8] = b"BitcoinK1";
const INFO_SESSION_ID: &[u8] = b"BitcoinSessionID";

/// Negotiable symmetric cipher suites.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    ChaCha20Poly1305OpenSsh = 0x00,
}

impl CipherSuite {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(CipherSuite::ChaCha20Poly1305OpenSsh),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Which way a session carries traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Material used to derive the next key set.
pub enum RekeyMaterial<'a> {
    /// Plain BIP151 rekey: `k' = SHA256d(session_id || k)`.
    Periodic,
    /// Rekey bound to both authenticated identities after BIP150.
    ///
    /// `sender` is the identity that writes on this direction. `opposite`
    /// holds the other direction's keys from before the rekey.
    Identity {
        sender: &'a PublicKey,
        receiver: &'a PublicKey,
        opposite: &'a CipherKeys,
    },
}

/// Per-direction BIP151 state.
pub struct Session {
    direction: Direction,
    ctx: CryptoContext,
    ephemeral: EphemeralKey,
    cipher: Option<CipherSuite>,
    keys: Option<CipherKeys>,
    session_id: [u8; SESSION_ID_SIZE],
    seq: u64,
    bytes_on_keys: u64,
    rekey_limit: u64,
    encinit: bool,
    encack: bool,
}

impl Session {
    pub fn new(direction: Direction, ctx: CryptoContext) -> Self {
        let ephemeral = ctx.ephemeral_key();
        Self {
            direction,
            ctx,
            ephemeral,
            cipher: None,
            keys: None,
            session_id: [0u8; SESSION_ID_SIZE],
            seq: 0,
            bytes_on_keys: 0,
            rekey_limit: DEFAULT_REKEY_BYTE_LIMIT,
            encinit: false,
            encack: false,
        }
    }

    /// Override the byte limit that makes a rekey mandatory.
    pub fn with_rekey_limit(mut self, limit: u64) -> Self {
        self.rekey_limit = limit;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn encinit_seen(&self) -> bool {
        self.encinit
    }

    pub fn encack_seen(&self) -> bool {
        self.encack
    }

    /// True once both encinit and encack have been exchanged.
    pub fn handshake_complete(&self) -> bool {
        self.encinit && self.encack
    }

    pub fn session_id(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.session_id
    }

    pub fn session_id_hex(&self) -> String {
        hex::encode(self.session_id)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn bytes_on_keys(&self) -> u64 {
        self.bytes_on_keys
    }

    pub fn rekey_limit(&self) -> u64 {
        self.rekey_limit
    }

    pub(crate) fn keys(&self) -> Option<&CipherKeys> {
        self.keys.as_ref()
    }

    fn ready_keys(&self) -> Result<&CipherKeys, SessionError> {
        match (&self.keys, self.handshake_complete()) {
            (Some(keys), true) => Ok(keys),
            _ => Err(SessionError::NotReady),
        }
    }

    /// Build the ENCINIT payload and mark encinit as sent.
    pub fn build_encinit(&mut self, suite: CipherSuite) -> Result<[u8; ENCINIT_SIZE], SessionError> {
        if self.direction != Direction::Outbound {
            return Err(SessionError::EncinitOnOutbound);
        }
        if self.ephemeral.is_consumed() {
            return Err(SessionError::EphemeralKeyConsumed);
        }

        self.cipher = Some(suite);
        self.encinit = true;

        let mut out = [0u8; ENCINIT_SIZE];
        out[..PUBKEY_SIZE].copy_from_slice(self.ephemeral.public().as_bytes());
        out[PUBKEY_SIZE] = suite.id();
        Ok(out)
    }

    /// Accept the peer's ENCINIT and derive this session's keys.
    pub fn process_encinit(&mut self, msg: &[u8]) -> Result<(), SessionError> {
        check_size("encinit", ENCINIT_SIZE, msg.len())?;
        if self.direction != Direction::Inbound {
            return Err(SessionError::EncinitOnOutbound);
        }
        if self.encinit {
            return Err(SessionError::DuplicateEncinit(self.session_id_hex()));
        }

        let suite = CipherSuite::from_byte(msg[PUBKEY_SIZE])
            .ok_or(SessionError::UnsupportedCipher(msg[PUBKEY_SIZE]))?;
        let peer = PublicKey::from_bytes(&msg[..PUBKEY_SIZE])?;

        self.cipher = Some(suite);
        self.setup_keys(&peer)?;
        self.encinit = true;
        debug!(session = %self.session_id_hex(), "processed encinit");
        Ok(())
    }

    /// Build the ENCACK payload answering a processed ENCINIT.
    pub fn build_encack(&mut self) -> Result<[u8; ENCACK_SIZE], SessionError> {
        if !self.encinit {
            return Err(SessionError::EncackBeforeEncinit);
        }
        self.encack = true;
        self.ephemeral.cleanse();
        Ok(*self.ephemeral.public().as_bytes())
    }

    /// Accept the peer's ENCACK and derive this session's keys.
    pub fn process_encack(&mut self, msg: &[u8]) -> Result<(), SessionError> {
        check_size("encack", ENCACK_SIZE, msg.len())?;
        if self.direction != Direction::Outbound {
            return Err(SessionError::UnexpectedEncack);
        }
        if !self.encinit {
            return Err(SessionError::EncackBeforeEncinit);
        }
        if is_rekey_message(msg) {
            return Err(SessionError::RekeyOnOutbound);
        }

        let peer = PublicKey::from_bytes(msg)?;
        self.setup_keys(&peer)?;
        self.encack = true;
        debug!(session = %self.session_id_hex(), "processed encack");
        Ok(())
    }

    /// Accept an in-band rekey request on the inbound session.
    pub fn process_rekey(&mut self, msg: &[u8]) -> Result<(), SessionError> {
        check_size("rekey", ENCACK_SIZE, msg.len())?;
        if self.direction != Direction::Inbound {
            return Err(SessionError::RekeyOnOutbound);
        }
        if !is_rekey_message(msg) {
            return Err(SessionError::UnexpectedEncack);
        }
        self.rekey(RekeyMaterial::Periodic)
    }

    fn setup_keys(&mut self, peer: &PublicKey) -> Result<(), SessionError> {
        let suite = self.cipher.ok_or(SessionError::NotReady)?;
        let secret = self.ctx.ecdh(&mut self.ephemeral, peer)?;

        let mut ikm = Zeroizing::new([0u8; KEY_SIZE + 1]);
        ikm[..KEY_SIZE].copy_from_slice(secret.as_slice());
        ikm[KEY_SIZE] = suite.id();

        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), ikm.as_slice());
        let mut payload = [0u8; KEY_SIZE];
        let mut length = [0u8; KEY_SIZE];
        hk.expand(INFO_PAYLOAD_KEY, &mut payload)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(INFO_LENGTH_KEY, &mut length)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(INFO_SESSION_ID, &mut self.session_id)
            .map_err(|_| CryptoError::KeyDerivation)?;

        self.keys = Some(CipherKeys::new(payload, length));
        Ok(())
    }

    /// Whether sending `next` more bytes would reach the rekey limit.
    pub fn rekey_needed(&self, next: usize) -> bool {
        self.bytes_on_keys.saturating_add(next as u64) >= self.rekey_limit
    }

    /// Replace both keys. Resets the byte counter, keeps the sequence number.
    pub fn rekey(&mut self, material: RekeyMaterial<'_>) -> Result<(), SessionError> {
        let session_id = self.session_id;
        let keys = self.keys.as_mut().ok_or(SessionError::NotReady)?;

        match material {
            RekeyMaterial::Periodic => {
                keys.payload = sha256d(&[&session_id, &keys.payload]);
                keys.length = sha256d(&[&session_id, &keys.length]);
            }
            RekeyMaterial::Identity {
                sender,
                receiver,
                opposite,
            } => {
                keys.payload = sha256d(&[
                    &session_id,
                    &keys.payload,
                    &opposite.payload,
                    sender.as_bytes(),
                    receiver.as_bytes(),
                ]);
                keys.length = sha256d(&[
                    &session_id,
                    &keys.length,
                    &opposite.length,
                    sender.as_bytes(),
                    receiver.as_bytes(),
                ]);
            }
        }

        self.bytes_on_keys = 0;
        debug!(session = %self.session_id_hex(), seq = self.seq, "session rekeyed");
        Ok(())
    }

    /// Seal a `[len:4][type][body]` packet. Consumes one sequence number
    /// when sealing succeeds.
    pub fn encrypt(&mut self, mut packet: Vec<u8>) -> Result<Vec<u8>, SessionError> {
        let seq = self.seq;
        let size = packet.len() as u64;
        cipher::seal(self.ready_keys()?, seq, &mut packet)?;

        self.seq += 1;
        self.bytes_on_keys += size;
        Ok(packet)
    }

    /// Decrypt only the length field of the next inbound packet.
    ///
    /// Does not consume a sequence number.
    pub fn peek_length(&self, header: &[u8]) -> Result<usize, SessionError> {
        let keys = self.ready_keys()?;
        Ok(cipher::open_length(keys, self.seq, header)? as usize)
    }

    /// Verify and open a sealed packet. Consumes one sequence number, even on
    /// failure.
    pub fn decrypt(&mut self, sealed: &[u8]) -> Result<Vec<u8>, SessionError> {
        let seq = self.seq;
        let result = self.ready_keys().and_then(|keys| {
            cipher::open(keys, seq, sealed).map_err(|err| match err {
                CryptoError::AuthenticationFailed => SessionError::AuthenticationTagFailure { seq },
                other => SessionError::Crypto(other),
            })
        });

        self.seq += 1;
        self.bytes_on_keys += sealed.len().saturating_sub(TAG_SIZE) as u64;
        if let Err(SessionError::AuthenticationTagFailure { seq }) = &result {
            warn!(session = %self.session_id_hex(), seq, "authentication tag failure");
        }
        result
    }

    /// Sealed size of a packet with `plain_len` bytes after the length field.
    pub fn sealed_size(plain_len: usize) -> usize {
        LENGTH_FIELD_SIZE + plain_len + TAG_SIZE
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("direction", &self.direction)
            .field("session_id", &self.session_id_hex())
            .field("seq", &self.seq)
            .field("bytes_on_keys", &self.bytes_on_keys)
            .field("encinit", &self.encinit)
            .field("encack", &self.encack)
            .finish()
    }
}

fn check_size(kind: &'static str, expected: usize, actual: usize) -> Result<(), SessionError> {
    if expected != actual {
        return Err(SessionError::BadMessageSize {
            kind,
            expected,
            actual,
        });
    }
    Ok(())
}

/// A rekey request is an ENCACK made of zero bytes.
pub fn is_rekey_message(msg: &[u8]) -> bool {
    msg.len() == ENCACK_SIZE && msg.iter().all(|b| *b == 0)
}
