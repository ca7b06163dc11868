// Copyright (c) 2024 Botho Foundation

//! BIP150 identity authentication.
//!
//! # Overview
//!
//! Runs over a channel whose two BIP151 sessions are already complete. The
//! requester (client) proves it is talking to the identity it expects, then
//! proposes its own identity and proves ownership of it.
//!
//! ```text
//!  requester                                   responder
//!  Challenge1  ── AUTH_CHALLENGE H(sid,'i',R) ─▶  Challenge1
//!  Reply1      ◀─ AUTH_REPLY sig_R(sid) ──────   Reply1
//!  Propose     ── AUTH_PROPOSE H(sid,'p',Q) ──▶  Propose
//!  Challenge2  ◀─ AUTH_CHALLENGE H(sid,'r',Q) ─  Challenge2
//!  Reply2      ── AUTH_REPLY sig_Q(sid) ──────▶  Reply2
//!  Success          (BIP150 rekey)              Success
//! ```
//!
//! # Security Properties
//!
//! - Every hash and signature is bound to a session ID, so a challenge or
//!   reply captured on one connection is useless on another
//! - A challenge is bound to the target identity, so a relay cannot reuse it
//!   for a different server
//! - An unknown proposal is answered with a well-formed decoy challenge, so
//!   the reply shape does not reveal whether a key is known
//! - Any mismatch moves to [`HandshakeState::Error`], which is terminal

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::crypto::{sha256d, CryptoContext, PublicKey, PUBKEY_SIZE, SIGNATURE_SIZE};
use crate::error::HandshakeError;
use crate::peers::PeerKeyStore;

/// Size of an AUTH_CHALLENGE or AUTH_PROPOSE body.
pub const CHALLENGE_SIZE: usize = 32;

/// Size of an AUTH_REPLY body.
pub const REPLY_SIZE: usize = SIGNATURE_SIZE;

const TAG_CHALLENGE1: u8 = b'i';
const TAG_PROPOSE: u8 = b'p';
const TAG_CHALLENGE2: u8 = b'r';

/// Challenge sent back for an identity that anonymous mode lets through.
const ANONYMOUS_CHALLENGE: [u8; CHALLENGE_SIZE] = [0xff; CHALLENGE_SIZE];

/// Progress of the BIP150 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Inactive,
    Challenge1,
    Reply1,
    Propose,
    Challenge2,
    Reply2,
    Success,
    Error,
}

impl HandshakeState {
    pub fn name(self) -> &'static str {
        match self {
            HandshakeState::Inactive => "inactive",
            HandshakeState::Challenge1 => "challenge1",
            HandshakeState::Reply1 => "reply1",
            HandshakeState::Propose => "propose",
            HandshakeState::Challenge2 => "challenge2",
            HandshakeState::Reply2 => "reply2",
            HandshakeState::Success => "success",
            HandshakeState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Success | HandshakeState::Error)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of the exchange this machine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Requester,
    Responder,
}

/// BIP150 state for one connection.
///
/// Session IDs are passed in per call: `out_sid` for anything we produce,
/// `in_sid` for anything we check.
pub struct HandshakeStateMachine {
    ctx: CryptoContext,
    peers: Arc<dyn PeerKeyStore>,
    role: Role,
    state: HandshakeState,
    public_requester: bool,
    /// Requester: the server identity we target. Responder: the verified
    /// requester identity.
    peer_key: Option<PublicKey>,
    /// The own identity the peer's challenge matched.
    own_key: Option<PublicKey>,
    good_challenge: bool,
    good_propose: bool,
}

fn auth_hash(sid: &[u8; 32], tag: u8, key: &PublicKey) -> [u8; 32] {
    sha256d(&[sid, &[tag], key.as_bytes()])
}

fn check_size(kind: &'static str, expected: usize, msg: &[u8]) -> Result<(), HandshakeError> {
    if msg.len() != expected {
        return Err(HandshakeError::BadMessageSize {
            kind,
            expected,
            actual: msg.len(),
        });
    }
    Ok(())
}

impl HandshakeStateMachine {
    pub fn new(ctx: CryptoContext, peers: Arc<dyn PeerKeyStore>, role: Role) -> Self {
        Self {
            ctx,
            peers,
            role,
            state: HandshakeState::Inactive,
            public_requester: false,
            peer_key: None,
            own_key: None,
            good_challenge: false,
            good_propose: false,
        }
    }

    /// Allow requesters whose identity is unknown to the responder.
    pub fn with_public_requester(mut self, allow: bool) -> Self {
        self.public_requester = allow;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peers(&self) -> &Arc<dyn PeerKeyStore> {
        &self.peers
    }

    /// The authenticated (or targeted) peer identity.
    pub fn peer_key(&self) -> Option<PublicKey> {
        self.peer_key
    }

    /// The own identity used on this connection.
    pub fn own_key(&self) -> Option<PublicKey> {
        self.own_key.or_else(|| self.peers.own_public_key())
    }

    /// True when the peer went through anonymous mode without a known key.
    pub fn peer_is_anonymous(&self) -> bool {
        self.role == Role::Responder && !self.good_propose
    }

    fn reset(&mut self) {
        self.state = HandshakeState::Inactive;
        self.peer_key = None;
        self.own_key = None;
        self.good_challenge = false;
        self.good_propose = false;
    }

    fn expect(
        &mut self,
        step: &'static str,
        role: Role,
        from: HandshakeState,
        to: HandshakeState,
    ) -> Result<(), HandshakeError> {
        if self.role != role || self.state != from {
            return Err(HandshakeError::InvalidState {
                step,
                state: self.state.name(),
            });
        }
        self.state = to;
        Ok(())
    }

    fn fail(&mut self, err: HandshakeError) -> HandshakeError {
        warn!(role = ?self.role, state = %self.state, "BIP150 failure: {}", err);
        self.state = HandshakeState::Error;
        err
    }

    /// Requester, step 1: challenge the identity registered as `target`.
    pub fn get_authchallenge_data(
        &mut self,
        out_sid: &[u8; 32],
        target: &str,
    ) -> Result<[u8; CHALLENGE_SIZE], HandshakeError> {
        if self.role != Role::Requester || self.state != HandshakeState::Inactive {
            return Err(HandshakeError::InvalidState {
                step: "challenge",
                state: self.state.name(),
            });
        }
        self.reset();
        self.state = HandshakeState::Challenge1;

        let key = match self.peers.public_key(target) {
            Some(key) => key,
            None => return Err(self.fail(HandshakeError::UnknownPeer(target.to_string()))),
        };
        self.peer_key = Some(key);
        debug!(target, "sending auth challenge");
        Ok(auth_hash(out_sid, TAG_CHALLENGE1, &key))
    }

    /// Responder, step 1: check a challenge against our own identities.
    ///
    /// A challenge for an identity we do not hold is not an error here: the
    /// reply is then all zero and the machine enters Error.
    pub fn process_authchallenge1(
        &mut self,
        in_sid: &[u8; 32],
        msg: &[u8],
    ) -> Result<bool, HandshakeError> {
        check_size("auth challenge", CHALLENGE_SIZE, msg)?;
        if self.role != Role::Responder || self.state != HandshakeState::Inactive {
            return Err(HandshakeError::InvalidState {
                step: "process challenge",
                state: self.state.name(),
            });
        }
        self.reset();
        self.state = HandshakeState::Challenge1;

        let own = self.peers.own_public_key();
        self.good_challenge = own
            .map(|key| auth_hash(in_sid, TAG_CHALLENGE1, &key)[..] == *msg)
            .unwrap_or(false);
        if self.good_challenge {
            self.own_key = own;
        } else {
            warn!("auth challenge does not match our identity");
        }
        Ok(self.good_challenge)
    }

    /// Produce an AUTH_REPLY.
    ///
    /// Responder: Challenge1 to Reply1. Requester: Challenge2 to Reply2.
    pub fn get_authreply_data(
        &mut self,
        out_sid: &[u8; 32],
    ) -> Result<[u8; REPLY_SIZE], HandshakeError> {
        match self.role {
            Role::Responder => self.expect(
                "reply",
                Role::Responder,
                HandshakeState::Challenge1,
                HandshakeState::Reply1,
            )?,
            Role::Requester => self.expect(
                "reply",
                Role::Requester,
                HandshakeState::Challenge2,
                HandshakeState::Reply2,
            )?,
        }

        if self.good_challenge {
            let own = self.own_key().ok_or(HandshakeError::MissingOwnKey)?;
            let identity = self
                .peers
                .identity_for(&own)
                .ok_or(HandshakeError::MissingOwnKey)?;
            return Ok(self.ctx.sign(&identity, out_sid)?);
        }

        let mut reply = [0u8; REPLY_SIZE];
        if self.role == Role::Requester && self.public_requester {
            // Anonymous requester: hand over the key instead of a signature.
            let own = self.own_key().ok_or(HandshakeError::MissingOwnKey)?;
            reply[..PUBKEY_SIZE].copy_from_slice(own.as_bytes());
            return Ok(reply);
        }

        self.state = HandshakeState::Error;
        Ok(reply)
    }

    /// Check an AUTH_REPLY.
    ///
    /// Requester: Challenge1 to Reply1. Responder: Challenge2 to Reply2.
    pub fn process_authreply(&mut self, in_sid: &[u8; 32], msg: &[u8]) -> Result<(), HandshakeError> {
        check_size("auth reply", REPLY_SIZE, msg)?;
        match self.role {
            Role::Requester => self.expect(
                "process reply",
                Role::Requester,
                HandshakeState::Challenge1,
                HandshakeState::Reply1,
            )?,
            Role::Responder => self.expect(
                "process reply",
                Role::Responder,
                HandshakeState::Challenge2,
                HandshakeState::Reply2,
            )?,
        }

        if self.role == Role::Responder && !self.good_propose {
            if !self.public_requester {
                return Err(self.fail(HandshakeError::UnverifiedPeerKey));
            }
            let anonymous = match PublicKey::from_bytes(&msg[..PUBKEY_SIZE]) {
                Ok(key) if msg[PUBKEY_SIZE..].iter().all(|b| *b == 0) => key,
                _ => return Err(self.fail(HandshakeError::ReplyMismatch)),
            };
            debug!(key = %anonymous, "accepted anonymous requester");
            self.peer_key = Some(anonymous);
            return Ok(());
        }

        let Some(key) = self.peer_key else {
            return Err(self.fail(HandshakeError::UnverifiedPeerKey));
        };
        if self.ctx.verify(&key, in_sid, msg).is_err() {
            return Err(self.fail(HandshakeError::ReplyMismatch));
        }
        debug!(peer = %key, "auth reply verified");
        Ok(())
    }

    /// Requester: propose our own identity. Reply1 to Propose.
    pub fn get_authpropose_data(
        &mut self,
        out_sid: &[u8; 32],
    ) -> Result<[u8; CHALLENGE_SIZE], HandshakeError> {
        self.expect(
            "propose",
            Role::Requester,
            HandshakeState::Reply1,
            HandshakeState::Propose,
        )?;
        let own = match self.own_key() {
            Some(key) => key,
            None => return Err(self.fail(HandshakeError::MissingOwnKey)),
        };
        Ok(auth_hash(out_sid, TAG_PROPOSE, &own))
    }

    /// Responder: look the proposed identity up among authorized keys.
    ///
    /// Reply1 to Propose. Returns whether the proposal matched. A miss stays
    /// in Propose so a decoy challenge can still be sent.
    pub fn process_authpropose(
        &mut self,
        in_sid: &[u8; 32],
        msg: &[u8],
    ) -> Result<bool, HandshakeError> {
        check_size("auth propose", CHALLENGE_SIZE, msg)?;
        self.expect(
            "process propose",
            Role::Responder,
            HandshakeState::Reply1,
            HandshakeState::Propose,
        )?;

        let found = self
            .peers
            .authorized_keys()
            .into_iter()
            .find(|key| auth_hash(in_sid, TAG_PROPOSE, key)[..] == *msg);

        self.good_propose = found.is_some();
        match found {
            Some(key) => {
                debug!(peer = %key, "auth propose matched an authorized key");
                self.peer_key = Some(key);
            }
            None => warn!(anonymous_allowed = self.public_requester, "unknown auth propose"),
        }
        Ok(self.good_propose)
    }

    /// Responder, step 2: challenge the proposed identity. Propose to
    /// Challenge2.
    ///
    /// An unknown proposal gets a decoy of the same size: all 0xFF in
    /// anonymous mode, all zero (and Error) otherwise.
    pub fn get_authchallenge2_data(
        &mut self,
        out_sid: &[u8; 32],
    ) -> Result<[u8; CHALLENGE_SIZE], HandshakeError> {
        self.expect(
            "challenge",
            Role::Responder,
            HandshakeState::Propose,
            HandshakeState::Challenge2,
        )?;

        if let (true, Some(key)) = (self.good_propose, self.peer_key) {
            return Ok(auth_hash(out_sid, TAG_CHALLENGE2, &key));
        }
        if self.public_requester {
            return Ok(ANONYMOUS_CHALLENGE);
        }
        self.state = HandshakeState::Error;
        Ok([0u8; CHALLENGE_SIZE])
    }

    /// Requester, step 4: check the responder's challenge against our own
    /// identity. Propose to Challenge2.
    ///
    /// Returns whether the challenge matched. In anonymous mode the 0xFF
    /// challenge is accepted and answered with our key.
    pub fn process_authchallenge2(
        &mut self,
        in_sid: &[u8; 32],
        msg: &[u8],
    ) -> Result<bool, HandshakeError> {
        check_size("auth challenge", CHALLENGE_SIZE, msg)?;
        self.expect(
            "process challenge",
            Role::Requester,
            HandshakeState::Propose,
            HandshakeState::Challenge2,
        )?;

        let own = match self.own_key() {
            Some(key) => key,
            None => return Err(self.fail(HandshakeError::MissingOwnKey)),
        };
        if auth_hash(in_sid, TAG_CHALLENGE2, &own)[..] == *msg {
            self.good_challenge = true;
            return Ok(true);
        }

        self.good_challenge = false;
        if self.public_requester && *msg == ANONYMOUS_CHALLENGE {
            debug!("responder does not know our identity, continuing anonymously");
            return Ok(false);
        }
        Err(self.fail(HandshakeError::ChallengeMismatch))
    }

    /// Finish the exchange. Reply2 to Success.
    ///
    /// Returns `(sender, receiver)` identities for our outbound direction,
    /// which the caller feeds into the BIP150 rekey.
    pub fn complete(&mut self) -> Result<(PublicKey, PublicKey), HandshakeError> {
        if self.state != HandshakeState::Reply2 {
            return Err(HandshakeError::InvalidState {
                step: "rekey",
                state: self.state.name(),
            });
        }
        let own = self.own_key().ok_or(HandshakeError::MissingOwnKey)?;
        let peer = self.peer_key.ok_or(HandshakeError::UnverifiedPeerKey)?;
        self.state = HandshakeState::Success;
        Ok((own, peer))
    }

    /// Move to Error. Used when the transport aborts mid-handshake.
    pub fn abort(&mut self) {
        self.state = HandshakeState::Error;
    }
}

impl fmt::Debug for HandshakeStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeStateMachine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("public_requester", &self.public_requester)
            .field("peer_key", &self.peer_key)
            .finish()
    }
}
