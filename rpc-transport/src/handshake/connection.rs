// Copyright (c) 2024 Botho Foundation

//! Per-connection security state.
//!
//! [`ConnectionState`] pairs the inbound and outbound BIP151 sessions with
//! the BIP150 state machine. It is the only place the transport touches
//! keys: every packet is sealed and opened through it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::crypto::{fingerprint, CryptoContext, PublicKey};
use crate::error::{HandshakeError, SessionError};
use crate::handshake::auth::{
    HandshakeState, HandshakeStateMachine, Role, CHALLENGE_SIZE, REPLY_SIZE,
};
use crate::handshake::session::{
    CipherSuite, Direction, RekeyMaterial, Session, ENCACK_SIZE, ENCINIT_SIZE,
};
use crate::peers::PeerKeyStore;
use crate::wire::message::{encode_packet, MessageType};

/// Both directions of a connection plus identity authentication.
pub struct ConnectionState {
    inbound: Session,
    outbound: Session,
    auth: HandshakeStateMachine,
    suite: CipherSuite,
    last_rekey: Instant,
}

impl ConnectionState {
    pub fn new(ctx: CryptoContext, peers: Arc<dyn PeerKeyStore>, role: Role) -> Self {
        Self {
            inbound: Session::new(Direction::Inbound, ctx.clone()),
            outbound: Session::new(Direction::Outbound, ctx.clone()),
            auth: HandshakeStateMachine::new(ctx, peers, role),
            suite: CipherSuite::ChaCha20Poly1305OpenSsh,
            last_rekey: Instant::now(),
        }
    }

    /// Bytes allowed per key set before a rekey.
    pub fn with_rekey_limit(mut self, limit: u64) -> Self {
        self.inbound = self.inbound.with_rekey_limit(limit);
        self.outbound = self.outbound.with_rekey_limit(limit);
        self
    }

    pub fn with_public_requester(mut self, allow: bool) -> Self {
        self.auth = self.auth.with_public_requester(allow);
        self
    }

    pub fn role(&self) -> Role {
        self.auth.role()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.auth.state()
    }

    pub fn inbound(&self) -> &Session {
        &self.inbound
    }

    pub fn outbound(&self) -> &Session {
        &self.outbound
    }

    /// Both BIP151 sessions have finished key agreement.
    pub fn connection_complete(&self) -> bool {
        self.inbound.handshake_complete() && self.outbound.handshake_complete()
    }

    /// BIP150 has reached Success.
    pub fn is_authenticated(&self) -> bool {
        self.auth.state() == HandshakeState::Success
    }

    pub fn own_public_key(&self) -> Option<PublicKey> {
        self.auth.own_key()
    }

    pub fn peer_public_key(&self) -> Option<PublicKey> {
        self.auth.peer_key()
    }

    /// Whether `key` is registered under `name`.
    pub fn have_public_key(&self, key: &PublicKey, name: &str) -> bool {
        self.auth.peers().public_key(name).as_ref() == Some(key)
    }

    pub fn peers(&self) -> &Arc<dyn PeerKeyStore> {
        self.auth.peers()
    }

    /// Operator-facing fingerprint of the identity used on this connection.
    pub fn bip150_fingerprint(&self) -> Option<String> {
        self.own_public_key().map(|key| fingerprint(&key))
    }

    // BIP151

    pub fn get_encinit_data(&mut self) -> Result<[u8; ENCINIT_SIZE], HandshakeError> {
        Ok(self.outbound.build_encinit(self.suite)?)
    }

    pub fn process_encinit(&mut self, msg: &[u8]) -> Result<(), HandshakeError> {
        self.inbound.process_encinit(msg)?;
        debug!(session = %self.inbound.session_id_hex(), "inbound session keyed");
        Ok(())
    }

    pub fn get_encack_data(&mut self) -> Result<[u8; ENCACK_SIZE], HandshakeError> {
        Ok(self.inbound.build_encack()?)
    }

    pub fn process_encack(&mut self, msg: &[u8]) -> Result<(), HandshakeError> {
        self.outbound.process_encack(msg)?;
        self.last_rekey = Instant::now();
        debug!(session = %self.outbound.session_id_hex(), "outbound session keyed");
        Ok(())
    }

    // BIP150

    fn require_encryption(&self) -> Result<(), HandshakeError> {
        if !self.connection_complete() {
            return Err(HandshakeError::EncryptionIncomplete);
        }
        Ok(())
    }

    /// Requester: first challenge, addressed to the peer registered as `target`.
    pub fn get_authchallenge_data(
        &mut self,
        target: &str,
    ) -> Result<[u8; CHALLENGE_SIZE], HandshakeError> {
        self.require_encryption()?;
        let sid = *self.outbound.session_id();
        self.auth.get_authchallenge_data(&sid, target)
    }

    /// Responder: second challenge, for the proposed identity.
    pub fn get_authchallenge2_data(&mut self) -> Result<[u8; CHALLENGE_SIZE], HandshakeError> {
        self.require_encryption()?;
        let sid = *self.outbound.session_id();
        self.auth.get_authchallenge2_data(&sid)
    }

    /// Check an AUTH_CHALLENGE. Returns whether it matched our identity.
    pub fn process_authchallenge(&mut self, msg: &[u8]) -> Result<bool, HandshakeError> {
        self.require_encryption()?;
        let sid = *self.inbound.session_id();
        match self.auth.role() {
            Role::Responder => self.auth.process_authchallenge1(&sid, msg),
            Role::Requester => self.auth.process_authchallenge2(&sid, msg),
        }
    }

    pub fn get_authreply_data(&mut self) -> Result<[u8; REPLY_SIZE], HandshakeError> {
        self.require_encryption()?;
        let sid = *self.outbound.session_id();
        self.auth.get_authreply_data(&sid)
    }

    pub fn process_authreply(&mut self, msg: &[u8]) -> Result<(), HandshakeError> {
        self.require_encryption()?;
        let sid = *self.inbound.session_id();
        self.auth.process_authreply(&sid, msg)
    }

    pub fn get_authpropose_data(&mut self) -> Result<[u8; CHALLENGE_SIZE], HandshakeError> {
        self.require_encryption()?;
        let sid = *self.outbound.session_id();
        self.auth.get_authpropose_data(&sid)
    }

    pub fn process_authpropose(&mut self, msg: &[u8]) -> Result<bool, HandshakeError> {
        self.require_encryption()?;
        let sid = *self.inbound.session_id();
        self.auth.process_authpropose(&sid, msg)
    }

    /// Finish BIP150 and bind both sessions to the authenticated identities.
    pub fn bip150_handshake_rekey(&mut self) -> Result<(), HandshakeError> {
        let (own, peer) = self.auth.complete()?;
        let old_in = self.inbound.keys().cloned().ok_or(SessionError::NotReady)?;
        let old_out = self.outbound.keys().cloned().ok_or(SessionError::NotReady)?;

        self.outbound.rekey(RekeyMaterial::Identity {
            sender: &own,
            receiver: &peer,
            opposite: &old_in,
        })?;
        self.inbound.rekey(RekeyMaterial::Identity {
            sender: &peer,
            receiver: &own,
            opposite: &old_out,
        })?;
        self.last_rekey = Instant::now();

        info!(
            role = ?self.auth.role(),
            peer = %peer,
            session = %self.outbound.session_id_hex(),
            "BIP150 authentication complete"
        );
        Ok(())
    }

    /// Abort the handshake after a transport failure.
    pub fn abort(&mut self) {
        self.auth.abort();
    }

    // Packets

    /// Seal a cleartext `[len][type][body]` packet for the wire.
    pub fn seal_packet(&mut self, packet: Vec<u8>) -> Result<Vec<u8>, SessionError> {
        self.outbound.encrypt(packet)
    }

    /// Decrypt the length of the next inbound packet without consuming it.
    pub fn peek_length(&self, header: &[u8]) -> Result<usize, SessionError> {
        self.inbound.peek_length(header)
    }

    /// Open a sealed inbound packet.
    pub fn open_packet(&mut self, sealed: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.inbound.decrypt(sealed)
    }

    /// Whether the outbound keys must change before `next` more bytes.
    ///
    /// Only meaningful after authentication; rekeys are refused before.
    pub fn rekey_due(&self, next: usize, interval: Option<Duration>) -> bool {
        if !self.is_authenticated() {
            return false;
        }
        self.outbound.rekey_needed(next)
            || interval.is_some_and(|i| !i.is_zero() && self.last_rekey.elapsed() >= i)
    }

    /// Build the sealed REKEY packet and switch outbound keys right after it.
    pub fn seal_rekey(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if !self.is_authenticated() {
            return Err(HandshakeError::NotAuthenticated);
        }
        let packet = encode_packet(MessageType::Rekey, &[0u8; ENCACK_SIZE]);
        let sealed = self.outbound.encrypt(packet)?;
        self.outbound.rekey(RekeyMaterial::Periodic)?;
        self.last_rekey = Instant::now();
        Ok(sealed)
    }

    /// Apply a REKEY packet received from the peer.
    pub fn process_rekey(&mut self, msg: &[u8]) -> Result<(), HandshakeError> {
        if !self.is_authenticated() {
            return Err(HandshakeError::NotAuthenticated);
        }
        self.inbound.process_rekey(msg)?;
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .field("auth", &self.auth)
            .finish()
    }
}
