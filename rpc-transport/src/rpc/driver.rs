// Copyright (c) 2024 Botho Foundation

//! Connection driver: owns the byte stream and runs the I/O tasks.
//!
//! # Overview
//!
//! ```text
//!              ConnectionHandle (cloneable)
//!                 │ send / shutdown
//!                 ▼
//!   ┌──── lock ConnectionState: rekey? → seal → enqueue ────┐
//!   │                                                        │
//!   │  read task                     write task              │
//!   │  FramedRead<PacketCodec>       FramedWrite<BytesCodec> │
//!   │    open → route by type          drain outbox in order │
//!   │    control → handshake / rekey                         │
//!   │    data → Reassembler → RequestMultiplexer             │
//!   │                                                        │
//!   │  keepalive task (client): heartbeat + timeout          │
//!   └────────────────────────────────────────────────────────┘
//! ```
//!
//! Sealing and enqueueing happen under the same lock, so the sequence
//! number order always matches the order bytes reach the socket.
//!
//! # Failure model
//!
//! Crypto and framing failures tear the whole connection down. Teardown
//! runs once: it resolves every pending request, stops the tasks and
//! publishes [`ConnectionStatus::Closed`] with the first reason seen.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::crypto::{fingerprint, CryptoContext, PublicKey};
use crate::error::{FramingError, HandshakeError, TransportError, TransportResult};
use crate::handshake::{ConnectionState, HandshakeState, Role};
use crate::peers::PeerKeyStore;
use crate::rpc::multiplexer::{Completion, RequestHandle, RequestMultiplexer, SubscriptionId};
use crate::rpc::server::IncomingRequest;
use crate::wire::framer::{
    parse_fragment, serialize, Reassembler, Reassembly, MAX_PARTIAL_MESSAGES, PUSH_ID,
};
use crate::wire::message::{encode_packet, MessageType, Packet};
use crate::wire::{PacketCodec, RawPacket};

/// Decides whether an unknown server identity key may be trusted.
pub trait KeyVerifier: Send + Sync {
    /// Called with the configured peer name, the presented key and its
    /// fingerprint. Returning true stores the key under that name.
    fn verify(&self, peer_name: &str, key: &PublicKey, fingerprint: &str) -> bool;
}

impl<F> KeyVerifier for F
where
    F: Fn(&str, &PublicKey, &str) -> bool + Send + Sync,
{
    fn verify(&self, peer_name: &str, key: &PublicKey, fingerprint: &str) -> bool {
        self(peer_name, key, fingerprint)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Closed locally (`None`) or because of an error.
    Closed(Option<TransportError>),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionStatus::Closed(_))
    }
}

enum Outgoing {
    Packet(Bytes),
    Close,
}

/// State shared by the handle and the I/O tasks.
pub(crate) struct Shared {
    state: Arc<Mutex<ConnectionState>>,
    mux: RequestMultiplexer,
    outbox: mpsc::UnboundedSender<Outgoing>,
    status: watch::Sender<ConnectionStatus>,
    config: TransportConfig,
    closing: AtomicBool,
    disconnect_sent: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    rekeys_sent: AtomicU64,
    rekeys_received: AtomicU64,
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Claim the one DISCONNECT this connection may send.
    fn claim_disconnect(&self) -> bool {
        self.disconnect_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn push(&self, bytes: Vec<u8>) -> TransportResult<()> {
        self.outbox
            .send(Outgoing::Packet(Bytes::from(bytes)))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Emit an in-band rekey first if the next `next` bytes would need one.
    fn maybe_rekey(&self, state: &mut ConnectionState, next: usize) -> TransportResult<()> {
        if !state.rekey_due(next, self.config.rekey_interval()) {
            return Ok(());
        }
        let sealed = state.seal_rekey()?;
        self.push(sealed)?;
        self.rekeys_sent.fetch_add(1, Ordering::Relaxed);
        debug!(session = %state.outbound().session_id_hex(), "sent rekey");
        Ok(())
    }

    /// Build, seal (unless cleartext) and enqueue one packet.
    fn enqueue(
        &self,
        state: &mut ConnectionState,
        kind: MessageType,
        body: &[u8],
    ) -> TransportResult<()> {
        let packet = encode_packet(kind, body);
        trace!(kind = kind.name(), bytes = packet.len(), "sending packet");
        if kind.is_cleartext() {
            return self.push(packet);
        }
        self.maybe_rekey(state, packet.len())?;
        let sealed = state.seal_packet(packet)?;
        self.push(sealed)
    }

    fn send_control(&self, kind: MessageType, body: &[u8]) -> TransportResult<()> {
        let mut state = self.state.lock();
        self.enqueue(&mut state, kind, body)
    }

    /// Fragment, seal and enqueue one application message.
    ///
    /// Sealing failures tear the connection down; the error is also
    /// returned so the caller can fail its own request.
    pub(crate) fn send_message(&self, id: u32, payload: &[u8]) -> TransportResult<()> {
        if self.is_closing() {
            return Err(TransportError::ConnectionClosed);
        }
        let fragments = serialize(id, payload, self.config.max_fragment_payload)?;

        let result = {
            let mut state = self.state.lock();
            if !state.is_authenticated() {
                return Err(HandshakeError::NotAuthenticated.into());
            }
            fragments.iter().try_for_each(|fragment| {
                self.enqueue(&mut state, fragment.message_type(), &fragment.encode_body())
            })
        };

        if let Err(err) = &result {
            self.teardown(Some(err.clone()));
        } else {
            debug!(
                msg_id = id,
                bytes = payload.len(),
                fragments = fragments.len(),
                "message queued"
            );
        }
        result
    }

    fn set_connected(&self) {
        if self.is_closing() {
            return;
        }
        *self.last_heartbeat.lock() = Instant::now();
        self.status.send_replace(ConnectionStatus::Connected);
    }

    /// Close the connection. Only the first call has an effect.
    pub(crate) fn teardown(&self, reason: Option<TransportError>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut state = self.state.lock();
            if !state.handshake_state().is_terminal() {
                state.abort();
            }
        }
        match &reason {
            Some(err) => warn!(error = %err, "connection torn down"),
            None => info!("connection shut down"),
        }

        let pending_err = match &reason {
            Some(err @ TransportError::HandshakeFailure(_)) => err.clone(),
            _ => TransportError::ConnectionClosed,
        };
        self.mux.fail_all(pending_err);

        let _ = self.outbox.send(Outgoing::Close);
        // Publishing Closed also stops the read and keepalive tasks.
        self.status.send_replace(ConnectionStatus::Closed(reason));
    }
}

/// Cloneable handle to one live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Send a request. Never blocks; failures resolve the returned handle.
    pub fn send(&self, payload: impl AsRef<[u8]>) -> RequestHandle {
        let handle = self.shared.mux.register_handle();
        if let Err(err) = self.shared.send_message(handle.id(), payload.as_ref()) {
            self.shared.mux.fail(handle.id(), err);
        }
        handle
    }

    /// Send a request whose outcome is passed to `callback` on its own task.
    pub fn send_with_callback<F>(&self, payload: impl AsRef<[u8]>, callback: F) -> u32
    where
        F: FnOnce(TransportResult<Bytes>) + Send + Sync + 'static,
    {
        let id = self
            .shared
            .mux
            .register(Completion::Callback(Box::new(callback)));
        if let Err(err) = self.shared.send_message(id, payload.as_ref()) {
            self.shared.mux.fail(id, err);
        }
        id
    }

    /// Wait for the response to a request sent with [`send`](Self::send).
    pub async fn await_response(&self, handle: RequestHandle) -> TransportResult<Bytes> {
        handle.response().await
    }

    /// Send and wait in one call.
    pub async fn request(&self, payload: impl AsRef<[u8]>) -> TransportResult<Bytes> {
        self.send(payload).response().await
    }

    /// Send a message under a caller-chosen id without registering a
    /// completion. Used for replies and pushes.
    pub(crate) fn send_with_id(&self, id: u32, payload: &[u8]) -> TransportResult<()> {
        self.shared.send_message(id, payload)
    }

    /// Run `handler` for every push notification.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.shared.mux.subscribe(handler)
    }

    /// Receive push notifications through a channel.
    pub fn push_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Bytes>) {
        self.shared.mux.push_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.mux.unsubscribe(id)
    }

    /// Close the connection. Sends DISCONNECT when connected. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.is_closing() {
            return;
        }
        if self.shared.is_connected() && self.shared.claim_disconnect() {
            if let Err(err) = self.shared.send_control(MessageType::Disconnect, &[]) {
                debug!(error = %err, "could not send disconnect");
            }
        }
        self.shared.teardown(None);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Wait until the connection is closed and return the reason.
    pub async fn closed(&self) -> Option<TransportError> {
        let mut rx = self.shared.status.subscribe();
        loop {
            let status = rx.borrow_and_update().clone();
            if let ConnectionStatus::Closed(reason) = status {
                return reason;
            }
            if rx.changed().await.is_err() {
                return Some(TransportError::ConnectionClosed);
            }
        }
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.shared.state.lock().handshake_state()
    }

    /// Fingerprint of our own identity on this connection.
    pub fn bip150_fingerprint(&self) -> Option<String> {
        self.shared.state.lock().bip150_fingerprint()
    }

    pub fn own_public_key(&self) -> Option<PublicKey> {
        self.shared.state.lock().own_public_key()
    }

    pub fn peer_public_key(&self) -> Option<PublicKey> {
        self.shared.state.lock().peer_public_key()
    }

    /// Outbound session id, hex encoded, for logs.
    pub fn session_id_hex(&self) -> String {
        self.shared.state.lock().outbound().session_id_hex()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.mux.pending_count()
    }

    pub fn rekeys_sent(&self) -> u64 {
        self.shared.rekeys_sent.load(Ordering::Relaxed)
    }

    pub fn rekeys_received(&self) -> u64 {
        self.shared.rekeys_received.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("status", &self.status())
            .finish()
    }
}

/// Role-specific handshake progress, owned by the read task.
pub(crate) enum Endpoint {
    Client {
        peer_name: String,
        verifier: Option<Arc<dyn KeyVerifier>>,
        presented: bool,
    },
    Server {
        requests: mpsc::UnboundedSender<IncomingRequest>,
        setup_seen: bool,
    },
}

impl Endpoint {
    fn deliver(&self, shared: &Shared, id: u32, payload: Bytes) {
        match self {
            Endpoint::Client { .. } => {
                shared.mux.on_complete_message(id, payload);
            }
            Endpoint::Server { requests, .. } => {
                if id == PUSH_ID {
                    warn!("client sent a push notification, dropping");
                    return;
                }
                if requests.send(IncomingRequest { id, payload }).is_err() {
                    warn!(msg_id = id, "request receiver dropped");
                }
            }
        }
    }

    fn on_heartbeat(&self, shared: &Shared) -> TransportResult<()> {
        match self {
            Endpoint::Client { .. } => {
                *shared.last_heartbeat.lock() = Instant::now();
                Ok(())
            }
            Endpoint::Server { .. } => shared.send_control(MessageType::Heartbeat, &[]),
        }
    }

    fn on_handshake(&mut self, shared: &Shared, packet: Packet) -> TransportResult<()> {
        debug!(kind = packet.kind.name(), bytes = packet.body.len(), "handshake message");
        match self {
            Endpoint::Client {
                peer_name,
                verifier,
                presented,
            } => client_handshake(shared, peer_name, verifier.as_deref(), presented, packet),
            Endpoint::Server { setup_seen, .. } => server_handshake(shared, setup_seen, packet),
        }
    }
}

fn unexpected(kind: MessageType) -> TransportError {
    HandshakeError::UnexpectedMessage(kind.name().to_string()).into()
}

fn client_handshake(
    shared: &Shared,
    peer_name: &str,
    verifier: Option<&dyn KeyVerifier>,
    presented: &mut bool,
    packet: Packet,
) -> TransportResult<()> {
    let mut state = shared.state.lock();
    let body = &packet.body[..];

    match packet.kind {
        MessageType::PresentPubkey => {
            if *presented {
                return Err(unexpected(packet.kind));
            }
            let key = PublicKey::from_bytes(body).map_err(|e| {
                TransportError::HandshakeFailure(format!("bad server identity key: {e}"))
            })?;
            if !state.have_public_key(&key, peer_name) {
                let fp = fingerprint(&key);
                if state.peers().public_key(peer_name).is_some() {
                    return Err(TransportError::HandshakeFailure(format!(
                        "server key {fp} does not match the key pinned for {peer_name}"
                    )));
                }
                let accepted = verifier.is_some_and(|v| v.verify(peer_name, &key, &fp));
                if !accepted {
                    return Err(TransportError::HandshakeFailure(format!(
                        "untrusted server key {fp} for {peer_name}"
                    )));
                }
                info!(peer = peer_name, fingerprint = %fp, "accepted new server key");
                state.peers().add_peer(peer_name, key);
            }
            *presented = true;
        }
        MessageType::Encinit => {
            if !*presented {
                return Err(unexpected(packet.kind));
            }
            state.process_encinit(body)?;
            let encack = state.get_encack_data()?;
            let encinit = state.get_encinit_data()?;
            shared.enqueue(&mut state, MessageType::Encack, &encack)?;
            shared.enqueue(&mut state, MessageType::Encinit, &encinit)?;
        }
        MessageType::Encack => {
            state.process_encack(body)?;
            let challenge = state.get_authchallenge_data(peer_name)?;
            shared.enqueue(&mut state, MessageType::AuthChallenge, &challenge)?;
        }
        MessageType::AuthReply => {
            state.process_authreply(body)?;
            let propose = state.get_authpropose_data()?;
            shared.enqueue(&mut state, MessageType::AuthPropose, &propose)?;
        }
        MessageType::AuthChallenge => {
            state.process_authchallenge(body)?;
            let reply = state.get_authreply_data()?;
            shared.enqueue(&mut state, MessageType::AuthReply, &reply)?;
            state.bip150_handshake_rekey()?;
            drop(state);
            shared.set_connected();
        }
        other => return Err(unexpected(other)),
    }
    Ok(())
}

fn server_handshake(shared: &Shared, setup_seen: &mut bool, packet: Packet) -> TransportResult<()> {
    let mut state = shared.state.lock();
    let body = &packet.body[..];

    match packet.kind {
        MessageType::AeadSetup => {
            if *setup_seen {
                return Err(unexpected(packet.kind));
            }
            *setup_seen = true;
            let own = state.own_public_key().ok_or(HandshakeError::MissingOwnKey)?;
            let encinit = state.get_encinit_data()?;
            shared.enqueue(&mut state, MessageType::PresentPubkey, own.as_bytes())?;
            shared.enqueue(&mut state, MessageType::Encinit, &encinit)?;
        }
        MessageType::Encack => {
            if !*setup_seen {
                return Err(unexpected(packet.kind));
            }
            state.process_encack(body)?;
        }
        MessageType::Encinit => {
            if !*setup_seen {
                return Err(unexpected(packet.kind));
            }
            state.process_encinit(body)?;
            let encack = state.get_encack_data()?;
            shared.enqueue(&mut state, MessageType::Encack, &encack)?;
        }
        MessageType::AuthChallenge => {
            let good = state.process_authchallenge(body)?;
            let reply = state.get_authreply_data()?;
            shared.enqueue(&mut state, MessageType::AuthReply, &reply)?;
            if !good {
                return Err(HandshakeError::ChallengeMismatch.into());
            }
        }
        MessageType::AuthPropose => {
            state.process_authpropose(body)?;
            let challenge = state.get_authchallenge2_data()?;
            shared.enqueue(&mut state, MessageType::AuthChallenge, &challenge)?;
            if state.handshake_state() == HandshakeState::Error {
                return Err(HandshakeError::UnknownProposal.into());
            }
        }
        MessageType::AuthReply => {
            state.process_authreply(body)?;
            state.bip150_handshake_rekey()?;
            drop(state);
            shared.set_connected();
        }
        other => return Err(unexpected(other)),
    }
    Ok(())
}

fn handle_packet(
    shared: &Shared,
    endpoint: &mut Endpoint,
    reassembler: &mut Reassembler,
    raw: RawPacket,
) -> TransportResult<()> {
    let packet = match raw {
        RawPacket::Clear(buf) => {
            let packet = Packet::decode(&buf)?;
            if !packet.kind.is_cleartext() {
                return Err(FramingError::UnexpectedCleartext(packet.kind.name()).into());
            }
            packet
        }
        RawPacket::Sealed(buf) => {
            let plain = shared.state.lock().open_packet(&buf)?;
            Packet::decode(&plain)?
        }
    };
    trace!(kind = packet.kind.name(), bytes = packet.body.len(), "packet received");

    match packet.kind {
        kind if kind.is_data() => handle_data(shared, endpoint, reassembler, packet),
        MessageType::Rekey => {
            shared.state.lock().process_rekey(&packet.body)?;
            shared.rekeys_received.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        MessageType::Heartbeat => endpoint.on_heartbeat(shared),
        MessageType::Disconnect => {
            info!("peer disconnected");
            Err(TransportError::ConnectionClosed)
        }
        _ => endpoint.on_handshake(shared, packet),
    }
}

fn handle_data(
    shared: &Shared,
    endpoint: &Endpoint,
    reassembler: &mut Reassembler,
    packet: Packet,
) -> TransportResult<()> {
    if !shared.state.lock().is_authenticated() {
        return Err(TransportError::HandshakeFailure(
            "data packet before authentication".to_string(),
        ));
    }

    let fragment = parse_fragment(packet.kind, &packet.body)?;
    match reassembler.accept(fragment) {
        Ok(Reassembly::Pending) => Ok(()),
        Ok(Reassembly::Complete { id, payload }) => {
            endpoint.deliver(shared, id, payload);
            Ok(())
        }
        Ok(Reassembly::Duplicate(id)) | Ok(Reassembly::Stale(id)) => {
            Err(TransportError::DuplicateOrStaleMessage(id))
        }
        Err(err @ FramingError::InconsistentCount { id, .. }) => {
            let err = TransportError::Decode(err.to_string());
            shared.mux.fail(id, err.clone());
            Err(err)
        }
        Err(err) => Err(err.into()),
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut reader: FramedRead<R, PacketCodec>,
    mut endpoint: Endpoint,
) where
    R: AsyncRead + Unpin,
{
    let mut reassembler =
        Reassembler::with_limits(MAX_PARTIAL_MESSAGES, shared.config.max_reassembly_bytes());
    let mut status = shared.status.subscribe();
    loop {
        let item = tokio::select! {
            _ = status.wait_for(ConnectionStatus::is_closed) => break,
            item = reader.next() => item,
        };
        let result = match item {
            Some(Ok(raw)) => handle_packet(&shared, &mut endpoint, &mut reassembler, raw),
            Some(Err(err)) => Err(err),
            None => Err(TransportError::ConnectionClosed),
        };
        match result {
            Ok(()) => {}
            Err(err) if !err.is_fatal() => warn!(error = %err, "dropping message"),
            Err(err) => {
                shared.teardown(Some(err));
                break;
            }
        }
    }
    debug!("read loop finished");
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    writer: W,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, BytesCodec::new());
    while let Some(out) = outbox.recv().await {
        match out {
            Outgoing::Packet(bytes) => {
                if let Err(err) = sink.send(bytes).await {
                    shared.teardown(Some(err.into()));
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    if let Err(err) = SinkExt::<Bytes>::close(&mut sink).await {
        debug!(error = %err, "closing writer");
    }
    debug!("write loop finished");
}

/// What the keepalive task should do on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
    Send,
    /// The tick came late (suspend); restart the reference point and send.
    Reset,
    Timeout,
}

/// Heartbeat decision for one tick.
///
/// A gap of more than two intervals since the previous tick means the
/// process was not running; that is not the peer's fault.
pub(crate) fn heartbeat_action(
    now: Instant,
    last_tick: Instant,
    last_heartbeat: Instant,
    interval: Duration,
) -> HeartbeatAction {
    if now.duration_since(last_tick) > interval * 2 {
        return HeartbeatAction::Reset;
    }
    if now.duration_since(last_heartbeat) > interval * 2 {
        return HeartbeatAction::Timeout;
    }
    HeartbeatAction::Send
}

async fn keepalive_loop(shared: Arc<Shared>, interval: Duration) {
    let mut last_tick = Instant::now();
    let mut status = shared.status.subscribe();
    loop {
        tokio::select! {
            _ = status.wait_for(ConnectionStatus::is_closed) => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let now = Instant::now();
        if !shared.is_connected() {
            last_tick = now;
            continue;
        }

        let last_heartbeat = *shared.last_heartbeat.lock();
        match heartbeat_action(now, last_tick, last_heartbeat, interval) {
            HeartbeatAction::Timeout => {
                shared.teardown(Some(TransportError::HeartbeatTimeout));
                break;
            }
            HeartbeatAction::Reset => {
                debug!("heartbeat gap detected, resetting reference");
                *shared.last_heartbeat.lock() = now;
            }
            HeartbeatAction::Send => {}
        }
        last_tick = now;

        if let Err(err) = shared.send_control(MessageType::Heartbeat, &[]) {
            shared.teardown(Some(err));
            break;
        }
    }
}

/// Builds connections from a config and a key store.
#[derive(Clone)]
pub struct TransportDriver {
    config: TransportConfig,
    peers: Arc<dyn PeerKeyStore>,
    ctx: CryptoContext,
    verifier: Option<Arc<dyn KeyVerifier>>,
}

impl TransportDriver {
    pub fn new(config: TransportConfig, peers: Arc<dyn PeerKeyStore>) -> Self {
        Self {
            config,
            peers,
            ctx: CryptoContext::new(),
            verifier: None,
        }
    }

    /// Use an explicit crypto context (for deterministic tests).
    pub fn with_context(mut self, ctx: CryptoContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Ask `verifier` about server keys that are not in the store yet.
    pub fn with_key_verifier(mut self, verifier: impl KeyVerifier + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<dyn PeerKeyStore> {
        &self.peers
    }

    /// Spawn the I/O tasks over `stream`.
    pub(crate) fn start<S>(&self, stream: S, role: Role, endpoint: Endpoint) -> Arc<Shared>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let state = ConnectionState::new(self.ctx.clone(), self.peers.clone(), role)
            .with_rekey_limit(self.config.rekey_byte_limit)
            .with_public_requester(self.config.public_requester);
        let state = Arc::new(Mutex::new(state));

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let shared = Arc::new(Shared {
            state: state.clone(),
            mux: RequestMultiplexer::new(),
            outbox,
            status,
            config: self.config.clone(),
            closing: AtomicBool::new(false),
            disconnect_sent: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
            rekeys_sent: AtomicU64::new(0),
            rekeys_received: AtomicU64::new(0),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(
            read_half,
            PacketCodec::new(state, self.config.max_packet_size()),
        );

        tokio::spawn(write_loop(shared.clone(), write_half, outbox_rx));
        tokio::spawn(read_loop(shared.clone(), reader, endpoint));
        if role == Role::Requester {
            if let Some(interval) = self.config.heartbeat_interval() {
                tokio::spawn(keepalive_loop(shared.clone(), interval));
            }
        }
        shared
    }

    /// Wait for the handshake to finish or fail.
    pub(crate) async fn wait_connected(&self, shared: &Arc<Shared>) -> TransportResult<()> {
        let mut rx = shared.status.subscribe();
        let wait = async {
            loop {
                let status = rx.borrow_and_update().clone();
                match status {
                    ConnectionStatus::Connected => return Ok(()),
                    ConnectionStatus::Closed(reason) => {
                        return Err(reason.unwrap_or(TransportError::ConnectionClosed))
                    }
                    ConnectionStatus::Connecting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionClosed);
                }
            }
        };

        match tokio::time::timeout(self.config.connect_timeout(), wait).await {
            Ok(result) => result,
            Err(_) => {
                shared.teardown(Some(TransportError::Timeout));
                Err(TransportError::Timeout)
            }
        }
    }

    /// Connect as a client over `stream` and run the full handshake.
    ///
    /// Resolves once BIP150 reaches Success, or with the failure.
    pub async fn connect<S>(&self, stream: S) -> TransportResult<ConnectionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config.validate()?;
        let endpoint = Endpoint::Client {
            peer_name: self.config.peer_name.clone(),
            verifier: self.verifier.clone(),
            presented: false,
        };
        let shared = self.start(stream, Role::Requester, endpoint);

        if let Err(err) = shared.send_control(MessageType::AeadSetup, &[]) {
            shared.teardown(Some(err.clone()));
            return Err(err);
        }
        self.wait_connected(&shared).await?;

        let handle = ConnectionHandle { shared };
        info!(
            peer = %self.config.peer_name,
            session = %handle.session_id_hex(),
            "secure connection established"
        );
        Ok(handle)
    }

    pub(crate) fn handle(shared: Arc<Shared>) -> ConnectionHandle {
        ConnectionHandle { shared }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_action() {
        let start = Instant::now();
        let interval = Duration::from_secs(10);

        assert_eq!(
            heartbeat_action(start + interval, start, start, interval),
            HeartbeatAction::Send
        );
        // No answer for more than two intervals.
        assert_eq!(
            heartbeat_action(start + interval * 3, start + interval * 2, start, interval),
            HeartbeatAction::Timeout
        );
        // The tick itself came late: suspend, not a dead peer.
        assert_eq!(
            heartbeat_action(start + interval * 5, start, start, interval),
            HeartbeatAction::Reset
        );
    }

    #[test]
    fn test_status_predicates() {
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::Connecting.is_closed());
        assert!(ConnectionStatus::Closed(None).is_closed());
    }

    #[test]
    fn test_closure_key_verifier() {
        let verifier = |name: &str, _key: &PublicKey, _fp: &str| name == "indexer";
        let key = crate::crypto::IdentityKeypair::generate(&CryptoContext::from_seed(70)).public();
        assert!(verifier.verify("indexer", &key, "fp"));
        assert!(!verifier.verify("other", &key, "fp"));
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_claims_one_disconnect() {
        let store: Arc<dyn PeerKeyStore> =
            Arc::new(crate::peers::InMemoryPeerStore::without_identity());
        let driver = TransportDriver::new(TransportConfig::default(), store);
        let (io, _peer) = tokio::io::duplex(1024);
        let (requests, _rx) = mpsc::unbounded_channel();
        let shared = driver.start(
            io,
            Role::Responder,
            Endpoint::Server {
                requests,
                setup_seen: false,
            },
        );

        let claims: Vec<_> = (0..8)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || shared.claim_disconnect())
            })
            .collect();
        let won = claims
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(won, 1);

        let handle = TransportDriver::handle(shared);
        handle.shutdown();
        assert!(handle.status().is_closed());
    }
}
