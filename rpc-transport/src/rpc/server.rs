// Copyright (c) 2024 Botho Foundation

//! Responder side of the transport.
//!
//! A server presents its identity key, answers the BIP151/BIP150
//! handshake, and then hands complete requests to the application. Replies
//! reuse the request id so the client can correlate them; push
//! notifications use the reserved push id.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{HandshakeError, TransportResult};
use crate::handshake::Role;
use crate::rpc::driver::{ConnectionHandle, Endpoint, TransportDriver};
use crate::wire::framer::PUSH_ID;

/// A complete request received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub id: u32,
    pub payload: Bytes,
}

/// Server end of an authenticated connection.
pub struct ServerConnection {
    handle: ConnectionHandle,
    requests: mpsc::UnboundedReceiver<IncomingRequest>,
}

impl ServerConnection {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Next request, or `None` once the connection is closed.
    pub async fn next_request(&mut self) -> Option<IncomingRequest> {
        self.requests.recv().await
    }

    /// Answer the request with id `id`.
    pub fn reply(&self, id: u32, payload: impl AsRef<[u8]>) -> TransportResult<()> {
        self.handle.send_with_id(id, payload.as_ref())
    }

    /// Send an unsolicited notification to the client.
    pub fn push(&self, payload: impl AsRef<[u8]>) -> TransportResult<()> {
        self.handle.send_with_id(PUSH_ID, payload.as_ref())
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    pub fn into_parts(self) -> (ConnectionHandle, mpsc::UnboundedReceiver<IncomingRequest>) {
        (self.handle, self.requests)
    }
}

impl TransportDriver {
    /// Accept a client over `stream` and run the responder handshake.
    ///
    /// Requires an own identity key in the peer store.
    pub async fn accept<S>(&self, stream: S) -> TransportResult<ServerConnection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config().validate()?;
        if self.peers().own_public_key().is_none() {
            return Err(HandshakeError::MissingOwnKey.into());
        }

        let (tx, requests) = mpsc::unbounded_channel();
        let endpoint = Endpoint::Server {
            requests: tx,
            setup_seen: false,
        };
        let shared = self.start(stream, Role::Responder, endpoint);
        self.wait_connected(&shared).await?;

        let handle = TransportDriver::handle(shared);
        info!(
            client = ?handle.peer_public_key().map(|k| crate::crypto::fingerprint(&k)),
            session = %handle.session_id_hex(),
            "client authenticated"
        );
        Ok(ServerConnection { handle, requests })
    }
}
