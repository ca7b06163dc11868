// Copyright (c) 2024 Botho Foundation
//
//! Shared helpers for transport integration tests.
//!
//! Builds a wallet/indexer identity pair with mutual trust and runs both
//! ends of a connection over an in-memory duplex stream.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use bth_rpc_transport::{
    ConnectionHandle, CryptoContext, IdentityKeypair, InMemoryPeerStore, PeerKeyStore,
    ServerConnection, TransportConfig, TransportDriver, TransportResult,
};

/// Name the client pins the server key under.
pub const SERVER_NAME: &str = "indexer";

/// Name the server knows the client as.
pub const CLIENT_NAME: &str = "wallet";

/// Upper bound for any single test step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Identities and key stores for one client/server pair.
pub struct TestKeys {
    pub client: IdentityKeypair,
    pub server: IdentityKeypair,
    pub client_store: Arc<InMemoryPeerStore>,
    pub server_store: Arc<InMemoryPeerStore>,
}

impl TestKeys {
    /// Client and server that trust each other.
    pub fn mutual(seed: u64) -> Self {
        let keys = Self::strangers(seed);
        keys.client_store.add_peer(SERVER_NAME, keys.server.public());
        keys.server_store.add_peer(CLIENT_NAME, keys.client.public());
        keys
    }

    /// Client and server that know nothing about each other.
    pub fn strangers(seed: u64) -> Self {
        let ctx = CryptoContext::from_seed(seed);
        let client = IdentityKeypair::generate(&ctx);
        let server = IdentityKeypair::generate(&ctx);
        Self {
            client_store: Arc::new(InMemoryPeerStore::new(client.clone())),
            server_store: Arc::new(InMemoryPeerStore::new(server.clone())),
            client,
            server,
        }
    }
}

/// Config with heartbeats off so tests are not timing sensitive.
pub fn test_config() -> TransportConfig {
    TransportConfig::builder()
        .peer_name(SERVER_NAME)
        .heartbeat_interval_secs(0)
        .connect_timeout_secs(5)
        .build()
}

pub fn client_driver(keys: &TestKeys, config: TransportConfig) -> TransportDriver {
    let store: Arc<dyn PeerKeyStore> = keys.client_store.clone();
    TransportDriver::new(config, store)
}

pub fn server_driver(keys: &TestKeys, config: TransportConfig) -> TransportDriver {
    let store: Arc<dyn PeerKeyStore> = keys.server_store.clone();
    TransportDriver::new(config, store)
}

/// Run both handshakes concurrently over `client_io` and `server_io`.
pub async fn handshake<C, S>(
    client: &TransportDriver,
    server: &TransportDriver,
    client_io: C,
    server_io: S,
) -> (
    TransportResult<ConnectionHandle>,
    TransportResult<ServerConnection>,
)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let server = server.clone();
    let accept = tokio::spawn(async move { server.accept(server_io).await });
    let connected = timeout(STEP_TIMEOUT, client.connect(client_io))
        .await
        .expect("client handshake timed out");
    let accepted = timeout(STEP_TIMEOUT, accept)
        .await
        .expect("server handshake timed out")
        .expect("accept task panicked");
    (connected, accepted)
}

/// Connect a mutually trusting pair over a duplex stream.
pub async fn connected_pair(
    keys: &TestKeys,
    client_config: TransportConfig,
    server_config: TransportConfig,
) -> (ConnectionHandle, ServerConnection) {
    let (client_io, server_io) = duplex(64 * 1024);
    let (client, server) = handshake(
        &client_driver(keys, client_config),
        &server_driver(keys, server_config),
        client_io,
        server_io,
    )
    .await;
    (
        client.expect("client handshake failed"),
        server.expect("server handshake failed"),
    )
}

/// Answer every request with its own payload until the connection closes.
pub fn spawn_echo(mut conn: ServerConnection) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = conn.next_request().await {
            if conn.reply(request.id, &request.payload).is_err() {
                break;
            }
        }
    })
}
