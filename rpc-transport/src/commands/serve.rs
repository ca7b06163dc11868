use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::FileConfig;
use crate::crypto::fingerprint;
use crate::peers::write_cookie;
use crate::rpc::{ServerConnection, TransportDriver};

/// Run an echo server: every request is answered with its own payload.
pub fn run(config_path: &Path, listen: &str, cookie: Option<PathBuf>) -> Result<()> {
    let config = FileConfig::load(config_path)
        .context("No config found. Run 'bth-rpc keygen' first.")?;
    let identity = config
        .identity()?
        .context("Config has no [identity]; a server needs one")?;

    if let Some(path) = &cookie {
        write_cookie(path, &identity.public())?;
        info!(path = %path.display(), "wrote identity cookie");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async { serve(config, listen).await })
}

async fn serve(config: FileConfig, listen: &str) -> Result<()> {
    let driver = TransportDriver::new(config.transport.clone(), config.peer_store()?);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;

    if let Some(own) = driver.peers().own_public_key() {
        info!(addr = %listen, fingerprint = %fingerprint(&own), "listening");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let driver = driver.clone();
                tokio::spawn(async move {
                    match driver.accept(stream).await {
                        Ok(conn) => echo(conn).await,
                        Err(err) => warn!(%addr, error = %err, "handshake failed"),
                    }
                });
            }
        }
    }
}

async fn echo(mut conn: ServerConnection) {
    while let Some(request) = conn.next_request().await {
        if let Err(err) = conn.reply(request.id, &request.payload) {
            warn!(msg_id = request.id, error = %err, "reply failed");
            break;
        }
    }
    if let Some(reason) = conn.handle().closed().await {
        info!(reason = %reason, "client connection closed");
    }
}
