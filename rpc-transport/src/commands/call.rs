use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::net::TcpStream;

use crate::config::FileConfig;
use crate::crypto::PublicKey;
use crate::peers::read_cookie;
use crate::rpc::TransportDriver;

/// Connect, send one request and print the response.
pub fn run(
    config_path: &Path,
    connect: &str,
    message: &str,
    cookie: Option<PathBuf>,
    trust_new: bool,
) -> Result<()> {
    let config = FileConfig::load(config_path)
        .context("No config found. Run 'bth-rpc keygen' first.")?;
    let peers = config.peer_store()?;

    if let Some(path) = &cookie {
        let key = read_cookie(path)?;
        peers.add_peer(&config.transport.peer_name, key);
    }

    let mut driver = TransportDriver::new(config.transport.clone(), peers);
    if trust_new {
        driver = driver.with_key_verifier(|name: &str, _key: &PublicKey, fp: &str| {
            println!("Trusting new key for {name}: {fp}");
            true
        });
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let stream = TcpStream::connect(connect)
            .await
            .with_context(|| format!("Failed to connect to {connect}"))?;
        let conn = driver.connect(stream).await?;
        if let Some(fp) = conn.bip150_fingerprint() {
            println!("Authenticated as {fp}");
        }

        let response = conn.request(message.as_bytes()).await?;
        println!("{}", String::from_utf8_lossy(&response));

        conn.shutdown();
        Ok(())
    })
}
