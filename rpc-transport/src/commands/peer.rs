use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::{FileConfig, PeerEntry};
use crate::crypto::{fingerprint, PublicKey};
use crate::peers::read_cookie;

fn load(config_path: &Path) -> Result<FileConfig> {
    FileConfig::load(config_path).context("No config found. Run 'bth-rpc keygen' first.")
}

/// Trust `key` (hex or a cookie file path) under `name`.
pub fn add(config_path: &Path, name: &str, key: &str) -> Result<()> {
    let mut config = load(config_path)?;
    let public = match PublicKey::from_hex(key) {
        Ok(public) => public,
        Err(_) => read_cookie(Path::new(key))
            .with_context(|| format!("'{key}' is neither a hex key nor a readable cookie"))?,
    };

    config.peers.retain(|peer| peer.name != name);
    config.peers.push(PeerEntry {
        name: name.to_string(),
        public_key: public.to_hex(),
    });
    config.save(config_path)?;

    println!("Trusted {} as {}", fingerprint(&public), name);
    Ok(())
}

pub fn remove(config_path: &Path, name: &str) -> Result<()> {
    let mut config = load(config_path)?;
    let before = config.peers.len();
    config.peers.retain(|peer| peer.name != name);
    if config.peers.len() == before {
        bail!("No peer named {name}");
    }
    config.save(config_path)?;
    println!("Removed {name}");
    Ok(())
}

pub fn list(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    if let Some(identity) = config.identity()? {
        println!("Identity: {}", fingerprint(&identity.public()));
    }
    if config.peers.is_empty() {
        println!("(no trusted peers)");
    }
    for peer in &config.peers {
        let fp = PublicKey::from_hex(&peer.public_key)
            .map(|k| fingerprint(&k))
            .unwrap_or_else(|_| "<invalid key>".to_string());
        println!("  {:<16} {}", peer.name, fp);
    }
    Ok(())
}
