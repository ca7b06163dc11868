use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::{FileConfig, IdentityConfig};
use crate::crypto::{fingerprint, CryptoContext, IdentityKeypair};

/// Generate an identity key and write a fresh config file.
pub fn run(config_path: &Path, peer_name: Option<&str>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "Config already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let identity = IdentityKeypair::generate(&CryptoContext::new());
    let public = identity.public();

    let mut config = FileConfig {
        identity: Some(IdentityConfig {
            private_key: identity.secret_hex().to_string(),
        }),
        ..Default::default()
    };
    if let Some(name) = peer_name {
        config.transport.peer_name = name.to_string();
    }
    config
        .save(config_path)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Wrote {}", config_path.display());
    println!("  Public key:  {}", public.to_hex());
    println!("  Fingerprint: {}", fingerprint(&public));
    Ok(())
}
