// Copyright (c) 2024 Botho Foundation

//! Long-term identity keys: our own and the ones we trust.
//!
//! The transport never owns key storage. It reads keys through the
//! [`PeerKeyStore`] trait, so a wallet can back it with its own database.
//! [`InMemoryPeerStore`] is the implementation built from a config file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use tracing::debug;

use crate::crypto::{IdentityKeypair, PublicKey, PUBKEY_SIZE};
use crate::error::ConfigError;

/// Lookup of known identity keys.
pub trait PeerKeyStore: Send + Sync {
    /// Public key registered under `name`.
    fn public_key(&self, name: &str) -> Option<PublicKey>;

    /// Name a public key is registered under.
    fn name_of(&self, key: &PublicKey) -> Option<String>;

    /// Every key allowed to authenticate to us.
    fn authorized_keys(&self) -> Vec<PublicKey>;

    /// Our own primary identity.
    fn own_public_key(&self) -> Option<PublicKey>;

    /// The private half of one of our identities.
    fn identity_for(&self, key: &PublicKey) -> Option<IdentityKeypair>;

    /// Register (or replace) a peer key.
    fn add_peer(&self, name: &str, key: PublicKey);

    /// Forget a peer. Returns whether it was known.
    fn remove_peer(&self, name: &str) -> bool;
}

/// Thread-safe in-memory key store.
#[derive(Default)]
pub struct InMemoryPeerStore {
    identities: Vec<IdentityKeypair>,
    peers: RwLock<BTreeMap<String, PublicKey>>,
}

impl InMemoryPeerStore {
    pub fn new(identity: IdentityKeypair) -> Self {
        Self {
            identities: vec![identity],
            peers: RwLock::new(BTreeMap::new()),
        }
    }

    /// A store with no identity of its own. Useful for a client that only
    /// pins server keys.
    pub fn without_identity() -> Self {
        Self::default()
    }

    pub fn with_peer(self, name: &str, key: PublicKey) -> Self {
        self.peers.write().insert(name.to_string(), key);
        self
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

impl PeerKeyStore for InMemoryPeerStore {
    fn public_key(&self, name: &str) -> Option<PublicKey> {
        self.peers.read().get(name).copied()
    }

    fn name_of(&self, key: &PublicKey) -> Option<String> {
        self.peers
            .read()
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(name, _)| name.clone())
    }

    fn authorized_keys(&self) -> Vec<PublicKey> {
        self.peers.read().values().copied().collect()
    }

    fn own_public_key(&self) -> Option<PublicKey> {
        self.identities.first().map(IdentityKeypair::public)
    }

    fn identity_for(&self, key: &PublicKey) -> Option<IdentityKeypair> {
        self.identities.iter().find(|id| id.public() == *key).cloned()
    }

    fn add_peer(&self, name: &str, key: PublicKey) {
        debug!(peer = name, key = %key, "adding peer key");
        self.peers.write().insert(name.to_string(), key);
    }

    fn remove_peer(&self, name: &str) -> bool {
        self.peers.write().remove(name).is_some()
    }
}

/// Write an identity public key to a cookie file (raw 33 bytes).
pub fn write_cookie(path: &Path, key: &PublicKey) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, key.as_bytes()).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }
    Ok(())
}

/// Read an identity public key from a cookie file.
pub fn read_cookie(path: &Path) -> Result<PublicKey, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    if bytes.len() != PUBKEY_SIZE {
        return Err(ConfigError::InvalidKey {
            name: path.display().to_string(),
            reason: format!("cookie holds {} bytes, expected {}", bytes.len(), PUBKEY_SIZE),
        });
    }
    PublicKey::from_bytes(&bytes).map_err(|e| ConfigError::InvalidKey {
        name: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoContext;
    use tempfile::tempdir;

    #[test]
    fn test_lookup_by_name_and_key() {
        let ctx = CryptoContext::from_seed(20);
        let own = IdentityKeypair::generate(&ctx);
        let peer = IdentityKeypair::generate(&ctx).public();

        let store = InMemoryPeerStore::new(own.clone()).with_peer("indexer", peer);
        assert_eq!(store.public_key("indexer"), Some(peer));
        assert_eq!(store.public_key("other"), None);
        assert_eq!(store.name_of(&peer).as_deref(), Some("indexer"));
        assert_eq!(store.own_public_key(), Some(own.public()));
        assert!(store.identity_for(&own.public()).is_some());
        assert!(store.identity_for(&peer).is_none());
    }

    #[test]
    fn test_add_and_remove() {
        let ctx = CryptoContext::from_seed(21);
        let store = InMemoryPeerStore::without_identity();
        let key = IdentityKeypair::generate(&ctx).public();

        store.add_peer("a", key);
        assert_eq!(store.authorized_keys(), vec![key]);
        assert!(store.remove_peer("a"));
        assert!(!store.remove_peer("a"));
        assert_eq!(store.peer_count(), 0);
        assert!(store.own_public_key().is_none());
    }

    #[test]
    fn test_cookie_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("server.cookie");
        let key = IdentityKeypair::generate(&CryptoContext::from_seed(22)).public();

        write_cookie(&path, &key).unwrap();
        assert_eq!(read_cookie(&path).unwrap(), key);
    }

    #[test]
    fn test_bad_cookie() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.cookie");
        fs::write(&path, [1u8; 10]).unwrap();
        assert!(matches!(
            read_cookie(&path),
            Err(ConfigError::InvalidKey { .. })
        ));
        assert!(matches!(
            read_cookie(&dir.path().join("missing")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_cookie_write_failure() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let key = IdentityKeypair::generate(&CryptoContext::from_seed(23)).public();

        assert!(matches!(
            write_cookie(&blocker.join("server.cookie"), &key),
            Err(ConfigError::Write { .. })
        ));
    }
}
