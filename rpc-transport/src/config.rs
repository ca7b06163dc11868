// Copyright (c) 2024 Botho Foundation

//! Transport configuration.
//!
//! [`TransportConfig`] holds the tunables of one connection. [`FileConfig`]
//! is the on-disk TOML layout used by the `bth-rpc` binary: the transport
//! section plus our identity key and the peers we trust.
//!
//! # Example
//!
//! ```
//! use bth_rpc_transport::config::TransportConfig;
//!
//! let config = TransportConfig::builder()
//!     .peer_name("indexer")
//!     .heartbeat_interval_secs(0)
//!     .rekey_byte_limit(64 * 1024)
//!     .build();
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.peer_name, "indexer");
//! ```
//!
//! ```toml
//! [transport]
//! peer_name = "indexer"
//! heartbeat_interval_secs = 30
//!
//! [identity]
//! private_key = "<64 hex chars>"
//!
//! [[peers]]
//! name = "indexer"
//! public_key = "<66 hex chars>"
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{IdentityKeypair, PublicKey};
use crate::error::ConfigError;
use crate::handshake::session::DEFAULT_REKEY_BYTE_LIMIT;
use crate::peers::{InMemoryPeerStore, PeerKeyStore};
use crate::wire::framer::{DEFAULT_FRAGMENT_PAYLOAD, DEFAULT_REASSEMBLY_BYTES, MAX_FRAGMENTS};

/// Largest fragment payload accepted in a config.
pub const MAX_FRAGMENT_PAYLOAD: usize = 16 * 1024 * 1024;

/// Configuration of one secure RPC connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Name the server identity key is registered under.
    #[serde(default = "default_peer_name")]
    pub peer_name: String,

    /// Bytes encrypted on one key set before an in-band rekey.
    #[serde(default = "default_rekey_byte_limit")]
    pub rekey_byte_limit: u64,

    /// Seconds between time-based rekeys. 0 disables.
    #[serde(default = "default_rekey_interval")]
    pub rekey_interval_secs: u64,

    /// Seconds between client heartbeats. 0 disables.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Seconds allowed for the whole handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Payload bytes per fragment.
    #[serde(default = "default_max_fragment_payload")]
    pub max_fragment_payload: usize,

    /// Accept requesters whose identity is not in the peer store.
    #[serde(default)]
    pub public_requester: bool,
}

fn default_peer_name() -> String {
    "server".to_string()
}

fn default_rekey_byte_limit() -> u64 {
    DEFAULT_REKEY_BYTE_LIMIT
}

fn default_rekey_interval() -> u64 {
    600
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_fragment_payload() -> usize {
    DEFAULT_FRAGMENT_PAYLOAD
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            peer_name: default_peer_name(),
            rekey_byte_limit: default_rekey_byte_limit(),
            rekey_interval_secs: default_rekey_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connect_timeout_secs: default_connect_timeout(),
            max_fragment_payload: default_max_fragment_payload(),
            public_requester: false,
        }
    }
}

impl TransportConfig {
    /// Create a new builder for transport configuration.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }

    pub fn rekey_interval(&self) -> Option<Duration> {
        (self.rekey_interval_secs > 0).then(|| Duration::from_secs(self.rekey_interval_secs))
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0)
            .then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Largest packet body the reader accepts: one full fragment plus its
    /// headers.
    pub fn max_packet_size(&self) -> usize {
        self.max_fragment_payload + 64
    }

    /// Bytes the reader buffers for unfinished messages. Room for a few
    /// maximal messages at the configured fragment size.
    pub fn max_reassembly_bytes(&self) -> usize {
        DEFAULT_REASSEMBLY_BYTES.max(self.max_packet_size() * MAX_FRAGMENTS * 4)
    }

    /// Check the values make sense together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_name.is_empty() {
            return Err(ConfigError::Invalid("peer_name must not be empty".into()));
        }
        if self.rekey_byte_limit == 0 {
            return Err(ConfigError::Invalid("rekey_byte_limit must be positive".into()));
        }
        if self.max_fragment_payload == 0 {
            return Err(ConfigError::Invalid(
                "max_fragment_payload must be positive".into(),
            ));
        }
        if self.max_fragment_payload > MAX_FRAGMENT_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "max_fragment_payload {} exceeds {}",
                self.max_fragment_payload, MAX_FRAGMENT_PAYLOAD
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for transport configuration.
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Set the name the server key is registered under.
    pub fn peer_name(mut self, name: impl Into<String>) -> Self {
        self.config.peer_name = name.into();
        self
    }

    /// Set the byte-count rekey threshold.
    pub fn rekey_byte_limit(mut self, limit: u64) -> Self {
        self.config.rekey_byte_limit = limit;
        self
    }

    /// Set the time-based rekey interval.
    pub fn rekey_interval_secs(mut self, secs: u64) -> Self {
        self.config.rekey_interval_secs = secs;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_interval_secs = secs;
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    /// Set the fragment payload size.
    pub fn max_fragment_payload(mut self, size: usize) -> Self {
        self.config.max_fragment_payload = size;
        self
    }

    /// Allow requesters unknown to the peer store.
    pub fn public_requester(mut self, allow: bool) -> Self {
        self.config.public_requester = allow;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportConfig {
        self.config
    }
}

/// Identity section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Hex-encoded secp256k1 private key.
    pub private_key: String,
}

/// One trusted peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    /// Hex-encoded compressed public key.
    pub public_key: String,
}

/// On-disk configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityConfig>,

    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

impl FileConfig {
    /// Load config from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = toml::from_str(contents)?;
        config.transport.validate()?;
        Ok(config)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("failed to serialize config: {e}")))?;
        fs::write(path, contents).map_err(io_err)?;

        // The file holds a private key.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }
        Ok(())
    }

    /// Decode the identity key, if one is configured.
    pub fn identity(&self) -> Result<Option<IdentityKeypair>, ConfigError> {
        self.identity
            .as_ref()
            .map(|id| {
                IdentityKeypair::from_hex(&id.private_key).map_err(|e| ConfigError::InvalidKey {
                    name: "identity".to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Build a peer store from the identity and `[[peers]]` entries.
    pub fn peer_store(&self) -> Result<Arc<dyn PeerKeyStore>, ConfigError> {
        let store = match self.identity()? {
            Some(identity) => InMemoryPeerStore::new(identity),
            None => InMemoryPeerStore::without_identity(),
        };
        for peer in &self.peers {
            let key = PublicKey::from_hex(&peer.public_key).map_err(|e| {
                ConfigError::InvalidKey {
                    name: peer.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            store.add_peer(&peer.name, key);
        }
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoContext;
    use tempfile::tempdir;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.rekey_byte_limit, 1_000_000_000);
        assert_eq!(config.max_fragment_payload, 65_536);
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(30)));
        assert!(!config.public_requester);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TransportConfig::builder()
            .peer_name("K1")
            .rekey_interval_secs(0)
            .heartbeat_interval_secs(0)
            .max_fragment_payload(1024)
            .public_requester(true)
            .build();

        assert_eq!(config.peer_name, "K1");
        assert_eq!(config.rekey_interval(), None);
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.max_packet_size(), 1024 + 64);
        assert!(config.public_requester);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        for config in [
            TransportConfig::builder().max_fragment_payload(0).build(),
            TransportConfig::builder().rekey_byte_limit(0).build(),
            TransportConfig::builder()
                .max_fragment_payload(MAX_FRAGMENT_PAYLOAD + 1)
                .build(),
            TransportConfig::builder().peer_name("").build(),
        ] {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = FileConfig::from_toml_str("[transport]\npeer_name = \"indexer\"\n").unwrap();
        assert_eq!(config.transport.peer_name, "indexer");
        assert_eq!(config.transport.connect_timeout_secs, 30);
        assert!(config.identity.is_none());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            FileConfig::from_toml_str("[transport\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            FileConfig::from_toml_str("[transport]\nmax_fragment_payload = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_config_roundtrip() {
        let ctx = CryptoContext::from_seed(60);
        let identity = IdentityKeypair::generate(&ctx);
        let peer = IdentityKeypair::generate(&ctx).public();

        let config = FileConfig {
            transport: TransportConfig::builder().peer_name("indexer").build(),
            identity: Some(IdentityConfig {
                private_key: identity.secret_hex().to_string(),
            }),
            peers: vec![PeerEntry {
                name: "indexer".to_string(),
                public_key: peer.to_hex(),
            }],
        };

        let dir = tempdir().unwrap();
        let path = dir.path().join("rpc.toml");
        config.save(&path).unwrap();

        let loaded = FileConfig::load(&path).unwrap();
        assert_eq!(loaded.transport, config.transport);
        assert_eq!(loaded.identity().unwrap().unwrap().public(), identity.public());

        let store = loaded.peer_store().unwrap();
        assert_eq!(store.public_key("indexer"), Some(peer));
        assert_eq!(store.own_public_key(), Some(identity.public()));
    }

    #[test]
    fn test_bad_peer_key() {
        let config = FileConfig {
            peers: vec![PeerEntry {
                name: "broken".to_string(),
                public_key: "00ff".to_string(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            config.peer_store(),
            Err(ConfigError::InvalidKey { name, .. }) if name == "broken"
        ));
    }
}
