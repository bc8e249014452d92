//! Node configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use strand_types::NetworkId;

use crate::NodeError;

/// Configuration for a Strand node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Which network to connect to.
    #[serde(default = "default_network")]
    pub network: NetworkId,

    /// Data directory for ledger storage.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// LMDB map size in bytes.
    #[serde(default = "default_map_size")]
    pub map_size: usize,

    /// Port to listen on for P2P connections.
    #[serde(default)]
    pub port: u16,

    /// Maximum number of peer channels.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Accept peers from private address ranges.
    #[serde(default)]
    pub allow_private_addresses: bool,

    /// Close connections that made no progress for this long.
    #[serde(default = "default_tcp_idle_timeout")]
    pub tcp_idle_timeout_secs: u64,

    /// Slots in the datagram buffer ring.
    #[serde(default = "default_ring_slots")]
    pub message_ring_slots: usize,

    /// Peers to dial on startup, as `<address>:<port>` strings.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    /// Cap on each prioritized-frontier collection.
    #[serde(default = "default_max_priority_frontiers")]
    pub max_priority_cementable_frontiers: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Attempts granted to an ordinary lazy pull.
    #[serde(default = "default_lazy_retry_limit")]
    pub lazy_retry_limit: u32,

    /// Attempts granted to speculative destination pulls.
    #[serde(default = "default_lazy_destinations_retry_limit")]
    pub lazy_destinations_retry_limit: u32,

    /// Blocks requested per lazy pull before adaptive shrinking.
    #[serde(default = "default_lazy_max_pull_blocks")]
    pub lazy_max_pull_blocks: u32,

    /// Floor for the adaptive per-pull count.
    #[serde(default = "default_lazy_min_pull_blocks")]
    pub lazy_min_pull_blocks: u32,

    /// Target concurrent blocks per connection; `3 ×` this caps the
    /// in-flight pull queue.
    #[serde(default = "default_target_blocks_per_connection")]
    pub target_blocks_per_connection: usize,

    /// Disables the legacy frontier-scan bootstrap. Raises the lazy seed
    /// cap and enables speculative destination pulls.
    #[serde(default)]
    pub disable_legacy_bootstrap: bool,

    /// Minimum pending amount a wallet-lazy pull asks for.
    #[serde(default)]
    pub wallet_minimum_amount_raw: u128,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            lazy_retry_limit: default_lazy_retry_limit(),
            lazy_destinations_retry_limit: default_lazy_destinations_retry_limit(),
            lazy_max_pull_blocks: default_lazy_max_pull_blocks(),
            lazy_min_pull_blocks: default_lazy_min_pull_blocks(),
            target_blocks_per_connection: default_target_blocks_per_connection(),
            disable_legacy_bootstrap: false,
            wallet_minimum_amount_raw: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// Cemented blocks per write transaction in the bounded walker.
    #[serde(default = "default_batch_write_size")]
    pub batch_write_size: usize,

    /// Pending-set size beyond which the unbounded walker takes over.
    #[serde(default = "default_unbounded_cutoff")]
    pub unbounded_cutoff: usize,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            batch_write_size: default_batch_write_size(),
            unbounded_cutoff: default_unbounded_cutoff(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            data_dir: default_data_dir(),
            map_size: default_map_size(),
            port: 0,
            max_peers: default_max_peers(),
            allow_private_addresses: false,
            tcp_idle_timeout_secs: default_tcp_idle_timeout(),
            message_ring_slots: default_ring_slots(),
            bootstrap_peers: Vec::new(),
            bootstrap: BootstrapConfig::default(),
            confirmation: ConfirmationConfig::default(),
            max_priority_cementable_frontiers: default_max_priority_frontiers(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, NodeError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Config for tests: dev network, given data dir, everything small.
    pub fn test_default(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            map_size: 64 * 1024 * 1024,
            allow_private_addresses: true,
            ..Self::default()
        }
    }
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_network() -> NetworkId {
    NetworkId::Dev
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./strand_data")
}

fn default_map_size() -> usize {
    16 * 1024 * 1024 * 1024
}

fn default_max_peers() -> usize {
    64
}

fn default_tcp_idle_timeout() -> u64 {
    120
}

fn default_ring_slots() -> usize {
    1024
}

fn default_lazy_retry_limit() -> u32 {
    64
}

fn default_lazy_destinations_retry_limit() -> u32 {
    2
}

fn default_lazy_max_pull_blocks() -> u32 {
    512
}

fn default_lazy_min_pull_blocks() -> u32 {
    32
}

fn default_target_blocks_per_connection() -> usize {
    16
}

fn default_batch_write_size() -> usize {
    4096
}

fn default_unbounded_cutoff() -> usize {
    16_384
}

fn default_max_priority_frontiers() -> usize {
    16_384
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NodeConfig::default();
        assert_eq!(config.network, NetworkId::Dev);
        assert!(config.bootstrap.lazy_min_pull_blocks <= config.bootstrap.lazy_max_pull_blocks);
        assert!(config.confirmation.batch_write_size > 0);
    }

    #[test]
    fn toml_roundtrip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "port = 7075\n[bootstrap]\nlazy_retry_limit = 8\n").unwrap();

        let config = NodeConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.port, 7075);
        assert_eq!(config.bootstrap.lazy_retry_limit, 8);
        // Unspecified fields take defaults.
        assert_eq!(config.max_peers, default_max_peers());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "port = \"not-a-number\"").unwrap();
        assert!(matches!(
            NodeConfig::from_toml_file(&path),
            Err(NodeError::Config(_))
        ));
    }
}
