//! Top-level node configuration.
//!
//! Aggregates sub-configs the way the teacher's `chain::config::ChainConfig`
//! does: one struct a binary's `main` can build from defaults, a config
//! file, or CLI flags, and hand down to the store/daemon/metrics layers.

use std::net::SocketAddr;

/// Where and how the three-table `Store` persists.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Path to the RocksDB directory. Ignored if `in_memory` is set.
    pub path: String,
    /// Use an in-memory backend instead of RocksDB (for demos/tests).
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "registry-data".to_string(),
            in_memory: false,
        }
    }
}

/// Address the daemon listens on for peer connections (spec §6, wire protocol).
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub listen_addr: SocketAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let addr: SocketAddr = "0.0.0.0:7878"
            .parse()
            .expect("hard-coded listen address should parse");
        Self { listen_addr: addr }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let addr: SocketAddr = "127.0.0.1:9898"
            .parse()
            .expect("hard-coded metrics listen address should parse");
        Self {
            enabled: true,
            listen_addr: addr,
        }
    }
}

/// Mining parameters for a node that mints blocks (spec §4.4, §6 CLI `-m`).
#[derive(Clone, Debug)]
pub struct MiningConfig {
    /// Number of buffered operations that triggers a mint attempt.
    pub operations_threshold: u32,
    /// Proof-of-work difficulty passed to `Block::mine`.
    pub difficulty: u32,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            operations_threshold: 2,
            difficulty: 20,
        }
    }
}

/// Top-level configuration for a registry node, aggregating storage,
/// network, metrics, and mining sub-configs.
#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub metrics: MetricsConfig,
    pub mining: MiningConfig,
}
