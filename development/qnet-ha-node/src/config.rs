//! Node configuration
//!
//! Settings are layered: built-in defaults, then the optional config file
//! (TOML, JSON or YAML by extension), then `QNET_HA__`-prefixed environment
//! variables with `__` between nesting levels, e.g.
//! `QNET_HA__MONITORING__FAULT_THRESHOLD=5`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use qnet_ha::{HaConfig, NodeRecord, NodeRegistry, NodeRole};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "QNET_HA";

fn default_listen_address() -> String {
    "127.0.0.1:8443".to_string()
}

fn default_peer_role() -> NodeRole {
    NodeRole::Replica
}

/// Another member of the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,

    /// `host:port` of the peer's HTTPS endpoints
    pub address: String,

    #[serde(default = "default_peer_role")]
    pub role: NodeRole,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// HA layer settings
    #[serde(flatten)]
    pub ha: HaConfig,

    /// Address this node serves on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Other cluster members
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Data directory; backups go to `<data_dir>/backups` when set
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ha: HaConfig::default(),
            listen_address: default_listen_address(),
            peers: Vec::new(),
            data_dir: None,
        }
    }
}

impl NodeConfig {
    /// Load defaults, the optional file and environment overrides
    pub fn load(path: Option<&Path>) -> NodeResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(NodeError::Config(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Apply command-line overrides on top of the loaded settings
    pub fn apply_overrides(&mut self, node_id: Option<String>, data_dir: Option<PathBuf>) {
        if let Some(node_id) = node_id {
            self.ha.node_id = node_id;
        }
        if let Some(dir) = data_dir {
            self.data_dir = Some(dir);
        }
        if let Some(dir) = &self.data_dir {
            self.ha.backup.directory = dir.join("backups");
        }
    }

    /// Check the HA settings and the cluster layout
    pub fn validate(&self) -> NodeResult<()> {
        self.ha.validate()?;

        let mut known = HashSet::new();
        known.insert(self.ha.node_id.as_str());
        for peer in &self.peers {
            if peer.address.is_empty() {
                return Err(NodeError::Config(format!("peer {} has no address", peer.node_id)));
            }
            if !known.insert(peer.node_id.as_str()) {
                return Err(NodeError::Config(format!("duplicate node id {}", peer.node_id)));
            }
        }

        let failover = &self.ha.failover;
        for node in failover.primary.iter().chain(failover.backups.iter()) {
            if !known.contains(node.as_str()) {
                return Err(NodeError::Config(format!(
                    "failover references unknown node {}",
                    node
                )));
            }
        }
        if let Some(primary) = &failover.primary {
            if failover.backups.contains(primary) {
                return Err(NodeError::Config(format!(
                    "{} is listed as both primary and backup",
                    primary
                )));
            }
        }
        Ok(())
    }

    /// Role the local node starts with
    pub fn local_role(&self) -> NodeRole {
        let failover = &self.ha.failover;
        if failover.primary.as_deref() == Some(self.ha.node_id.as_str()) {
            NodeRole::Primary
        } else if failover.backups.contains(&self.ha.node_id) {
            NodeRole::Backup
        } else {
            NodeRole::Replica
        }
    }

    /// Registry holding the local node followed by every peer
    pub fn registry(&self) -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry.upsert(NodeRecord::new(
            self.ha.node_id.clone(),
            self.listen_address.clone(),
            self.local_role(),
        ));
        for peer in &self.peers {
            registry.upsert(NodeRecord::new(peer.node_id.clone(), peer.address.clone(), peer.role));
        }
        registry
    }

    /// Ids of every peer, in configuration order
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.node_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CLUSTER: &str = r#"
node_id = "a"
listen_address = "10.0.0.1:8443"

[replication]
replication_factor = 2

[failover]
primary = "a"
backups = ["b", "c"]

[fork]
rule = "heaviest_chain"

[[peers]]
node_id = "b"
address = "10.0.0.2:8443"
role = "Backup"

[[peers]]
node_id = "c"
address = "10.0.0.3:8443"
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_toml_file() {
        let file = write_config(CLUSTER);
        let config = NodeConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.ha.node_id, "a");
        assert_eq!(config.ha.replication.replication_factor, 2);
        assert_eq!(config.ha.replication.max_attempts, 3);
        assert_eq!(config.ha.fork.rule, qnet_ha::ForkChoiceRule::HeaviestChain);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].role, NodeRole::Replica);
        assert!(config.validate().is_ok());
        assert_eq!(config.local_role(), NodeRole::Primary);

        let ids: Vec<_> = config.registry().all().into_iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_file_rejected() {
        let err = NodeConfig::load(Some(Path::new("/nonexistent/qnet-ha.toml"))).unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[test]
    fn test_unknown_failover_node_rejected() {
        let file = write_config(&CLUSTER.replace(r#"backups = ["b", "c"]"#, r#"backups = ["b", "z"]"#));
        let config = NodeConfig::load(Some(file.path())).unwrap();
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let mut config = NodeConfig::default();
        config.ha.node_id = "a".into();
        config.peers = vec![PeerConfig {
            node_id: "a".into(),
            address: "10.0.0.1:8443".into(),
            role: NodeRole::Replica,
        }];
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn test_data_dir_moves_backups() {
        let mut config = NodeConfig::default();
        config.apply_overrides(Some("n9".into()), Some(PathBuf::from("/var/lib/qnet")));
        assert_eq!(config.ha.node_id, "n9");
        assert_eq!(config.ha.backup.directory, PathBuf::from("/var/lib/qnet/backups"));
    }
}
