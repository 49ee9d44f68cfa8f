//! Cluster configuration

use crate::error::{ClusterError, Result};
use crate::state::{NodeId, WorkerId};
use crate::transport::TransportOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_PUSH_PULL_INTERVAL_MS: u64 = 1000;
const DEFAULT_JOIN_NODES_NUM: usize = 3;
const DEFAULT_JOIN_TIMEOUT_S: u64 = 10;
const DEFAULT_ASSEMBLE_TIMEOUT_S: u64 = 30;
const DEFAULT_ELECT_LEADER_S: u64 = 30;

/// Per-node configuration, YAML-shaped
///
/// Only `node_id` is required; every other key has a default. The worker
/// catalog must be identical on every node of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique node identifier, non-zero (0 is the "no leader" sentinel)
    pub node_id: NodeId,

    /// Transport bind address
    #[serde(default)]
    pub bind_addr: String,

    /// Transport bind port
    #[serde(default)]
    pub bind_port: u16,

    /// Address advertised to peers (defaults to the bind address)
    #[serde(default)]
    pub advertise_addr: String,

    /// Port advertised to peers (defaults to the bind port)
    #[serde(default)]
    pub advertise_port: u16,

    /// Interval between full state exchanges with a random peer
    #[serde(default = "default_push_pull_interval_ms")]
    pub push_pull_interval_ms: u64,

    /// First node of a fresh cluster: skip the seed join entirely
    #[serde(default)]
    pub first: bool,

    /// Seed peer endpoints, `host:port`
    #[serde(default)]
    pub join_nodes: Vec<String>,

    /// Member count expected after the initial join
    #[serde(default = "default_join_nodes_num")]
    pub join_nodes_num: usize,

    /// Seed join retry budget in seconds
    #[serde(default = "default_join_timeout_s")]
    pub join_timeout_s: u64,

    /// Deadline for one reconfiguration pipeline in seconds
    #[serde(default = "default_assemble_timeout_s")]
    pub assemble_timeout_s: u64,

    /// Additional cap on the election fixpoint wait in seconds
    #[serde(default = "default_elect_leader_s")]
    pub elect_leader_s: u64,

    /// Verbose event logging
    #[serde(default)]
    pub debug: bool,

    /// Ordered worker catalog, identical on every node
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerId>,
}

fn default_push_pull_interval_ms() -> u64 {
    DEFAULT_PUSH_PULL_INTERVAL_MS
}

fn default_join_nodes_num() -> usize {
    DEFAULT_JOIN_NODES_NUM
}

fn default_join_timeout_s() -> u64 {
    DEFAULT_JOIN_TIMEOUT_S
}

fn default_assemble_timeout_s() -> u64 {
    DEFAULT_ASSEMBLE_TIMEOUT_S
}

fn default_elect_leader_s() -> u64 {
    DEFAULT_ELECT_LEADER_S
}

fn default_workers() -> Vec<WorkerId> {
    (0..7).map(|i| format!("shard-{i}")).collect()
}

impl ClusterConfig {
    /// Configuration with defaults for everything but the node id
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            bind_addr: String::new(),
            bind_port: 0,
            advertise_addr: String::new(),
            advertise_port: 0,
            push_pull_interval_ms: DEFAULT_PUSH_PULL_INTERVAL_MS,
            first: false,
            join_nodes: Vec::new(),
            join_nodes_num: DEFAULT_JOIN_NODES_NUM,
            join_timeout_s: DEFAULT_JOIN_TIMEOUT_S,
            assemble_timeout_s: DEFAULT_ASSEMBLE_TIMEOUT_S,
            elect_leader_s: DEFAULT_ELECT_LEADER_S,
            debug: false,
            workers: default_workers(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(ClusterError::InvalidConfig(
                "node_id must be non-zero".into(),
            ));
        }
        if self.workers.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "worker catalog must not be empty".into(),
            ));
        }
        if !self.first && self.join_nodes.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "join_nodes required unless first is set".into(),
            ));
        }
        Ok(())
    }

    /// Transport-level node name, unique per process
    pub fn node_name(&self) -> String {
        format!("{:06}-{}", self.node_id, hostname())
    }

    /// The `host:port` endpoint peers use to reach this node
    pub fn advertised_endpoint(&self) -> String {
        let addr = if self.advertise_addr.is_empty() {
            &self.bind_addr
        } else {
            &self.advertise_addr
        };
        let port = if self.advertise_port == 0 {
            self.bind_port
        } else {
            self.advertise_port
        };
        format!("{addr}:{port}")
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            node_name: self.node_name(),
            bind_addr: self.bind_addr.clone(),
            bind_port: self.bind_port,
            advertise_addr: self.advertise_addr.clone(),
            advertise_port: self.advertise_port,
            push_pull_interval: Duration::from_millis(self.push_pull_interval_ms),
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_s)
    }

    pub fn assemble_timeout(&self) -> Duration {
        Duration::from_secs(self.assemble_timeout_s)
    }

    pub fn elect_timeout(&self) -> Duration {
        Duration::from_secs(self.elect_leader_s)
    }
}

/// Get system hostname via the `hostname` command, falling back to "unknown".
fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_on_parse() {
        let cfg: ClusterConfig = serde_yaml::from_str("node_id: 4\nfirst: true").unwrap();
        assert_eq!(cfg.node_id, 4);
        assert_eq!(cfg.push_pull_interval_ms, 1000);
        assert_eq!(cfg.join_nodes_num, 3);
        assert_eq!(cfg.join_timeout_s, 10);
        assert_eq!(cfg.assemble_timeout_s, 30);
        assert_eq!(cfg.elect_leader_s, 30);
        assert_eq!(cfg.workers.len(), 7);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_yaml_keys() {
        let cfg: ClusterConfig = serde_yaml::from_str(
            r#"
node_id: 2
bind_addr: 127.0.0.1
bind_port: 7947
push_pull_interval_ms: 250
join_nodes:
  - 127.0.0.1:7946
join_timeout_s: 5
workers: [a, b, c]
"#,
        )
        .unwrap();
        assert_eq!(cfg.bind_port, 7947);
        assert_eq!(cfg.join_nodes, vec!["127.0.0.1:7946".to_string()]);
        assert_eq!(cfg.workers, vec!["a", "b", "c"]);
        assert_eq!(cfg.advertised_endpoint(), "127.0.0.1:7947");
    }

    #[test]
    fn test_validation() {
        assert!(ClusterConfig::new(0).validate().is_err());

        let mut cfg = ClusterConfig::new(1);
        assert!(cfg.validate().is_err()); // not first, no seeds
        cfg.first = true;
        assert!(cfg.validate().is_ok());
        cfg.workers.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_node_name_prefix() {
        let cfg = ClusterConfig::new(42);
        assert!(cfg.node_name().starts_with("000042-"));
    }

    #[test]
    fn test_advertise_overrides_bind() {
        let mut cfg = ClusterConfig::new(1);
        cfg.bind_addr = "0.0.0.0".into();
        cfg.bind_port = 7946;
        cfg.advertise_addr = "10.0.0.9".into();
        assert_eq!(cfg.advertised_endpoint(), "10.0.0.9:7946");
    }
}
