//! Static switch configuration parser.
//!
//! The configuration file is a JSON array with one document per switch.
//! Exactly one document carries `"master": true`; the control plane drives
//! that switch and builds its backend node map from the `nodes` list.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BackendNode, MacAddr};

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse switch config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no master switch specified in the configuration")]
    NoMaster,

    #[error("multiple master switches specified in the configuration")]
    MultipleMasters,

    #[error("invalid config for switch {switch}: {reason}")]
    Invalid { switch: String, reason: String },
}

const VALID_SPEEDS: &[&str] = &[
    "BF_SPEED_1G",
    "BF_SPEED_10G",
    "BF_SPEED_25G",
    "BF_SPEED_40G",
    "BF_SPEED_50G",
    "BF_SPEED_100G",
];

const VALID_FECS: &[&str] = &[
    "BF_FEC_TYP_NONE",
    "BF_FEC_TYP_FIRECODE",
    "BF_FEC_TYP_REED_SOLOMON",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default)]
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub client_id: u32,
    pub load_balancer_ip: Ipv4Addr,
    pub service_port: Option<u16>,
    #[serde(default)]
    pub master: bool,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub port_setup: Vec<PortSetup>,
    #[serde(default = "default_max_group_size")]
    pub max_group_size: u32,
    #[serde(default = "default_group_id")]
    pub group_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub ipv4: Ipv4Addr,
    pub sw_port: u32,
    #[serde(default)]
    pub mac: Option<MacAddr>,
    #[serde(default)]
    pub is_lb_node: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSetup {
    pub dev_port: u32,
    #[serde(default = "default_speed")]
    pub speed: String,
    #[serde(default = "default_fec")]
    pub fec: String,
    #[serde(default)]
    pub auto_negotiation: Option<String>,
}

fn default_max_group_size() -> u32 {
    4
}

fn default_group_id() -> u32 {
    1
}

fn default_speed() -> String {
    "BF_SPEED_25G".to_string()
}

fn default_fec() -> String {
    "BF_FEC_TYP_REED_SOLOMON".to_string()
}

/// The master switch plus every other switch listed in the same file.
#[derive(Debug, Clone)]
pub struct SwitchConfigSet {
    pub master: SwitchConfig,
    pub peers: Vec<SwitchConfig>,
}

impl SwitchConfigSet {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        let configs: Vec<SwitchConfig> = serde_json::from_str(content)?;
        Self::from_configs(configs)
    }

    /// Split the documents into master and peers, validating the master.
    pub fn from_configs(configs: Vec<SwitchConfig>) -> ConfigResult<Self> {
        let mut master = None;
        let mut peers = Vec::new();
        for config in configs {
            if config.master {
                if master.is_some() {
                    return Err(ConfigError::MultipleMasters);
                }
                master = Some(config);
            } else {
                peers.push(config);
            }
        }
        let master = master.ok_or(ConfigError::NoMaster)?;
        master.validate()?;
        Ok(Self { master, peers })
    }
}

impl SwitchConfig {
    /// Check the constraints the forwarding manager relies on.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.service_port.is_none() {
            return Err(self.invalid("service_port is required on the master switch"));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.ipv4) {
                return Err(self.invalid(format!("duplicate node ipv4 {}", node.ipv4)));
            }
        }

        let members = self.nodes.iter().filter(|n| n.is_lb_node).count();
        if members as u32 > self.max_group_size {
            return Err(self.invalid(format!(
                "{members} lb nodes exceed max_group_size {}",
                self.max_group_size
            )));
        }

        let mut dev_ports = HashSet::new();
        for (i, port) in self.port_setup.iter().enumerate() {
            if port.dev_port == 0 {
                return Err(self.invalid(format!("port_setup[{i}].dev_port must be positive")));
            }
            if !dev_ports.insert(port.dev_port) {
                return Err(self.invalid(format!("duplicate dev_port {} in port_setup", port.dev_port)));
            }
            if !VALID_SPEEDS.contains(&port.speed.as_str()) {
                return Err(self.invalid(format!("port_setup[{i}].speed '{}' invalid", port.speed)));
            }
            if !VALID_FECS.contains(&port.fec.as_str()) {
                return Err(self.invalid(format!("port_setup[{i}].fec '{}' invalid", port.fec)));
            }
        }

        Ok(())
    }

    /// Backend nodes in config order, with selector slots assigned to
    /// lb nodes starting at 0.
    pub fn backend_nodes(&self) -> Vec<BackendNode> {
        let mut next_slot = 0u32;
        self.nodes
            .iter()
            .map(|node| {
                let slot = if node.is_lb_node {
                    let slot = next_slot;
                    next_slot += 1;
                    Some(slot)
                } else {
                    None
                };
                BackendNode::from_config(node, slot)
            })
            .collect()
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            switch: if self.name.is_empty() { self.addr.clone() } else { self.name.clone() },
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {
            "name": "t2na_load_balancer",
            "addr": "127.0.0.1:50052",
            "id": 0,
            "client_id": 0,
            "load_balancer_ip": "10.0.0.10",
            "service_port": 12345,
            "master": true,
            "nodes": [
                {"ipv4": "10.0.0.0", "sw_port": 1, "is_lb_node": false},
                {"ipv4": "10.0.0.1", "sw_port": 2, "mac": "00:00:00:00:00:01", "is_lb_node": true},
                {"ipv4": "10.0.0.2", "sw_port": 3, "is_lb_node": true}
            ],
            "port_setup": [{"dev_port": 8}]
        },
        {
            "name": "peer",
            "addr": "127.0.0.1:50053",
            "load_balancer_ip": "10.0.0.10"
        }
    ]"#;

    #[test]
    fn test_parse_master_and_peers() {
        let set = SwitchConfigSet::from_json_str(SAMPLE).unwrap();
        assert_eq!(set.master.name, "t2na_load_balancer");
        assert_eq!(set.master.service_port, Some(12345));
        assert_eq!(set.master.max_group_size, 4);
        assert_eq!(set.master.group_id, 1);
        assert_eq!(set.peers.len(), 1);
        assert_eq!(set.master.port_setup[0].speed, "BF_SPEED_25G");
        assert_eq!(set.master.port_setup[0].fec, "BF_FEC_TYP_REED_SOLOMON");
    }

    #[test]
    fn test_slots_follow_config_order() {
        let set = SwitchConfigSet::from_json_str(SAMPLE).unwrap();
        let nodes = set.master.backend_nodes();
        assert_eq!(nodes[0].slot, None);
        assert_eq!(nodes[1].slot, Some(0));
        assert_eq!(nodes[2].slot, Some(1));
        assert!(nodes[1].mac.is_some());
    }

    #[test]
    fn test_no_master() {
        let err = SwitchConfigSet::from_json_str(
            r#"[{"addr": "a", "load_balancer_ip": "10.0.0.10"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoMaster));
    }

    #[test]
    fn test_multiple_masters() {
        let doc = r#"[
            {"addr": "a", "load_balancer_ip": "10.0.0.10", "service_port": 1, "master": true},
            {"addr": "b", "load_balancer_ip": "10.0.0.10", "service_port": 1, "master": true}
        ]"#;
        let err = SwitchConfigSet::from_json_str(doc).unwrap_err();
        assert!(matches!(err, ConfigError::MultipleMasters));
    }

    #[test]
    fn test_master_requires_service_port() {
        let doc = r#"[{"addr": "a", "load_balancer_ip": "10.0.0.10", "master": true}]"#;
        let err = SwitchConfigSet::from_json_str(doc).unwrap_err();
        assert!(err.to_string().contains("service_port"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let doc = r#"[{
            "addr": "a", "load_balancer_ip": "10.0.0.10", "service_port": 1, "master": true,
            "nodes": [
                {"ipv4": "10.0.0.1", "sw_port": 1},
                {"ipv4": "10.0.0.1", "sw_port": 2}
            ]
        }]"#;
        let err = SwitchConfigSet::from_json_str(doc).unwrap_err();
        assert!(err.to_string().contains("duplicate node"));
    }

    #[test]
    fn test_group_capacity_enforced() {
        let doc = r#"[{
            "addr": "a", "load_balancer_ip": "10.0.0.10", "service_port": 1, "master": true,
            "max_group_size": 1,
            "nodes": [
                {"ipv4": "10.0.0.1", "sw_port": 1, "is_lb_node": true},
                {"ipv4": "10.0.0.2", "sw_port": 2, "is_lb_node": true}
            ]
        }]"#;
        assert!(SwitchConfigSet::from_json_str(doc).is_err());
    }

    #[test]
    fn test_bad_port_setup() {
        let doc = r#"[{
            "addr": "a", "load_balancer_ip": "10.0.0.10", "service_port": 1, "master": true,
            "port_setup": [{"dev_port": 8, "speed": "BF_SPEED_7G"}]
        }]"#;
        let err = SwitchConfigSet::from_json_str(doc).unwrap_err();
        assert!(err.to_string().contains("speed"));

        let doc = r#"[{
            "addr": "a", "load_balancer_ip": "10.0.0.10", "service_port": 1, "master": true,
            "port_setup": [{"dev_port": 8}, {"dev_port": 8}]
        }]"#;
        assert!(SwitchConfigSet::from_json_str(doc).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller_config.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let set = SwitchConfigSet::from_file(&path).unwrap();
        assert_eq!(set.master.nodes.len(), 3);

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            SwitchConfigSet::from_file(&missing).unwrap_err(),
            ConfigError::Io { .. }
        ));
    }
}
