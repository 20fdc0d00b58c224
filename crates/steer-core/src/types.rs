//! Shared types used across steer crates.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::NodeConfig;

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid MAC address: {0}")]
pub struct MacParseError(pub String);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(MacParseError(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(MacParseError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// A backend node behind the load balancer.
///
/// Identity is the IPv4 address. `slot` is the stable selector-slot index
/// (also used as the action member id) and is only set for group members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendNode {
    pub ipv4: Ipv4Addr,
    pub sw_port: u32,
    pub mac: Option<MacAddr>,
    pub is_lb_node: bool,
    pub slot: Option<u32>,
}

impl BackendNode {
    /// Build a node from its config entry. `slot` must be `Some` for
    /// group members.
    pub fn from_config(config: &NodeConfig, slot: Option<u32>) -> Self {
        Self {
            ipv4: config.ipv4,
            sw_port: config.sw_port,
            mac: config.mac,
            is_lb_node: config.is_lb_node,
            slot,
        }
    }

    /// Whether this node takes part in the selector group.
    pub fn is_group_member(&self) -> bool {
        self.is_lb_node && self.slot.is_some()
    }
}

impl fmt::Display for BackendNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node(ipv4={}, sw_port={}", self.ipv4, self.sw_port)?;
        if let Some(slot) = self.slot {
            write!(f, ", slot={slot}")?;
        }
        if let Some(mac) = self.mac {
            write!(f, ", mac={mac}")?;
        }
        write!(f, ", is_lb_node={})", self.is_lb_node)
    }
}

/// Big-endian integer value of an IPv4 address, as the dataplane sees it.
pub fn ipv4_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}
