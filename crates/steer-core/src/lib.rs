//! steer-core — shared types for the steer load-balancer control plane.
//!
//! Holds the static switch configuration document and the backend node
//! model used by the forwarding manager and the admin façade.

pub mod config;
pub mod types;

pub use config::{ConfigError, ConfigResult, NodeConfig, PortSetup, SwitchConfig, SwitchConfigSet};
pub use types::*;
