//! steer-forwarding — load-balancer forwarding state.
//!
//! Owns the node map (VIP → selector group → per-slot rewrite target) and
//! turns node lifecycle events into ordered writes against the switch
//! tables:
//!
//! ```text
//! node_selector   VIP            → selector group id
//! action_selector group id       → member ids + status bits (full lists)
//! action_selector_ap member id   → set_rewrite_dst(node ip)
//! forward / arp_forward node ip  → egress port (+ MAC)
//! client_snat     service port   → set_rewrite_src(VIP)
//! ```

pub mod error;
pub mod manager;
pub mod memory;
pub mod rows;
pub mod tables;

pub use error::{ForwardingError, ForwardingResult};
pub use manager::{
    ForwardBinding, ForwardingSnapshot, ForwardingStateManager, ManagerConfig, NodeRecord, NodeState, TableCheck,
    VerifyReport,
};
pub use memory::MemorySwitch;
pub use rows::SelectorGroup;
pub use tables::{SwitchTables, TableFuture};
