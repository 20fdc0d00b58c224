//! Error types for forwarding state transactions.

use std::net::Ipv4Addr;

use steer_bfrt::TableError;
use thiserror::Error;

/// Result type alias for forwarding operations.
pub type ForwardingResult<T> = Result<T, ForwardingError>;

#[derive(Debug, Error)]
pub enum ForwardingError {
    #[error("Node with IP {0} does not exist")]
    UnknownNode(Ipv4Addr),

    #[error("Node with IP {0} is not LB node")]
    NotGroupMember(Ipv4Addr),

    #[error("Node with IP {ip} was migrated to {by}")]
    SupersededNode { ip: Ipv4Addr, by: Ipv4Addr },

    #[error("Node with IP {0} already exists")]
    DuplicateNode(Ipv4Addr),

    #[error("selector group {group_id} is full ({max_size} members)")]
    GroupFull { group_id: u32, max_size: u32 },

    #[error("forwarding state is not initialized")]
    NotInitialized,

    #[error("forwarding state is already initialized")]
    AlreadyInitialized,

    #[error("forwarding invariant violated: {0}")]
    Invariant(String),

    #[error("table operation failed: {0}")]
    Table(#[from] TableError),
}

impl ForwardingError {
    /// Whether the request itself was wrong, as opposed to the switch or
    /// the controller failing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ForwardingError::UnknownNode(_)
                | ForwardingError::NotGroupMember(_)
                | ForwardingError::SupersededNode { .. }
                | ForwardingError::DuplicateNode(_)
                | ForwardingError::GroupFull { .. }
        )
    }
}
