//! The switch tables the forwarding manager drives, and the seam it
//! drives them through.

use std::future::Future;
use std::pin::Pin;

use steer_bfrt::{TableClient, TableResult, TableRow, UpdateKind};

pub const FORWARD: &str = "SwitchIngress.forward";
pub const ARP_FORWARD: &str = "SwitchIngress.arp_forward";
pub const ACTION_PROFILE: &str = "SwitchIngress.action_selector_ap";
pub const ACTION_SELECTOR: &str = "SwitchIngress.action_selector";
pub const NODE_SELECTOR: &str = "SwitchIngress.node_selector";
pub const CLIENT_SNAT: &str = "SwitchIngress.client_snat";
pub const PORT: &str = "$PORT";

pub const SET_EGRESS_PORT: &str = "SwitchIngress.set_egress_port";
pub const SET_EGRESS_PORT_WITH_MAC: &str = "SwitchIngress.set_egress_port_with_mac";
pub const SET_REWRITE_DST: &str = "SwitchIngress.set_rewrite_dst";
pub const SET_REWRITE_SRC: &str = "SwitchIngress.set_rewrite_src";

/// Tables cleared by cleanup, in an order that never leaves a reference
/// dangling: the VIP binding before the group, the group before its
/// members. Port rows are left alone.
pub const MANAGED_TABLES: [&str; 6] = [
    NODE_SELECTOR,
    ACTION_SELECTOR,
    ACTION_PROFILE,
    CLIENT_SNAT,
    FORWARD,
    ARP_FORWARD,
];

/// Boxed future returned by [`SwitchTables`] methods.
pub type TableFuture<'a, T> = Pin<Box<dyn Future<Output = TableResult<T>> + Send + 'a>>;

/// Table access used by the forwarding manager. Implemented by the switch
/// client and by [`MemorySwitch`](crate::MemorySwitch).
pub trait SwitchTables: Send + Sync {
    /// Apply one insert, modify or delete.
    fn apply<'a>(&'a self, kind: UpdateKind, row: &'a TableRow) -> TableFuture<'a, ()>;

    /// Delete every row of `table`.
    fn clear<'a>(&'a self, table: &'a str) -> TableFuture<'a, ()>;

    /// Read every row of `table`.
    fn read<'a>(&'a self, table: &'a str) -> TableFuture<'a, Vec<TableRow>>;
}

impl SwitchTables for TableClient {
    fn apply<'a>(&'a self, kind: UpdateKind, row: &'a TableRow) -> TableFuture<'a, ()> {
        Box::pin(TableClient::apply(self, kind, row))
    }

    fn clear<'a>(&'a self, table: &'a str) -> TableFuture<'a, ()> {
        Box::pin(self.delete(table, None))
    }

    fn read<'a>(&'a self, table: &'a str) -> TableFuture<'a, Vec<TableRow>> {
        Box::pin(async move { TableClient::read(self, table)?.collect().await })
    }
}
