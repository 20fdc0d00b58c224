//! Forwarding state manager: the authoritative node map and the ordered
//! table transactions that keep the switch in step with it.
//!
//! Writes inside one operation are strictly sequential. The switch
//! rejects a selector group that references members it has not seen yet,
//! so members always go in before the group and come out after it.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::Serialize;
use steer_bfrt::{FieldValue, TableError, TableRow, UpdateKind};
use steer_core::{BackendNode, ConfigError, MacAddr, NodeConfig, PortSetup, SwitchConfig};
use tracing::{debug, error, info, warn};

use crate::error::{ForwardingError, ForwardingResult};
use crate::rows::{
    SelectorGroup, arp_key, arp_row, forward_key, forward_row, member_key, member_row, port_row, snat_row,
    vip_row,
};
use crate::tables::*;

/// Static inputs the manager is built from.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub vip: Ipv4Addr,
    pub service_port: u16,
    pub group_id: u32,
    pub max_group_size: u32,
    pub nodes: Vec<BackendNode>,
    pub port_setup: Vec<PortSetup>,
}

impl TryFrom<&SwitchConfig> for ManagerConfig {
    type Error = ConfigError;

    fn try_from(config: &SwitchConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        let service_port = config.service_port.ok_or_else(|| ConfigError::Invalid {
            switch: config.name.clone(),
            reason: "service_port is required".to_string(),
        })?;
        Ok(Self {
            vip: config.load_balancer_ip,
            service_port,
            group_id: config.group_id,
            max_group_size: config.max_group_size,
            nodes: config.backend_nodes(),
            port_setup: config.port_setup.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeState {
    Active,
    /// Migrated away; kept so traffic to the old address still drains.
    Superseded { by: Ipv4Addr },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    #[serde(flatten)]
    pub node: BackendNode,
    #[serde(flatten)]
    pub state: NodeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForwardBinding {
    pub sw_port: u32,
    pub mac: Option<MacAddr>,
}

/// Point-in-time copy of the in-memory model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardingSnapshot {
    pub initialized: bool,
    pub vip: Ipv4Addr,
    pub service_port: u16,
    pub nodes: Vec<NodeRecord>,
    pub group: Option<SelectorGroup>,
    /// Selector slot → rewrite destination.
    pub actions: BTreeMap<u32, Ipv4Addr>,
    pub forwards: BTreeMap<Ipv4Addr, ForwardBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCheck {
    pub table: &'static str,
    pub expected: usize,
    pub actual: usize,
}

/// Row counts read back from the switch against the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub checks: Vec<TableCheck>,
    pub group_matches: bool,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.group_matches && self.checks.iter().all(|c| c.expected == c.actual)
    }
}

pub struct ForwardingStateManager<T> {
    tables: T,
    config: ManagerConfig,
    nodes: BTreeMap<Ipv4Addr, NodeRecord>,
    group: Option<SelectorGroup>,
    actions: BTreeMap<u32, Ipv4Addr>,
    forwards: BTreeMap<Ipv4Addr, ForwardBinding>,
    arp: BTreeSet<Ipv4Addr>,
    vip_bound: bool,
    snat_installed: bool,
    initialized: bool,
}

impl<T: SwitchTables> ForwardingStateManager<T> {
    pub fn new(tables: T, config: ManagerConfig) -> Self {
        Self {
            tables,
            config,
            nodes: BTreeMap::new(),
            group: None,
            actions: BTreeMap::new(),
            forwards: BTreeMap::new(),
            arp: BTreeSet::new(),
            vip_bound: false,
            snat_installed: false,
            initialized: false,
        }
    }

    pub fn tables(&self) -> &T {
        &self.tables
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn node(&self, ip: Ipv4Addr) -> Option<&NodeRecord> {
        self.nodes.get(&ip)
    }

    fn require_initialized(&self) -> ForwardingResult<()> {
        if !self.initialized {
            return Err(ForwardingError::NotInitialized);
        }
        Ok(())
    }

    async fn write(&self, kind: UpdateKind, row: &TableRow) -> ForwardingResult<()> {
        self.tables.apply(kind, row).await.map_err(|e| {
            error!(table = %row.table, key = %row.key_display(), %kind, error = %e, "table write failed");
            ForwardingError::from(e)
        })
    }

    /// Insert the Forward and ARP rows for `ip`, or modify them if they
    /// are already installed.
    async fn upsert_forward(&mut self, ip: Ipv4Addr, sw_port: u32, mac: Option<MacAddr>) -> ForwardingResult<()> {
        let kind = if self.forwards.contains_key(&ip) {
            UpdateKind::Modify
        } else {
            UpdateKind::Insert
        };
        self.write(kind, &forward_row(ip, sw_port, mac)).await?;
        self.forwards.insert(ip, ForwardBinding { sw_port, mac });

        let kind = if self.arp.contains(&ip) {
            UpdateKind::Modify
        } else {
            UpdateKind::Insert
        };
        self.write(kind, &arp_row(ip, sw_port)).await?;
        self.arp.insert(ip);
        Ok(())
    }

    /// Write the configured `$PORT` rows. Ports outlive cleanup, so a row
    /// that is already present is modified in place.
    pub async fn setup_ports(&self) -> ForwardingResult<()> {
        for setup in &self.config.port_setup {
            let row = port_row(setup);
            match self.tables.apply(UpdateKind::Insert, &row).await {
                Ok(()) => {
                    info!(dev_port = setup.dev_port, speed = %setup.speed, fec = %setup.fec, "port added");
                }
                Err(TableError::DuplicateKey { .. }) => {
                    self.write(UpdateKind::Modify, &row).await?;
                    debug!(dev_port = setup.dev_port, "port already present, updated");
                }
                Err(e) => {
                    error!(dev_port = setup.dev_port, error = %e, "port setup failed");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Install the configured nodes.
    ///
    /// Per node: its action member (group members only), then its Forward
    /// and ARP rows. Once every member exists the selector group is
    /// written with the full id and status lists, then the VIP is bound
    /// to it and the SNAT rule for the service port is installed.
    pub async fn initialize(&mut self) -> ForwardingResult<()> {
        if self.initialized {
            return Err(ForwardingError::AlreadyInitialized);
        }
        let vip = self.config.vip;
        let nodes = self.config.nodes.clone();
        info!(%vip, nodes = nodes.len(), "initializing forwarding state");

        self.setup_ports().await?;

        let mut group = SelectorGroup::new(self.config.group_id, self.config.max_group_size);
        for node in &nodes {
            if let Some(slot) = node.slot.filter(|_| node.is_group_member()) {
                self.write(UpdateKind::Insert, &member_row(slot, node.ipv4)).await?;
                self.actions.insert(slot, node.ipv4);
                group = group.with_member(slot);
            }
            self.upsert_forward(node.ipv4, node.sw_port, node.mac).await?;
            self.nodes.insert(
                node.ipv4,
                NodeRecord {
                    node: node.clone(),
                    state: NodeState::Active,
                },
            );
            debug!(node = %node, "node installed");
        }

        self.write(UpdateKind::Insert, &group.row()).await?;
        let members = group.members.len();
        self.group = Some(group);

        self.write(UpdateKind::Insert, &vip_row(vip, self.config.group_id)).await?;
        self.vip_bound = true;

        self.write(UpdateKind::Insert, &snat_row(self.config.service_port, vip)).await?;
        self.snat_installed = true;

        self.initialized = true;
        self.check_invariants()?;
        info!(%vip, group_id = self.config.group_id, members, "forwarding state initialized");
        Ok(())
    }

    /// Move a group member from `old` to `new`.
    ///
    /// The member's action row is repointed in place, so the selector
    /// group is never touched. The Forward/ARP rows and the node record
    /// for `old` stay behind so in-flight traffic can drain.
    pub async fn migrate(&mut self, old: Ipv4Addr, new: Ipv4Addr) -> ForwardingResult<()> {
        self.require_initialized()?;
        let record = self.nodes.get(&old).cloned().ok_or(ForwardingError::UnknownNode(old))?;
        if let NodeState::Superseded { by } = record.state {
            return Err(ForwardingError::SupersededNode { ip: old, by });
        }
        let Some(slot) = record.node.slot.filter(|_| record.node.is_group_member()) else {
            return Err(ForwardingError::NotGroupMember(old));
        };
        if old != new
            && self
                .nodes
                .get(&new)
                .is_some_and(|r| r.state == NodeState::Active)
        {
            return Err(ForwardingError::DuplicateNode(new));
        }

        info!(%old, %new, slot, "migrating node");

        self.write(UpdateKind::Modify, &member_row(slot, new)).await?;
        // The member row now points at `new`: hand the slot over.
        self.actions.insert(slot, new);
        if old != new {
            if let Some(prev) = self.nodes.get_mut(&old) {
                prev.state = NodeState::Superseded { by: new };
                prev.node.slot = None;
            }
            self.nodes.insert(
                new,
                NodeRecord {
                    node: BackendNode {
                        ipv4: new,
                        ..record.node.clone()
                    },
                    state: NodeState::Active,
                },
            );
        }

        if let Err(e) = self.upsert_forward(new, record.node.sw_port, record.node.mac).await {
            warn!(%old, %new, slot, error = %e, "slot handed over but forward rows incomplete");
            return Err(e);
        }

        self.check_invariants()?;
        info!(%old, %new, slot, "node migrated");
        Ok(())
    }

    /// Re-point the Forward and ARP rows of `ip` at a new egress port,
    /// optionally with a new MAC. Group membership is not involved.
    pub async fn update_forward(
        &mut self,
        ip: Ipv4Addr,
        sw_port: u32,
        mac: Option<MacAddr>,
    ) -> ForwardingResult<()> {
        self.require_initialized()?;
        let record = self.nodes.get(&ip).ok_or(ForwardingError::UnknownNode(ip))?;
        let mac = mac.or(record.node.mac);

        self.upsert_forward(ip, sw_port, mac).await?;
        if let Some(record) = self.nodes.get_mut(&ip) {
            record.node.sw_port = sw_port;
            record.node.mac = mac;
        }

        self.check_invariants()?;
        info!(%ip, sw_port, "forward binding updated");
        Ok(())
    }

    /// Add a node at runtime. Group members take the lowest free slot and
    /// the whole group is rewritten after their action row exists.
    pub async fn add_node(&mut self, config: &NodeConfig) -> ForwardingResult<BackendNode> {
        self.require_initialized()?;
        if self.nodes.contains_key(&config.ipv4) {
            return Err(ForwardingError::DuplicateNode(config.ipv4));
        }
        let group = self
            .group
            .clone()
            .ok_or_else(|| ForwardingError::Invariant("selector group is missing".to_string()))?;

        let slot = if config.is_lb_node {
            if group.is_full() {
                return Err(ForwardingError::GroupFull {
                    group_id: group.group_id,
                    max_size: group.max_size,
                });
            }
            let free = (0..=self.actions.len() as u32)
                .find(|s| !self.actions.contains_key(s))
                .ok_or_else(|| ForwardingError::Invariant("no free selector slot".to_string()))?;
            Some(free)
        } else {
            None
        };
        let node = BackendNode::from_config(config, slot);
        info!(node = %node, "adding node");

        self.upsert_forward(node.ipv4, node.sw_port, node.mac).await?;
        // Recorded without its slot until the member row exists.
        self.nodes.insert(
            node.ipv4,
            NodeRecord {
                node: BackendNode {
                    slot: None,
                    ..node.clone()
                },
                state: NodeState::Active,
            },
        );
        if let Some(slot) = slot {
            self.write(UpdateKind::Insert, &member_row(slot, node.ipv4)).await?;
            self.actions.insert(slot, node.ipv4);
            if let Some(record) = self.nodes.get_mut(&node.ipv4) {
                record.node.slot = Some(slot);
            }
            let next = group.with_member(slot);
            self.write(UpdateKind::Modify, &next.row()).await?;
            self.group = Some(next);
        }

        self.check_invariants()?;
        Ok(node)
    }

    /// Remove a node: group first, then its action member, then its
    /// Forward and ARP rows.
    pub async fn remove_node(&mut self, ip: Ipv4Addr) -> ForwardingResult<()> {
        self.require_initialized()?;
        let record = self.nodes.get(&ip).cloned().ok_or(ForwardingError::UnknownNode(ip))?;
        info!(node = %record.node, "removing node");

        if record.state == NodeState::Active {
            if let Some(slot) = record.node.slot.filter(|_| record.node.is_group_member()) {
                if let Some(group) = self.group.clone().filter(|g| g.contains(slot)) {
                    let next = group.without_member(slot);
                    self.write(UpdateKind::Modify, &next.row()).await?;
                    self.group = Some(next);
                }
                self.write(UpdateKind::Delete, &TableRow::new(ACTION_PROFILE, member_key(slot)))
                    .await?;
                self.actions.remove(&slot);
            }
        }

        if self.forwards.contains_key(&ip) {
            self.write(UpdateKind::Delete, &TableRow::new(FORWARD, forward_key(ip)))
                .await?;
            self.forwards.remove(&ip);
        }
        if self.arp.contains(&ip) {
            self.write(UpdateKind::Delete, &TableRow::new(ARP_FORWARD, arp_key(ip)))
                .await?;
            self.arp.remove(&ip);
        }
        self.nodes.remove(&ip);

        self.check_invariants()
    }

    /// Clear every managed table. Safe to call repeatedly.
    pub async fn cleanup(&mut self) -> ForwardingResult<()> {
        info!("clearing managed tables");
        for table in MANAGED_TABLES {
            self.tables.clear(table).await.map_err(|e| {
                error!(table, error = %e, "failed to clear table");
                ForwardingError::from(e)
            })?;
            debug!(table, "table cleared");
        }
        self.reset();
        info!("cleanup complete");
        Ok(())
    }

    /// Clear every managed table and install the configured nodes again.
    pub async fn reinitialize(&mut self) -> ForwardingResult<()> {
        info!("reinitializing forwarding state");
        self.cleanup().await?;
        self.initialize().await
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.group = None;
        self.actions.clear();
        self.forwards.clear();
        self.arp.clear();
        self.vip_bound = false;
        self.snat_installed = false;
        self.initialized = false;
    }

    pub fn snapshot(&self) -> ForwardingSnapshot {
        ForwardingSnapshot {
            initialized: self.initialized,
            vip: self.config.vip,
            service_port: self.config.service_port,
            nodes: self.nodes.values().cloned().collect(),
            group: self.group.clone(),
            actions: self.actions.clone(),
            forwards: self.forwards.clone(),
        }
    }

    /// Read every managed table back and compare it with the model.
    pub async fn verify(&self) -> ForwardingResult<VerifyReport> {
        let expected = [
            (FORWARD, self.forwards.len()),
            (ARP_FORWARD, self.arp.len()),
            (ACTION_PROFILE, self.actions.len()),
            (ACTION_SELECTOR, usize::from(self.group.is_some())),
            (NODE_SELECTOR, usize::from(self.vip_bound)),
            (CLIENT_SNAT, usize::from(self.snat_installed)),
        ];

        let mut checks = Vec::with_capacity(expected.len());
        let mut group_matches = true;
        for (table, expected) in expected {
            let rows = self.tables.read(table).await?;
            if table == ACTION_SELECTOR {
                if let Some(group) = &self.group {
                    group_matches = rows.iter().any(|row| {
                        row.data_value("$ACTION_MEMBER_ID") == Some(&FieldValue::IntArray(group.members.clone()))
                            && row.data_value("$ACTION_MEMBER_STATUS")
                                == Some(&FieldValue::BoolArray(group.status.clone()))
                    });
                }
            }
            checks.push(TableCheck {
                table,
                expected,
                actual: rows.len(),
            });
        }

        let report = VerifyReport { checks, group_matches };
        if !report.is_consistent() {
            warn!(?report, "switch state differs from the forwarding model");
        }
        Ok(report)
    }

    /// Check the model's structural invariants.
    pub fn check_invariants(&self) -> ForwardingResult<()> {
        match self.find_violation() {
            Some(violation) => {
                error!(%violation, "forwarding invariant violated");
                Err(ForwardingError::Invariant(violation))
            }
            None => Ok(()),
        }
    }

    fn find_violation(&self) -> Option<String> {
        if let Some(group) = &self.group {
            if group.members.len() != group.status.len() {
                return Some(format!(
                    "group {} has {} member ids but {} status bits",
                    group.group_id,
                    group.members.len(),
                    group.status.len()
                ));
            }
            if group.members.len() as u32 > group.max_size {
                return Some(format!("group {} exceeds its size {}", group.group_id, group.max_size));
            }
            if let Some(id) = group.members.iter().find(|id| !self.actions.contains_key(*id)) {
                return Some(format!("group {} references member {id} with no action row", group.group_id));
            }
        }
        if self.vip_bound
            && self
                .group
                .as_ref()
                .is_none_or(|g| g.group_id != self.config.group_id)
        {
            return Some(format!(
                "VIP {} is bound to missing group {}",
                self.config.vip, self.config.group_id
            ));
        }
        for record in self.nodes.values() {
            if record.state != NodeState::Active {
                continue;
            }
            if let Some(slot) = record.node.slot.filter(|_| record.node.is_group_member()) {
                if self.actions.get(&slot) != Some(&record.node.ipv4) {
                    return Some(format!("slot {slot} does not rewrite to {}", record.node.ipv4));
                }
            }
        }
        None
    }
}
