//! Row builders for the load-balancer tables.

use std::net::Ipv4Addr;

use serde::Serialize;
use steer_bfrt::{DataTuple, KeyTuple, TableRow};
use steer_core::{MacAddr, PortSetup, ipv4_to_u32};

use crate::tables::*;

pub fn forward_key(ip: Ipv4Addr) -> Vec<KeyTuple> {
    vec![KeyTuple::exact("hdr.ipv4.dst_addr", ipv4_to_u32(ip))]
}

pub fn arp_key(ip: Ipv4Addr) -> Vec<KeyTuple> {
    vec![KeyTuple::exact("hdr.arp.target_proto_addr", ipv4_to_u32(ip))]
}

pub fn member_key(slot: u32) -> Vec<KeyTuple> {
    vec![KeyTuple::exact("$ACTION_MEMBER_ID", slot)]
}

/// Route `ip` out of `sw_port`, rewriting the destination MAC when known.
pub fn forward_row(ip: Ipv4Addr, sw_port: u32, mac: Option<MacAddr>) -> TableRow {
    let row = TableRow::new(FORWARD, forward_key(ip));
    match mac {
        Some(mac) => row.with_action(
            SET_EGRESS_PORT_WITH_MAC,
            vec![
                DataTuple::int("port", sw_port),
                DataTuple::bytes("dst_mac", mac.octets().to_vec()),
            ],
        ),
        None => row.with_action(SET_EGRESS_PORT, vec![DataTuple::int("port", sw_port)]),
    }
}

pub fn arp_row(ip: Ipv4Addr, sw_port: u32) -> TableRow {
    TableRow::new(ARP_FORWARD, arp_key(ip))
        .with_action(SET_EGRESS_PORT, vec![DataTuple::int("port", sw_port)])
}

/// Action-profile member for selector slot `slot`, rewriting to `dst`.
pub fn member_row(slot: u32, dst: Ipv4Addr) -> TableRow {
    TableRow::new(ACTION_PROFILE, member_key(slot))
        .with_action(SET_REWRITE_DST, vec![DataTuple::int("new_dst", ipv4_to_u32(dst))])
}

pub fn vip_row(vip: Ipv4Addr, group_id: u32) -> TableRow {
    TableRow::new(NODE_SELECTOR, forward_key(vip))
        .with_data(vec![DataTuple::int("$SELECTOR_GROUP_ID", group_id)])
}

/// Return-path rule: traffic from the service port leaves as the VIP.
pub fn snat_row(service_port: u16, vip: Ipv4Addr) -> TableRow {
    TableRow::new(CLIENT_SNAT, vec![KeyTuple::exact("hdr.tcp.src_port", service_port)])
        .with_action(SET_REWRITE_SRC, vec![DataTuple::int("new_src", ipv4_to_u32(vip))])
}

pub fn port_row(setup: &PortSetup) -> TableRow {
    let mut data = vec![
        DataTuple::string("$SPEED", setup.speed.clone()),
        DataTuple::string("$FEC", setup.fec.clone()),
        DataTuple::boolean("$PORT_ENABLE", true),
    ];
    if let Some(an) = &setup.auto_negotiation {
        data.push(DataTuple::string("$AUTO_NEGOTIATION", an.clone()));
    }
    TableRow::new(PORT, vec![KeyTuple::exact("$DEV_PORT", setup.dev_port)]).with_data(data)
}

/// Selector group: member ids and their enable bits, always written
/// together as complete lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorGroup {
    pub group_id: u32,
    pub max_size: u32,
    pub members: Vec<u32>,
    pub status: Vec<bool>,
}

impl SelectorGroup {
    pub fn new(group_id: u32, max_size: u32) -> Self {
        Self {
            group_id,
            max_size,
            members: Vec::new(),
            status: Vec::new(),
        }
    }

    pub fn contains(&self, member: u32) -> bool {
        self.members.contains(&member)
    }

    pub fn is_full(&self) -> bool {
        self.members.len() as u32 >= self.max_size
    }

    /// Copy with `member` appended, enabled.
    pub fn with_member(&self, member: u32) -> Self {
        let mut next = self.clone();
        next.members.push(member);
        next.status.push(true);
        next
    }

    /// Copy with `member` and its status bit removed.
    pub fn without_member(&self, member: u32) -> Self {
        let mut next = self.clone();
        if let Some(pos) = next.members.iter().position(|m| *m == member) {
            next.members.remove(pos);
            next.status.remove(pos);
        }
        next
    }

    pub fn row(&self) -> TableRow {
        TableRow::new(
            ACTION_SELECTOR,
            vec![KeyTuple::exact("$SELECTOR_GROUP_ID", self.group_id)],
        )
        .with_data(vec![
            DataTuple::int("$MAX_GROUP_SIZE", self.max_size),
            DataTuple::int_array("$ACTION_MEMBER_ID", self.members.clone()),
            DataTuple::bool_array("$ACTION_MEMBER_STATUS", self.status.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steer_bfrt::{FieldValue, MatchValue};

    #[test]
    fn forward_row_picks_action_by_mac() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let row = forward_row(ip, 2, None);
        assert_eq!(row.action.as_deref(), Some(SET_EGRESS_PORT));
        assert_eq!(row.key_value("hdr.ipv4.dst_addr"), Some(&MatchValue::Exact(0x0a00_0001)));

        let mac: MacAddr = "00:00:00:00:00:01".parse().unwrap();
        let row = forward_row(ip, 2, Some(mac));
        assert_eq!(row.action.as_deref(), Some(SET_EGRESS_PORT_WITH_MAC));
        assert_eq!(
            row.data_value("dst_mac"),
            Some(&FieldValue::Bytes(vec![0, 0, 0, 0, 0, 1]))
        );
    }

    #[test]
    fn group_lists_stay_parallel() {
        let group = SelectorGroup::new(1, 4).with_member(0).with_member(1).with_member(2);
        let group = group.without_member(1);
        assert_eq!(group.members, vec![0, 2]);
        assert_eq!(group.status, vec![true, true]);
        assert!(!group.is_full());

        let row = group.row();
        assert_eq!(
            row.data_value("$ACTION_MEMBER_ID"),
            Some(&FieldValue::IntArray(vec![0, 2]))
        );
        assert_eq!(
            row.data_value("$ACTION_MEMBER_STATUS"),
            Some(&FieldValue::BoolArray(vec![true, true]))
        );
    }

    #[test]
    fn port_row_defaults() {
        let setup = PortSetup {
            dev_port: 8,
            speed: "BF_SPEED_25G".into(),
            fec: "BF_FEC_TYP_REED_SOLOMON".into(),
            auto_negotiation: None,
        };
        let row = port_row(&setup);
        assert_eq!(row.table, PORT);
        assert_eq!(row.data_value("$PORT_ENABLE"), Some(&FieldValue::Bool(true)));
        assert!(row.data_value("$AUTO_NEGOTIATION").is_none());
    }
}
