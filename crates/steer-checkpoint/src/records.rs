//! Container-level records that carry the container's own address.

use std::net::Ipv4Addr;

use serde_json::{Value, json};

pub(crate) const NETWORK_STATUS: &str = "network.status";
pub(crate) const CONFIG_DUMP: &str = "config.dump";

const DEFAULT_PREFIX: &str = "24";

/// Set every `ips[].address` in `network.status` to `new/<prefix>`,
/// keeping each entry's prefix length. Returns whether anything changed.
pub(crate) fn patch_network_status(status: &mut Value, new: Ipv4Addr) -> bool {
    let results: Vec<&mut Value> = match status {
        Value::Array(items) => items.iter_mut().collect(),
        other => vec![other],
    };
    let mut changed = false;
    for result in results {
        let Some(ips) = result.get_mut("ips").and_then(Value::as_array_mut) else {
            continue;
        };
        for ip in ips {
            let Some(addr) = ip.get_mut("address") else {
                continue;
            };
            let prefix = addr
                .as_str()
                .and_then(|a| a.split_once('/'))
                .map(|(_, p)| p.to_string())
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
            let next = json!(format!("{new}/{prefix}"));
            if *addr != next {
                *addr = next;
                changed = true;
            }
        }
    }
    changed
}

/// Replace `staticIP` and the argument following `--ip` in
/// `createCommand`. Returns whether anything changed.
pub(crate) fn patch_config_dump(config: &mut Value, new: Ipv4Addr) -> bool {
    let new = json!(new.to_string());
    let mut changed = false;
    if let Some(ip) = config.get_mut("staticIP") {
        if *ip != new {
            *ip = new.clone();
            changed = true;
        }
    }
    if let Some(cmd) = config.get_mut("createCommand").and_then(Value::as_array_mut) {
        let len = cmd.len();
        let flags: Vec<usize> = cmd
            .iter()
            .enumerate()
            .filter(|(_, arg)| arg.as_str() == Some("--ip"))
            .map(|(i, _)| i + 1)
            .filter(|i| *i < len)
            .collect();
        for i in flags {
            if cmd[i] != new {
                cmd[i] = new.clone();
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEW: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    #[test]
    fn network_status_keeps_prefix() {
        let mut status = json!([{
            "interfaces": [{"name": "eth0"}],
            "ips": [
                {"interface": 0, "address": "10.88.0.7/16", "gateway": "10.88.0.1"},
                {"interface": 0, "address": "10.88.0.8"}
            ]
        }]);
        assert!(patch_network_status(&mut status, NEW));
        assert_eq!(status[0]["ips"][0]["address"], json!("10.0.0.5/16"));
        assert_eq!(status[0]["ips"][0]["gateway"], json!("10.88.0.1"));
        assert_eq!(status[0]["ips"][1]["address"], json!("10.0.0.5/24"));
        assert!(!patch_network_status(&mut status, NEW));
    }

    #[test]
    fn config_dump_static_ip_and_create_command() {
        let mut config = json!({
            "staticIP": "10.0.0.1",
            "createCommand": ["podman", "run", "--ip", "10.0.0.1", "--name", "web", "nginx"],
            "rootfsImageName": "nginx"
        });
        assert!(patch_config_dump(&mut config, NEW));
        assert_eq!(config["staticIP"], json!("10.0.0.5"));
        assert_eq!(
            config["createCommand"],
            json!(["podman", "run", "--ip", "10.0.0.5", "--name", "web", "nginx"])
        );
    }

    #[test]
    fn config_dump_without_address_is_untouched() {
        let mut config = json!({"createCommand": ["podman", "run", "--ip"]});
        assert!(!patch_config_dump(&mut config, NEW));
    }
}
