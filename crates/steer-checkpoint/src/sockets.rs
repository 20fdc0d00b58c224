//! Bind-address rewriting for decoded `files.img` socket records.
//!
//! `crit` prints `isk.src_addr` either as address strings or as the raw
//! in-memory `u32` words of the address (one word for IPv4, four for
//! IPv6). A rewrite keeps whichever form the record used.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde_json::{Value, json};
use tracing::info;

/// Outcome of rewriting one decoded socket image.
#[derive(Debug, Default)]
pub(crate) struct SocketRewrite {
    pub rewritten: usize,
    /// Bound address of every inet socket seen, in image order.
    pub observed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Bound {
    Text(String),
    Words(Vec<u64>),
}

impl Bound {
    fn read(value: &Value) -> Option<Self> {
        let items: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        if let Some(text) = items.first().and_then(|v| v.as_str()) {
            return Some(Bound::Text(text.to_string()));
        }
        let words: Option<Vec<u64>> = items.iter().map(|v| v.as_u64()).collect();
        words.filter(|w| !w.is_empty()).map(Bound::Words)
    }

    fn ip(&self) -> Option<IpAddr> {
        match self {
            Bound::Text(text) => text.parse().ok(),
            Bound::Words(words) => match words.as_slice() {
                [w] => Some(IpAddr::V4(Ipv4Addr::from(word_octets(*w)))),
                [a, b, c, d] => {
                    let mut octets = [0u8; 16];
                    for (chunk, w) in octets.chunks_mut(4).zip([a, b, c, d]) {
                        chunk.copy_from_slice(&word_octets(*w));
                    }
                    Some(IpAddr::V6(Ipv6Addr::from(octets)))
                }
                _ => None,
            },
        }
    }

    fn is_wildcard(&self) -> bool {
        match self {
            Bound::Text(text) if text.is_empty() || text == "0" => true,
            Bound::Words(words) => words.iter().all(|w| *w == 0),
            _ => self.ip().is_some_and(|ip| ip.is_unspecified()),
        }
    }

    fn is_v6(&self) -> bool {
        matches!(self.ip(), Some(IpAddr::V6(_)))
    }

    fn display(&self) -> String {
        match (self.ip(), self) {
            (Some(ip), _) => ip.to_string(),
            (None, Bound::Text(text)) => format!("{text:?}"),
            (None, Bound::Words(words)) => format!("{words:?}"),
        }
    }
}

fn word_octets(word: u64) -> [u8; 4] {
    (word as u32).to_le_bytes()
}

fn octets_word(octets: [u8; 4]) -> u32 {
    u32::from_le_bytes(octets)
}

fn matches_old(ip: IpAddr, old: Ipv4Addr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == old,
        IpAddr::V6(v6) => v6.to_ipv4_mapped() == Some(old),
    }
}

fn family_is_v6(isk: &Value) -> bool {
    match isk.get("family") {
        Some(Value::String(f)) => f.contains("INET6"),
        Some(Value::Number(n)) => n.as_u64() == Some(10),
        _ => false,
    }
}

/// New `src_addr` value for `new`, shaped like `original`.
fn rewritten_value(original: &Value, bound: &Bound, v6: bool, new: Ipv4Addr) -> Value {
    let replacement = match (bound, v6) {
        (Bound::Text(_), false) => json!(new.to_string()),
        (Bound::Text(_), true) => json!(new.to_ipv6_mapped().to_string()),
        (Bound::Words(_), false) => json!(octets_word(new.octets())),
        (Bound::Words(_), true) => {
            let octets = new.to_ipv6_mapped().octets();
            let words: Vec<u32> = octets
                .chunks(4)
                .map(|c| octets_word([c[0], c[1], c[2], c[3]]))
                .collect();
            // A v6 address needs all four words, so a scalar becomes an array.
            return json!(words);
        }
    };
    if original.is_array() { json!([replacement]) } else { replacement }
}

/// Point every inet socket bound to `old` or to a wildcard address at
/// `new`. Sockets bound elsewhere are left alone.
pub(crate) fn rewrite_bind_addresses(image: &mut Value, old: Ipv4Addr, new: Ipv4Addr) -> SocketRewrite {
    let mut outcome = SocketRewrite::default();
    let Some(entries) = image.get_mut("entries").and_then(Value::as_array_mut) else {
        return outcome;
    };

    for entry in entries {
        if entry.get("type").and_then(Value::as_str) != Some("INETSK") {
            continue;
        }
        let id = entry.get("id").cloned().unwrap_or(Value::Null);
        let Some(isk) = entry.get_mut("isk") else {
            continue;
        };
        let v6_family = family_is_v6(isk);
        let Some(addr) = isk.get_mut("src_addr") else {
            continue;
        };
        let Some(bound) = Bound::read(addr) else {
            outcome.observed.push(addr.to_string());
            continue;
        };
        outcome.observed.push(bound.display());

        let hit = bound.ip().is_some_and(|ip| matches_old(ip, old)) || bound.is_wildcard();
        if !hit {
            continue;
        }
        let v6 = v6_family || bound.is_v6();
        *addr = rewritten_value(addr, &bound, v6, new);
        outcome.rewritten += 1;
        info!(socket = %id, from = %bound.display(), to = %addr, "rewrote socket bind address");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const NEW: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn image(sockets: Vec<Value>) -> Value {
        let mut entries = vec![json!({"id": 1, "type": "REG", "reg": {"name": "/etc/hosts"}})];
        for (i, isk) in sockets.into_iter().enumerate() {
            entries.push(json!({"id": i + 2, "type": "INETSK", "isk": isk}));
        }
        json!({"magic": "FILES", "entries": entries})
    }

    fn src_addr(image: &Value, n: usize) -> &Value {
        &image["entries"][n + 1]["isk"]["src_addr"]
    }

    #[test]
    fn wildcard_text_socket_takes_new_address() {
        let mut img = image(vec![json!({"family": "INET", "src_addr": ["0.0.0.0"], "src_port": 8080})]);
        let out = rewrite_bind_addresses(&mut img, OLD, NEW);
        assert_eq!(out.rewritten, 1);
        assert_eq!(src_addr(&img, 0), &json!(["10.0.0.5"]));
        assert_eq!(img["entries"][1]["isk"]["src_port"], json!(8080));
    }

    #[test]
    fn numeric_address_keeps_numeric_form() {
        let old_word = u32::from_le_bytes(OLD.octets());
        let mut img = image(vec![json!({"family": 2, "src_addr": [old_word]})]);
        let out = rewrite_bind_addresses(&mut img, OLD, NEW);
        assert_eq!(out.rewritten, 1);
        assert_eq!(out.observed, vec!["10.0.0.1".to_string()]);
        assert_eq!(src_addr(&img, 0), &json!([u32::from_le_bytes([10, 0, 0, 5])]));
    }

    #[test]
    fn dual_stack_wildcard_gets_mapped_address() {
        let mut img = image(vec![json!({"family": "INET6", "src_addr": ["::"]})]);
        rewrite_bind_addresses(&mut img, OLD, NEW);
        assert_eq!(src_addr(&img, 0), &json!(["::ffff:10.0.0.5"]));
    }

    #[test]
    fn scalar_v6_wildcard_widens_to_four_words() {
        let mut img = image(vec![json!({"family": 10, "src_addr": 0})]);
        let out = rewrite_bind_addresses(&mut img, OLD, NEW);
        assert_eq!(out.rewritten, 1);
        assert_eq!(
            src_addr(&img, 0),
            &json!([
                0,
                0,
                u32::from_le_bytes([0, 0, 0xff, 0xff]),
                u32::from_le_bytes([10, 0, 0, 5])
            ])
        );
    }

    #[test]
    fn unrelated_bind_is_reported_not_touched() {
        let mut img = image(vec![
            json!({"family": "INET", "src_addr": ["192.168.1.7"]}),
            json!({"family": "INET", "src_addr": ["127.0.0.1"]}),
        ]);
        let before = img.clone();
        let out = rewrite_bind_addresses(&mut img, OLD, NEW);
        assert_eq!(out.rewritten, 0);
        assert_eq!(out.observed, vec!["192.168.1.7".to_string(), "127.0.0.1".to_string()]);
        assert_eq!(img, before);
    }

    #[test]
    fn only_matching_sockets_change() {
        let mut img = image(vec![
            json!({"family": "INET", "src_addr": ["10.0.0.1"]}),
            json!({"family": "INET", "src_addr": ["127.0.0.1"]}),
        ]);
        let out = rewrite_bind_addresses(&mut img, OLD, NEW);
        assert_eq!(out.rewritten, 1);
        assert_eq!(src_addr(&img, 0), &json!(["10.0.0.5"]));
        assert_eq!(src_addr(&img, 1), &json!(["127.0.0.1"]));
    }
}
