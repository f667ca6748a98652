//! `CLUSTER NODES` topology discovery.
//!
//! Each line reads:
//!
//! ```text
//! <id> <ip:port@cport[,hostname]> <flags> <master> <ping> <pong> <epoch> <link> <slot> <slot> ...
//! ```
//!
//! Only masters holding at least one slot are returned. Importing/migrating
//! markers (`[93->-id]`) are ignored.

use super::client::{ConnectionError, Credentials, RedisClient};
use super::tls::TlsOptions;
use crate::protocol::RespValue;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    /// `host:port`, with IPv6 hosts in brackets.
    pub address: String,
    /// Inclusive slot ranges served by this node.
    pub slots: Vec<(u16, u16)>,
}

pub fn parse_cluster_nodes(text: &str) -> Result<Vec<ClusterNode>, ConnectionError> {
    let mut nodes = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let words: Vec<&str> = line.split(' ').collect();
        if words.len() < 8 {
            return Err(ConnectionError::InvalidClusterNodes(line.to_string()));
        }
        if !words[2].split(',').any(|f| f == "master") {
            continue;
        }

        let address = format_address(words[1])
            .ok_or_else(|| ConnectionError::InvalidClusterNodes(line.to_string()))?;

        let mut slots = Vec::new();
        for word in &words[8..] {
            if word.starts_with('[') {
                continue;
            }
            slots.push(
                parse_slot_range(word)
                    .ok_or_else(|| ConnectionError::InvalidClusterNodes(line.to_string()))?,
            );
        }
        if slots.is_empty() {
            warn!(address = %address, "master node holds no slots, skipping");
            continue;
        }

        nodes.push(ClusterNode {
            id: words[0].to_string(),
            address,
            slots,
        });
    }
    Ok(nodes)
}

/// Strips the bus port and hostname, bracketing IPv6 hosts.
fn format_address(field: &str) -> Option<String> {
    let addr = field.split(['@', ',']).next()?;
    let (host, port) = addr.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    if host.contains(':') && !host.starts_with('[') {
        Some(format!("[{}]:{}", host, port))
    } else {
        Some(addr.to_string())
    }
}

fn parse_slot_range(word: &str) -> Option<(u16, u16)> {
    let (start, end) = match word.split_once('-') {
        Some((a, b)) => (a.parse().ok()?, b.parse().ok()?),
        None => {
            let slot = word.parse().ok()?;
            (slot, slot)
        }
    };
    (start <= end && (end as usize) < crate::commands::SLOT_COUNT).then_some((start, end))
}

/// Connects to any node and returns the masters of its cluster.
pub async fn discover_masters(
    addr: &str,
    credentials: &Credentials,
    tls: &TlsOptions,
) -> Result<Vec<ClusterNode>, ConnectionError> {
    let mut client = RedisClient::connect(addr, credentials, tls).await?;
    let reply = client.request(&["CLUSTER", "NODES"]).await?;
    let text = match &reply {
        RespValue::BulkString(b) => String::from_utf8_lossy(b).into_owned(),
        RespValue::SimpleString(s) => s.clone(),
        other => return Err(ConnectionError::unexpected("CLUSTER NODES", other)),
    };
    let nodes = parse_cluster_nodes(&text)?;
    for node in &nodes {
        info!(address = %node.address, slots = ?node.slots, "discovered cluster master");
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004,host-4 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460 [5461->-67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1]
6ec23923021cf3ffec47632106199cb7f496ce01 127.0.0.1:30005@31005 master - 0 1426238316232 5 connected
";

    #[test]
    fn test_parse_masters() {
        let nodes = parse_cluster_nodes(NODES).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].address, "127.0.0.1:30002");
        assert_eq!(nodes[0].slots, vec![(5461, 10922)]);
        assert_eq!(nodes[2].address, "127.0.0.1:30001");
        assert_eq!(nodes[2].slots, vec![(0, 5460)]);
    }

    #[test]
    fn test_ipv6_address() {
        let line = "abc ::1:7000@17000 master - 0 0 1 connected 0-16383 100";
        let nodes = parse_cluster_nodes(line).unwrap();
        assert_eq!(nodes[0].address, "[::1]:7000");
        assert_eq!(nodes[0].slots, vec![(0, 16383), (100, 100)]);
    }

    #[test]
    fn test_invalid_lines() {
        assert!(parse_cluster_nodes("abc 127.0.0.1:7000 master").is_err());
        assert!(parse_cluster_nodes("abc 127.0.0.1:7000 master - 0 0 1 connected 9-x").is_err());
        assert!(parse_cluster_nodes("abc 127.0.0.1:7000 master - 0 0 1 connected 0-16384").is_err());
        assert!(parse_cluster_nodes("abc noport master - 0 0 1 connected 0").is_err());
    }
}
