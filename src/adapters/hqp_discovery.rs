//! DSP instance discovery via UDP multicast.
//!
//! Sends `<?xml version="1.0"?><discover>hqplayer</discover>` to the group
//! `239.192.0.199:4321` from an ephemeral socket and collects
//! `<discover result="OK" .../>` replies for a bounded window. The sender's
//! source IP identifies the instance host; results are deduplicated by host,
//! so repeated sweeps of the same network return the same set.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::Result;

pub const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 0, 199);
pub const DISCOVERY_PORT: u16 = 4321;
const DISCOVERY_REQUEST: &[u8] = b"<?xml version=\"1.0\"?><discover>hqplayer</discover>";
const DISCOVERY_WINDOW: Duration = Duration::from_secs(3);

/// One DSP instance that answered the multicast probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredDsp {
    /// Source IP of the reply; this is the control-port host.
    pub host: String,
    pub name: String,
    pub product: String,
    pub version: String,
}

/// Parse a `<discover result="OK" name=... version=... product=.../>` reply.
/// Returns None for non-OK results and foreign datagrams.
fn parse_reply(data: &[u8], source: &SocketAddr) -> Option<DiscoveredDsp> {
    let text = std::str::from_utf8(data).ok()?;
    let text = text.trim();

    // Strip an optional declaration.
    let body = match text.strip_prefix("<?xml") {
        Some(rest) => rest.split_once("?>").map(|(_, b)| b.trim_start())?,
        None => text,
    };

    if !body.starts_with("<discover") {
        debug!(%source, "discovery: ignoring foreign datagram");
        return None;
    }
    if attr(body, "result").as_deref() != Some("OK") {
        debug!(%source, "discovery: non-OK reply");
        return None;
    }

    Some(DiscoveredDsp {
        host: source.ip().to_string(),
        name: attr(body, "name").unwrap_or_default(),
        product: attr(body, "product").unwrap_or_default(),
        version: attr(body, "version").unwrap_or_default(),
    })
}

fn attr(xml: &str, key: &str) -> Option<String> {
    let pattern = format!("{key}=\"");
    let start = xml.find(&pattern)? + pattern.len();
    let rest = &xml[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Sweep the local network for DSP instances. `window` defaults to 3 s.
pub async fn discover(window: Option<Duration>) -> Result<Vec<DiscoveredDsp>> {
    let window = window.unwrap_or(DISCOVERY_WINDOW);
    let socket = UdpSocket::bind("0.0.0.0:0").await?;

    let dest = SocketAddr::from((DISCOVERY_GROUP, DISCOVERY_PORT));
    socket.send_to(DISCOVERY_REQUEST, dest).await?;
    debug!(%dest, "sent dsp discovery probe");

    let mut found: HashMap<String, DiscoveredDsp> = HashMap::new();
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + window;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, source))) => {
                if let Some(instance) = parse_reply(&buf[..len], &source) {
                    found.insert(instance.host.clone(), instance);
                }
            }
            Ok(Err(e)) => {
                debug!("discovery recv error: {e}");
                break;
            }
            Err(_) => break,
        }
    }

    let mut instances: Vec<DiscoveredDsp> = found.into_values().collect();
    instances.sort_by(|a, b| a.host.cmp(&b.host));
    info!(count = instances.len(), "dsp discovery finished");
    Ok(instances)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn source() -> SocketAddr {
        "192.168.1.42:4321".parse().unwrap()
    }

    #[test]
    fn parses_ok_reply() {
        let reply = b"<?xml version=\"1.0\"?><discover result=\"OK\" name=\"Study\" version=\"5.8.2\" product=\"HQPlayer Embedded\"/>";
        let found = parse_reply(reply, &source()).unwrap();
        assert_eq!(found.host, "192.168.1.42");
        assert_eq!(found.name, "Study");
        assert_eq!(found.version, "5.8.2");
        assert_eq!(found.product, "HQPlayer Embedded");
    }

    #[test]
    fn reply_without_declaration_is_accepted() {
        let reply = b"<discover result=\"OK\" name=\"Den\" version=\"5\" product=\"P\"/>";
        assert!(parse_reply(reply, &source()).is_some());
    }

    #[test]
    fn rejects_non_ok_results() {
        let reply = b"<discover result=\"BUSY\" name=\"X\"/>";
        assert!(parse_reply(reply, &source()).is_none());
    }

    #[test]
    fn rejects_foreign_datagrams() {
        assert!(parse_reply(b"HTTP/1.1 200 OK", &source()).is_none());
        assert!(parse_reply(b"\xff\xfe\x00", &source()).is_none());
        assert!(parse_reply(b"<hello/>", &source()).is_none());
    }

    #[test]
    fn host_comes_from_the_source_address() {
        let reply = b"<discover result=\"OK\" name=\"A\" version=\"1\" product=\"B\"/>";
        let other: SocketAddr = "10.0.0.7:9999".parse().unwrap();
        assert_eq!(parse_reply(reply, &other).unwrap().host, "10.0.0.7");
    }

    #[test]
    fn duplicate_hosts_collapse_to_one_entry() {
        // Same reply seen twice (two probe rounds) keys to one host.
        let reply = b"<discover result=\"OK\" name=\"A\" version=\"1\" product=\"B\"/>";
        let mut found: HashMap<String, DiscoveredDsp> = HashMap::new();
        for _ in 0..2 {
            let instance = parse_reply(reply, &source()).unwrap();
            found.insert(instance.host.clone(), instance);
        }
        assert_eq!(found.len(), 1);
    }
}
