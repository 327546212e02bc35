//! Static peer loading and the bridge from discovery sources to the node.
//!
//! Reads a file containing peer IP addresses (one per line) and dials them on
//! startup. Any other discovery mechanism (mDNS browsing, a UI field) only
//! has to push addresses into a channel drained by [`forward_discovered`].

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::manager::NodeHandle;

/// Load peer IP addresses from a configuration file.
///
/// The file format is one IP address per line. Empty lines and lines starting
/// with `#` are ignored.
///
/// # Example file
///
/// ```text
/// # office LAN
/// 192.168.1.20
/// fe80::1c2b:3aff:fe4d:5e6f
/// ```
pub fn load_static_peers(path: &Path) -> Vec<IpAddr> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Failed to read static peers file"
            );
            return Vec::new();
        }
    };

    let addrs: Vec<IpAddr> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match line.parse::<IpAddr>() {
            Ok(addr) => {
                debug!(addr = %addr, "Loaded static peer");
                Some(addr)
            }
            Err(e) => {
                warn!(line = %line, error = %e, "Skipping invalid peer address");
                None
            }
        })
        .collect();

    info!(
        count = addrs.len(),
        path = %path.display(),
        "Loaded static peers"
    );

    addrs
}

/// Parse a list of address strings, e.g. from a comma-separated setting.
pub fn parse_peer_addrs(raw: &[String]) -> Vec<IpAddr> {
    raw.iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            s.parse::<IpAddr>().ok().or_else(|| {
                warn!(addr = %s, "Could not parse peer address");
                None
            })
        })
        .collect()
}

/// Dial every address received on `rx` until the channel or the node closes.
pub async fn forward_discovered(mut rx: mpsc::Receiver<IpAddr>, handle: NodeHandle) {
    while let Some(ip) = rx.recv().await {
        debug!(ip = %ip, "Peer discovered");
        if handle.connect(ip).await.is_err() {
            info!("Node stopped, discovery bridge exiting");
            break;
        }
    }
}
