//! Node settings loaded from environment variables.
//!
//! Everything has a default so the node starts with zero configuration on a
//! LAN. Malformed values are logged and ignored.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use murmur_net::NodeConfig;

/// Settings of the `murmur-node` binary.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Library configuration handed to `spawn_node`.
    pub node: NodeConfig,

    /// SQLite database file.
    /// Env: `MURMUR_DB_PATH`
    /// Default: the platform data directory (see `Database::default_path`).
    pub db_path: Option<PathBuf>,

    /// Raw SQLCipher key, 64 hex characters. Only honored with the
    /// `sqlcipher` feature.
    /// Env: `MURMUR_DB_KEY`
    pub db_key: Option<[u8; 32]>,

    /// File with one peer IP per line, dialed at startup.
    /// Env: `MURMUR_PEERS_FILE`
    pub peers_file: Option<PathBuf>,

    /// Comma-separated peer IPs, dialed at startup.
    /// Env: `MURMUR_PEERS`
    pub peers: Vec<String>,

    /// Name used when a new identity is created.
    /// Env: `MURMUR_NAME`
    /// Default: `"murmur"`
    pub name: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            db_path: None,
            db_key: None,
            peers_file: None,
            peers: Vec::new(),
            name: "murmur".to_string(),
        }
    }
}

impl NodeSettings {
    /// Load settings from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(addr) = lookup("MURMUR_LISTEN_ADDR") {
            match addr.parse::<IpAddr>() {
                Ok(ip) => settings.node.listen_addr = ip,
                Err(_) => tracing::warn!(value = %addr, "Invalid MURMUR_LISTEN_ADDR, using default"),
            }
        }

        if let Some(port) = parse(&lookup, "MURMUR_PORT") {
            settings.node.port = port;
        }

        if let Some(path) = lookup("MURMUR_DB_PATH") {
            settings.db_path = Some(PathBuf::from(path));
        }

        if let Some(raw) = lookup("MURMUR_DB_KEY") {
            let mut key = [0u8; 32];
            match hex::decode_to_slice(raw.trim(), &mut key) {
                Ok(()) => settings.db_key = Some(key),
                Err(e) => tracing::warn!(error = %e, "Invalid MURMUR_DB_KEY, opening without a key"),
            }
        }

        if let Some(path) = lookup("MURMUR_DOWNLOAD_DIR") {
            settings.node.download_dir = PathBuf::from(path);
        }

        if let Some(path) = lookup("MURMUR_PEERS_FILE") {
            settings.peers_file = Some(PathBuf::from(path));
        }

        if let Some(list) = lookup("MURMUR_PEERS") {
            settings.peers = list.split(',').map(str::to_string).collect();
        }

        if let Some(val) = lookup("MURMUR_USE_PADDING") {
            settings.node.use_padding = val != "false" && val != "0";
        }

        if let Some(secs) = parse::<u64, _>(&lookup, "MURMUR_HANDSHAKE_TIMEOUT_SECS") {
            settings.node.handshake_timeout = Duration::from_secs(secs);
        }

        if let Some(size) = parse(&lookup, "MURMUR_MAX_RECORD_SIZE") {
            settings.node.max_record_size = size;
        }

        if let Some(name) = lookup("MURMUR_NAME") {
            if !name.trim().is_empty() {
                settings.name = name;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        settings
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> NodeSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_settings() {
        let s = settings(&[]);
        assert_eq!(s.node.port, murmur_shared::constants::DEFAULT_PORT);
        assert!(s.node.use_padding);
        assert!(s.db_path.is_none());
        assert_eq!(s.name, "murmur");
    }

    #[test]
    fn test_values_are_applied() {
        let key = "ab".repeat(32);
        let s = settings(&[
            ("MURMUR_LISTEN_ADDR", "127.0.0.1"),
            ("MURMUR_PORT", "9000"),
            ("MURMUR_USE_PADDING", "false"),
            ("MURMUR_HANDSHAKE_TIMEOUT_SECS", "3"),
            ("MURMUR_PEERS", "10.0.0.1, 10.0.0.2"),
            ("MURMUR_NAME", "Ana"),
            ("MURMUR_DB_KEY", key.as_str()),
        ]);
        assert_eq!(s.db_key, Some([0xab; 32]));
        assert_eq!(s.node.listen_addr, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(s.node.port, 9000);
        assert!(!s.node.use_padding);
        assert_eq!(s.node.handshake_timeout, Duration::from_secs(3));
        assert_eq!(s.peers.len(), 2);
        assert_eq!(s.name, "Ana");
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let s = settings(&[
            ("MURMUR_LISTEN_ADDR", "not-an-ip"),
            ("MURMUR_PORT", "99999"),
            ("MURMUR_MAX_RECORD_SIZE", "big"),
            ("MURMUR_DB_KEY", "abcd"),
        ]);
        assert!(s.db_key.is_none());
        let defaults = NodeConfig::default();
        assert_eq!(s.node.listen_addr, defaults.listen_addr);
        assert_eq!(s.node.port, defaults.port);
        assert_eq!(s.node.max_record_size, defaults.max_record_size);
    }
}
