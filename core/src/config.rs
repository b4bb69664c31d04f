use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3007;

/// Runtime configuration of one coordinator instance
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Where the database and the at-rest key live. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    /// FQDN of this node. When unset it is taken from the `/setup` request.
    pub fqdn: Option<String>,
    pub peer_port: u16,
    pub peer_scheme: String,
    pub heartbeat_interval: Duration,
    /// Round-trip timeout for a single heartbeat
    pub heartbeat_timeout: Duration,
    /// Round-trips slower than this are logged
    pub heartbeat_max_rtt: Duration,
    /// Missed intervals before a node counts as unreachable
    pub liveness_missed: u32,
    /// Consecutive failures against the leader before re-election
    pub leader_failures: u32,
    pub name: String,
    pub version: String,
    pub production: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            fqdn: None,
            peer_port: DEFAULT_PORT,
            peer_scheme: "http".to_string(),
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(5_000),
            heartbeat_max_rtt: Duration::from_millis(150),
            liveness_missed: 4,
            leader_failures: 3,
            name: "morio-core".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            production: true,
        }
    }
}

impl CoreConfig {
    /// In-memory configuration for a node with a known FQDN
    pub fn in_memory(fqdn: &str) -> Self {
        Self {
            fqdn: Some(fqdn.to_string()),
            production: false,
            ..Self::default()
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * self.liveness_missed.max(1)
    }

    pub fn db_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("core.db"))
    }

    pub fn rest_key_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("rest.key"))
    }

    pub fn peer_base_url(&self, fqdn: &str) -> String {
        format!("{}://{}:{}", self.peer_scheme, fqdn, self.peer_port)
    }

    /// Effective configuration, as exposed to the front-end API
    pub fn presets(&self) -> BTreeMap<String, Value> {
        let mut presets = BTreeMap::new();
        presets.insert("MORIO_CORE_PORT".to_string(), json!(self.peer_port));
        presets.insert("MORIO_CORE_SCHEME".to_string(), json!(self.peer_scheme));
        presets.insert(
            "MORIO_CORE_CLUSTER_HEARTBEAT_INTERVAL".to_string(),
            json!(self.heartbeat_interval.as_millis() as u64),
        );
        presets.insert(
            "MORIO_CORE_CLUSTER_HEARTBEAT_TIMEOUT".to_string(),
            json!(self.heartbeat_timeout.as_millis() as u64),
        );
        presets.insert(
            "MORIO_CORE_CLUSTER_HEARTBEAT_MAX_RTT".to_string(),
            json!(self.heartbeat_max_rtt.as_millis() as u64),
        );
        presets.insert(
            "MORIO_CORE_CLUSTER_LIVENESS_MISSED".to_string(),
            json!(self.liveness_missed),
        );
        presets.insert(
            "MORIO_CORE_CLUSTER_LEADER_FAILURES".to_string(),
            json!(self.leader_failures),
        );
        presets.insert("MORIO_CORE_VERSION".to_string(), json!(self.version));
        presets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_window() {
        let config = CoreConfig {
            heartbeat_interval: Duration::from_millis(100),
            liveness_missed: 4,
            ..CoreConfig::default()
        };
        assert_eq!(config.liveness_window(), Duration::from_millis(400));
    }

    #[test]
    fn test_in_memory_has_no_paths() {
        let config = CoreConfig::in_memory("a.example.com");
        assert!(config.db_path().is_none());
        assert!(config.rest_key_path().is_none());
        assert_eq!(config.peer_base_url("b.example.com"), "http://b.example.com:3007");
    }
}
