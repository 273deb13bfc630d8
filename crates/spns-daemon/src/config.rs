//! Daemon configuration file management.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spns_hive::HiveConfig;
use spns_transport::link::LinkAddr;

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Engine settings.
    #[serde(default)]
    pub core: CoreConfig,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// SQLite database path.
    #[serde(default = "default_database")]
    pub database: String,
    /// RPC address of the local block node.
    #[serde(default = "default_local_node")]
    pub local_node: String,
    /// Listen address for frontend and notifier connections.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Extra endpoints dedicated to storage-node traffic (0 = share the
    /// main endpoint).
    #[serde(default)]
    pub push_instances: u32,
    /// Maximum simultaneous outgoing connection attempts.
    #[serde(default = "default_max_pending_connects")]
    pub max_pending_connects: i64,
    /// Notification dedup window, per filter generation.
    #[serde(default = "default_filter_lifetime")]
    pub filter_lifetime_secs: u64,
    /// How long startup waits for notifiers to register.
    #[serde(default = "default_notifier_wait")]
    pub notifier_wait_ms: u64,
    /// Notifier services to wait for; the wait ends early once all have
    /// registered.
    #[serde(default)]
    pub notifiers_expected: Vec<String>,
    /// Cadence of the slow subscription recheck.
    #[serde(default = "default_subs_interval")]
    pub subs_interval_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Tracing filter directive, e.g. "info" or "spns_hive=debug,info".
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_database() -> String {
    "spns.db".to_string()
}

fn default_local_node() -> String {
    "127.0.0.1:22025".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:22030".to_string()
}

fn default_max_pending_connects() -> i64 {
    500
}

fn default_filter_lifetime() -> u64 {
    600
}

fn default_notifier_wait() -> u64 {
    10_000
}

fn default_subs_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            local_node: default_local_node(),
            listen: default_listen(),
            push_instances: 0,
            max_pending_connects: default_max_pending_connects(),
            filter_lifetime_secs: default_filter_lifetime(),
            notifier_wait_ms: default_notifier_wait(),
            notifiers_expected: Vec::new(),
            subs_interval_secs: default_subs_interval(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `SPNS_CONFIG` or `./spns.toml`, falling
    /// back to defaults if no file exists.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> PathBuf {
        std::env::var("SPNS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("spns.toml"))
    }

    /// The engine's view of this configuration.
    pub fn hive_config(&self) -> anyhow::Result<HiveConfig> {
        let local_node: LinkAddr = self
            .core
            .local_node
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid local_node address: {e}"))?;
        Ok(HiveConfig {
            local_node,
            filter_lifetime: Duration::from_secs(self.core.filter_lifetime_secs),
            notifier_wait: Duration::from_millis(self.core.notifier_wait_ms),
            notifiers_expected: self.core.notifiers_expected.clone(),
            subs_interval: Duration::from_secs(self.core.subs_interval_secs),
            max_pending_connects: self.core.max_pending_connects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.core.database, "spns.db");
        assert_eq!(config.core.push_instances, 0);
        assert_eq!(config.core.max_pending_connects, 500);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn config_serialization_roundtrip() {
        let config = DaemonConfig::default();
        let rendered = toml::to_string(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&rendered).expect("parse");
        assert_eq!(parsed.core.local_node, config.core.local_node);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let parsed: DaemonConfig = toml::from_str(
            r#"
            [core]
            listen = "0.0.0.0:9000"
            notifiers_expected = ["apns", "firebase"]
            "#,
        )
        .expect("parse");
        assert_eq!(parsed.core.listen, "0.0.0.0:9000");
        assert_eq!(parsed.core.notifiers_expected.len(), 2);
        assert_eq!(parsed.core.database, "spns.db");
    }

    #[test]
    fn hive_config_conversion() {
        let config = DaemonConfig::default();
        let hive = config.hive_config().expect("convert");
        assert_eq!(hive.local_node, LinkAddr::new("127.0.0.1", 22025));
        assert_eq!(hive.filter_lifetime, Duration::from_secs(600));
    }
}
