//! Engine configuration (SPEC_FULL §10.3): a plain, serde-deserializable
//! struct the host builds (from a file, environment, or in-process
//! defaults) and hands to [`crate::engine::Engine::bootstrap`]. The core
//! stays a library -- there is no CLI, no config-file loader, and no
//! `clap`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_owned()
}

const fn default_launchpad_timeout_secs() -> u64 {
    30
}

const fn default_waypoint_resync_interval_secs() -> u64 {
    60
}

/// Top-level engine configuration (SPEC_FULL §10.3).
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Informational only: binding the listener is the host's job (spec
    /// §4.2); the engine never reads this to decide where to bind.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory the CA persists its root cert/key under (spec §4.1).
    pub config_dir: PathBuf,

    /// Timeout applied to the launchpad replayer's HTTP client (spec
    /// §4.10), in seconds.
    #[serde(default = "default_launchpad_timeout_secs")]
    pub launchpad_timeout_secs: u64,

    /// Initial value of the global intercept-all flag (spec §4.5 step 7).
    #[serde(default)]
    pub intercept_all: bool,

    /// How often waypoints are expected to be resynced, in seconds; the
    /// engine itself never schedules this, it only exposes the interval
    /// for the host's own scheduler.
    #[serde(default = "default_waypoint_resync_interval_secs")]
    pub waypoint_resync_interval_secs: u64,

    /// Opaque per-extension configuration, read at extension (re)load and
    /// passed through untouched to the scripting runtime contract.
    #[serde(default)]
    pub extension_config: serde_json::Map<String, serde_json::Value>,
}

impl EngineConfig {
    #[must_use]
    pub fn launchpad_timeout(&self) -> Duration {
        Duration::from_secs(self.launchpad_timeout_secs)
    }

    #[must_use]
    pub fn waypoint_resync_interval(&self) -> Duration {
        Duration::from_secs(self.waypoint_resync_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults_when_only_required_fields_are_set() {
        let json = r#"{ "config_dir": "/tmp/marasi" }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.config_dir, PathBuf::from("/tmp/marasi"));
        assert_eq!(config.launchpad_timeout(), Duration::from_secs(30));
        assert!(!config.intercept_all);
        assert_eq!(config.waypoint_resync_interval(), Duration::from_secs(60));
        assert!(config.extension_config.is_empty());
    }

    #[test]
    fn deserializes_explicit_overrides() {
        let json = r#"{
            "listen_addr": "0.0.0.0:9090",
            "config_dir": "/var/lib/marasi",
            "launchpad_timeout_secs": 5,
            "intercept_all": true,
            "waypoint_resync_interval_secs": 120,
            "extension_config": { "my-extension": { "verbose": true } }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:9090");
        assert_eq!(config.launchpad_timeout(), Duration::from_secs(5));
        assert!(config.intercept_all);
        assert_eq!(config.waypoint_resync_interval(), Duration::from_secs(120));
        assert_eq!(
            config.extension_config["my-extension"]["verbose"],
            serde_json::Value::Bool(true)
        );
    }
}
