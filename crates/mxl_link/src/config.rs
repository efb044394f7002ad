//! Hub configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Configuration for a [`Hub`](crate::Hub).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// TCP listen address for driver connections, if any.
    pub tcp_addr: Option<SocketAddr>,

    /// Unix-domain socket path for driver connections, if any. Any stale
    /// file at this path is unlinked before binding.
    pub unix_path: Option<PathBuf>,

    /// Overall budget a driver may stay unresponsive: the maximum wait for
    /// an AMP within one exchange, and the maximum pause before a missing
    /// driver is declared lost.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Poll interval while waiting for connections or reconnections.
    #[serde(with = "duration_secs")]
    pub latency: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            tcp_addr: Some(
                "127.0.0.1:31415"
                    .parse()
                    .expect("valid default listen address"),
            ),
            unix_path: None,
            timeout: Duration::from_secs(60),
            latency: Duration::from_millis(10),
        }
    }
}

impl HubConfig {
    /// A loopback config on an OS-assigned port with short waits. Intended
    /// for tests and local experiments.
    pub fn loopback() -> Self {
        Self {
            tcp_addr: Some("127.0.0.1:0".parse().expect("valid loopback address")),
            unix_path: None,
            timeout: Duration::from_secs(2),
            latency: Duration::from_millis(5),
        }
    }

    /// Listen on a Unix-domain path only.
    pub fn unix_only(path: impl Into<PathBuf>) -> Self {
        Self {
            tcp_addr: None,
            unix_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), LinkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or corrupt.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<HubConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt hub config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read hub config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(dur.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be finite and non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.tcp_addr.unwrap().port(), 31415);
        assert!(config.unix_path.is_none());
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.latency, Duration::from_millis(10));
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let mut config = HubConfig::default();
        config.latency = Duration::from_micros(2500);
        let json = serde_json::to_string(&config).unwrap();
        let loaded: HubConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.tcp_addr, config.tcp_addr);
        assert_eq!(loaded.timeout, config.timeout);
        assert_eq!(loaded.latency, config.latency);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.json");

        let mut original = HubConfig::unix_only("/tmp/mxl-test.sock");
        original.timeout = Duration::from_secs(120);
        original.save_to_file(&path).unwrap();

        let loaded = HubConfig::load_or_default(&path);
        assert_eq!(loaded.unix_path, original.unix_path);
        assert!(loaded.tcp_addr.is_none());
        assert_eq!(loaded.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let path = std::env::temp_dir().join("mxl_link_nonexistent_config.json");
        let _ = std::fs::remove_file(&path);
        let config = HubConfig::load_or_default(&path);
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_config_rejects_negative_duration() {
        let result = serde_json::from_str::<HubConfig>(
            r#"{"tcp_addr": null, "unix_path": null, "timeout": -1.0, "latency": 0.01}"#,
        );
        assert!(result.is_err());
    }
}
