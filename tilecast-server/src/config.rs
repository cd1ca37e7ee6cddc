//! Configuration for the tilecast server.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Browser endpoint settings.
    pub browser: BrowserConfig,
    /// Session housekeeping.
    pub limits: LimitsConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the WebSocket listener on.
    pub listen_addr: String,
    /// Port for display-client connections.
    pub port: u16,
}

/// Browser endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// DevTools endpoint: `http(s)://host:port` (resolved via
    /// `/json/version`) or a `ws(s)://` debugger URL.
    pub devtools_url: String,
}

/// Session housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Destroy sessions idle longer than this many seconds.
    pub idle_ttl_secs: u64,
    /// How often the idle sweep runs, in seconds.
    pub sweep_interval_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            port: 9910,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            devtools_url: "http://127.0.0.1:9222".into(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// `"addr:port"` string for the listener bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.network.listen_addr, self.network.port)
    }
}

// ── Environment flags ────────────────────────────────────────────

/// Whether `PREFERS_REDUCED_MOTION` is set to a truthy value.
pub fn prefers_reduced_motion() -> bool {
    truthy(std::env::var("PREFERS_REDUCED_MOTION").ok().as_deref())
}

fn truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|s| s.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = ServerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("listen_addr"));
        assert!(text.contains("devtools_url"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = ServerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, 9910);
        assert_eq!(parsed.limits.idle_ttl_secs, 300);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let parsed: ServerConfig = toml::from_str("[network]\nport = 7000\n").unwrap();
        assert_eq!(parsed.network.port, 7000);
        assert_eq!(parsed.network.listen_addr, "0.0.0.0");
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn bind_addr_formats() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9910");
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "YES", " on ", "True"] {
            assert!(truthy(Some(v)), "{v} should be truthy");
        }
        for v in ["0", "false", "off", "", "2"] {
            assert!(!truthy(Some(v)), "{v} should be falsy");
        }
        assert!(!truthy(None));
    }
}
