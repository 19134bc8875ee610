//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `NTCTL_DEVICE`, `NTCTL_BAUD`, `NTCTL_PROFILE`
//! 2. **Config file** — path via `--config <path>`, or `ntctl.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [profile]
//! kind = "lte_m"  # or "ntn"
//!
//! [network]
//! udp_port = 0
//! harvest_endpoint = "harvest.soracom.io"
//! harvest_port = 8514
//! udp_buffer_size = 1500
//! ip_filter = "100.127.10.16"
//! ntn_band = "255"
//!
//! [logging]
//! level = "info"
//! ```

use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

use crate::profile::{NetworkParams, ProfileKind};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial device settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device path (default `/dev/ttyUSB0`). Override with `NTCTL_DEVICE`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Baud rate (default 115200). Override with `NTCTL_BAUD`.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Which device family to bring up.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
    /// `"lte_m"` or `"ntn"` (default `"lte_m"`). Override with `NTCTL_PROFILE`.
    #[serde(default = "default_profile_kind")]
    pub kind: String,
}

/// Network-facing parameters a profile needs during bring-up.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Local UDP port to bind for Profile A (default 0 — use `#XBIND`'s
    /// modem-assigned port when set to 0 is not supported by the firmware,
    /// callers should set an explicit port).
    #[serde(default)]
    pub udp_port: u16,
    /// Harvest/ingestion endpoint hostname (default `harvest.soracom.io`).
    #[serde(default = "default_harvest_endpoint")]
    pub harvest_endpoint: String,
    /// Harvest/ingestion endpoint port (default 8514).
    #[serde(default = "default_harvest_port")]
    pub harvest_port: u16,
    /// Receive buffer size in bytes passed to `#XRECVFROM`/`%SOCKETDATA` (default 1500).
    #[serde(default = "default_udp_buffer_size")]
    pub udp_buffer_size: usize,
    /// Source IP address Profile A filters inbound UDP datagrams by
    /// (default `100.127.10.16`).
    #[serde(default = "default_ip_filter")]
    pub ip_filter: Ipv4Addr,
    /// NTN band lock value for `AT%SETCFG="BAND",...` (default `255` = auto).
    #[serde(default = "default_ntn_band")]
    pub ntn_band: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud() -> u32 {
    115200
}
fn default_profile_kind() -> String {
    "lte_m".to_string()
}
fn default_harvest_endpoint() -> String {
    "harvest.soracom.io".to_string()
}
fn default_harvest_port() -> u16 {
    8514
}
fn default_udp_buffer_size() -> usize {
    1500
}
fn default_ip_filter() -> Ipv4Addr {
    Ipv4Addr::new(100, 127, 10, 16)
}
fn default_ntn_band() -> String {
    "255".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            kind: default_profile_kind(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            udp_port: 0,
            harvest_endpoint: default_harvest_endpoint(),
            harvest_port: default_harvest_port(),
            udp_buffer_size: default_udp_buffer_size(),
            ip_filter: default_ip_filter(),
            ntn_band: default_ntn_band(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            profile: ProfileConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `ntctl.toml` in the current directory, falling back to
    /// compiled defaults.
    #[must_use]
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("ntctl.toml").exists() {
            let content = std::fs::read_to_string("ntctl.toml").expect("Failed to read ntctl.toml");
            toml::from_str(&content).expect("Failed to parse ntctl.toml")
        } else {
            Config::default()
        };

        if let Ok(device) = std::env::var("NTCTL_DEVICE") {
            config.serial.device = device;
        }
        if let Ok(baud) = std::env::var("NTCTL_BAUD") {
            if let Ok(baud) = baud.parse() {
                config.serial.baud = baud;
            }
        }
        if let Ok(kind) = std::env::var("NTCTL_PROFILE") {
            config.profile.kind = kind;
        }

        config
    }

    /// Parse `[profile].kind` into a [`ProfileKind`]. Unrecognized values
    /// fall back to `LteM` — the same behavior as the compiled default.
    #[must_use]
    pub fn profile_kind(&self) -> ProfileKind {
        match self.profile.kind.as_str() {
            "ntn" => ProfileKind::Ntn,
            _ => ProfileKind::LteM,
        }
    }

    /// Build the [`NetworkParams`] a profile needs during bring-up.
    #[must_use]
    pub fn network_params(&self) -> NetworkParams {
        NetworkParams {
            udp_port: self.network.udp_port,
            harvest_endpoint: self.network.harvest_endpoint.clone(),
            harvest_port: self.network.harvest_port,
            udp_buffer_size: self.network.udp_buffer_size,
            ip_filter: self.network.ip_filter,
            ntn_band: self.network.ntn_band.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.serial.device, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud, 115200);
        assert_eq!(config.profile.kind, "lte_m");
    }

    #[test]
    fn test_profile_kind_defaults_to_lte_m_on_unknown() {
        let mut config = Config::default();
        config.profile.kind = "bogus".to_string();
        assert_eq!(config.profile_kind(), ProfileKind::LteM);
    }

    #[test]
    fn test_profile_kind_ntn() {
        let mut config = Config::default();
        config.profile.kind = "ntn".to_string();
        assert_eq!(config.profile_kind(), ProfileKind::Ntn);
    }
}
