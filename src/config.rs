//! # Daemon Configuration
//!
//! The daemon consumes a resolved configuration record, loaded from a JSON
//! file or built from defaults.
//!
//! ## Configuration Keys
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | `sd_address` | `224.224.224.245` | SD multicast group address |
//! | `sd_port` | 30490 | SD port (multicast and unicast) |
//! | `interface` | `127.0.0.1` | Local interface for SD and endpoints |
//! | `uds_path` | `/tmp/someipyd.sock` | Unix-domain socket for the IPC server |
//! | `log_level` | `info` | Log filter for the daemon binary |
//! | `log_path` | none | Log file; stdout when absent |
//! | `subscribe_retry_timeout_ms` | 300 | Subscribe-Ack response timer |
//! | `request_timeout_ms` | 30000 | Deadline for an application's reply to a forwarded request |
//!
//! Only `sd_address`, `sd_port`, `interface`, and `uds_path` affect the
//! protocol engine; the rest are consumed by the binary.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Default SD multicast address.
pub const DEFAULT_SD_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 224, 224, 245);

/// Default SD port per the SOME/IP-SD specification.
///
/// This port is **only for Service Discovery**, never for RPC traffic.
pub const DEFAULT_SD_PORT: u16 = 30490;

/// Default local interface address.
pub const DEFAULT_INTERFACE: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Default Unix-domain socket path for the IPC server.
pub const DEFAULT_UDS_PATH: &str = "/tmp/someipyd.sock";

/// Default Subscribe-Ack response timer in milliseconds.
pub const DEFAULT_SUBSCRIBE_RETRY_TIMEOUT_MS: u64 = 300;

/// Default deadline for an application reply to a forwarded request.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Resolved daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SD multicast group address
    pub sd_address: Ipv4Addr,
    /// SD port (multicast reception and unicast SD replies)
    pub sd_port: u16,
    /// Local interface for SD membership and service endpoints
    pub interface: Ipv4Addr,
    /// Path of the Unix-domain IPC socket
    pub uds_path: PathBuf,
    /// Log filter directive for the daemon binary
    pub log_level: String,
    /// Optional log file; stdout when absent
    pub log_path: Option<PathBuf>,
    /// Subscribe-Ack response timer in milliseconds
    pub subscribe_retry_timeout_ms: u64,
    /// Deadline for an application's reply to a forwarded request
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sd_address: DEFAULT_SD_MULTICAST,
            sd_port: DEFAULT_SD_PORT,
            interface: DEFAULT_INTERFACE,
            uds_path: PathBuf::from(DEFAULT_UDS_PATH),
            log_level: "info".to_string(),
            log_path: None,
            subscribe_retry_timeout_ms: DEFAULT_SUBSCRIBE_RETRY_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// Missing keys fall back to their defaults; an unreadable or
    /// unparseable file is a startup error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| ConfigError::new(format!("cannot parse {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test_log::test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.sd_address, Ipv4Addr::new(224, 224, 224, 245));
        assert_eq!(config.sd_port, 30490);
        assert_eq!(config.interface, Ipv4Addr::LOCALHOST);
        assert_eq!(config.uds_path, PathBuf::from("/tmp/someipyd.sock"));
    }

    #[test_log::test]
    fn load_overrides_and_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"sd_port": 31000, "interface": "127.0.0.2", "log_level": "debug"}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sd_port, 31000);
        assert_eq!(config.interface, Ipv4Addr::new(127, 0, 0, 2));
        assert_eq!(config.log_level, "debug");
        // Untouched keys keep their defaults
        assert_eq!(config.sd_address, DEFAULT_SD_MULTICAST);
        assert_eq!(config.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test_log::test]
    fn load_rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sd_prot": 31000}}"#).unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test_log::test]
    fn load_rejects_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/someipyd.json")).is_err());
    }
}
