//! Node configuration, loaded from TOML.

use std::path::{Path, PathBuf};

use plinth::logging::Severity;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::SecuritySetting;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub security: SecuritySetting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    /// Maps to a logger severity; `None` disables logging entirely.
    pub fn severity(self) -> Option<Severity> {
        match self {
            LogLevel::Debug => Some(Severity::Debug),
            LogLevel::Info => Some(Severity::Info),
            LogLevel::Warn => Some(Severity::Warning),
            LogLevel::Error => Some(Severity::Error),
            LogLevel::Off => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub listen: ListenConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub root_user: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub data_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            listen: ListenConfig {
                ip: "127.0.0.1".to_string(),
                port: 9000,
                security: SecuritySetting::Open,
            },
            peers: Vec::new(),
            root_user: None,
            log: LogConfig::default(),
            data_file: None,
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<NodeConfig> {
        serdeconv::from_toml_file(path).map_err(|_| Error::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: NodeConfig = serdeconv::from_toml_str(
            r#"
            root_user = "admin"
            data_file = "/var/lib/node/data.json"

            [listen]
            ip = "0.0.0.0"
            port = 9000
            security = "open"

            [[peers]]
            ip = "10.0.0.2"
            port = 7000

            [[peers]]
            ip = "10.0.0.3"
            port = 7000

            [log]
            level = "warn"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.ip, "0.0.0.0");
        assert_eq!(config.listen.security, SecuritySetting::Open);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.root_user.as_deref(), Some("admin"));
        assert_eq!(config.log.level, LogLevel::Warn);
        assert_eq!(config.log.level.severity(), Some(Severity::Warning));
    }

    #[test]
    fn test_defaults_apply() {
        let config: NodeConfig = serdeconv::from_toml_str(
            r#"
            [listen]
            ip = "127.0.0.1"
            port = 9100
            security = "close"
            "#,
        )
        .unwrap();

        assert!(config.peers.is_empty());
        assert!(config.root_user.is_none());
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.data_file.is_none());
    }

    #[test]
    fn test_off_level_has_no_severity() {
        assert_eq!(LogLevel::Off.severity(), None);
    }
}
