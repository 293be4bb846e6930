//! Configuration file support
//!
//! ```toml
//! [tftp]
//! ip = "0.0.0.0"
//! port = 69
//! root_dir = "/srv/tftp"
//! timeout = "5s"
//! max_blksize = 1024
//!
//! [poller]
//! interval = "200ms"
//! inactivity_timeout = "5m"
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "netopskit.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub tftp: TftpSection,
    pub poller: PollerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TftpSection {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub root_dir: Option<PathBuf>,
    pub read_only: Option<bool>,
    pub max_blksize: Option<u16>,
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub oack_retries: Option<u32>,
    pub max_transfers: Option<usize>,
    pub bind_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollerSection {
    #[serde(with = "humantime_serde")]
    pub interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub inactivity_timeout: Option<Duration>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path` if given, else `./netopskit.toml` when present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    log::info!("Using config file {}", fallback.display());
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let config = AppConfig::parse(
            r#"
            [tftp]
            ip = "10.0.0.1"
            port = 6969
            root_dir = "/srv/tftp"
            read_only = true
            timeout = "3s"
            max_blksize = 1024
            retries = 4

            [poller]
            interval = "250ms"
            inactivity_timeout = "5m"
            "#,
        )
        .unwrap();

        assert_eq!(config.tftp.ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(config.tftp.port, Some(6969));
        assert_eq!(config.tftp.timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.tftp.max_blksize, Some(1024));
        assert_eq!(config.tftp.retries, Some(4));
        assert_eq!(config.tftp.read_only, Some(true));
        assert_eq!(config.poller.interval, Some(Duration::from_millis(250)));
        assert_eq!(config.poller.inactivity_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert!(config.tftp.port.is_none());
        assert!(config.poller.interval.is_none());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(AppConfig::parse("[tftp]\nwindowsize = 4\n").is_err());
        assert!(AppConfig::parse("[tftp]\nblock_size = 1024\n").is_err());
    }
}
