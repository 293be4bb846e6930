use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

use super::poller::PollerConfig;
use crate::config::{PollerSection, TftpSection};
use crate::tftp::core::options::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OptionsPrivate};

const DEFAULT_MAX_TRANSFERS: usize = 64;
const DEFAULT_BIND_ATTEMPTS: u32 = 5;

/// TFTP server configuration
///
/// Built from defaults, then a configuration file, then command line flags.
///
/// # Example
///
/// ```rust
/// use netopskit::tftp::server::Config;
/// use std::path::PathBuf;
///
/// let config = Config::new(
///     "127.0.0.1".parse().unwrap(),
///     69,
///     PathBuf::from("/tmp/tftp"),
///     false,
/// );
/// assert_eq!(config.opt_local.retries, 5);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// IP address to listen on
    pub ip_address: IpAddr,
    /// Port number to listen on
    pub port: u16,
    /// Root directory served to and written by clients
    pub directory: PathBuf,
    /// Whether to use read-only mode (reject all write requests)
    pub read_only: bool,
    /// Transfers allowed to run at once; further requests are refused
    pub max_transfers: usize,
    /// Bind attempts while the port is still held by another process
    pub bind_attempts: u32,
    /// Internal options (retries, timeouts, block size limits)
    pub opt_local: OptionsPrivate,
    /// Status poller cadence
    pub poller: PollerConfig,
}

/// Values given on the command line; `None` keeps the lower layer
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub ip_address: Option<IpAddr>,
    pub port: Option<u16>,
    pub directory: Option<PathBuf>,
    pub read_only: bool,
    pub max_blksize: Option<u16>,
    pub timeout: Option<Duration>,
}

impl Config {
    /// Create a new configuration
    ///
    /// # Arguments
    ///
    /// * `ip_address` - IP address to listen on
    /// * `port` - Port number to listen on
    /// * `directory` - Root directory for files
    /// * `read_only` - Whether to use read-only mode
    pub fn new(ip_address: IpAddr, port: u16, directory: PathBuf, read_only: bool) -> Self {
        Self {
            ip_address,
            port,
            directory,
            read_only,
            max_transfers: DEFAULT_MAX_TRANSFERS,
            bind_attempts: DEFAULT_BIND_ATTEMPTS,
            opt_local: OptionsPrivate::default(),
            poller: PollerConfig::default(),
        }
    }

    /// Defaults: all interfaces, port 69, `./tftp_root`
    pub fn with_defaults() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            69,
            PathBuf::from("./tftp_root"),
            false,
        )
    }

    /// Apply the `[tftp]` and `[poller]` tables of a configuration file
    pub fn merge_file(mut self, tftp: &TftpSection, poller: &PollerSection) -> Self {
        if let Some(ip) = tftp.ip {
            self.ip_address = ip;
        }
        if let Some(port) = tftp.port {
            self.port = port;
        }
        if let Some(dir) = &tftp.root_dir {
            self.directory = dir.clone();
        }
        if let Some(read_only) = tftp.read_only {
            self.read_only = read_only;
        }
        if let Some(max) = tftp.max_transfers {
            self.max_transfers = max;
        }
        if let Some(attempts) = tftp.bind_attempts {
            self.bind_attempts = attempts;
        }
        if tftp.max_blksize.is_some() {
            self.opt_local.max_blksize = tftp.max_blksize;
        }
        if let Some(timeout) = tftp.timeout {
            self.opt_local.timeout = timeout;
        }
        if let Some(retries) = tftp.retries {
            self.opt_local.retries = retries;
        }
        if let Some(retries) = tftp.oack_retries {
            self.opt_local.oack_retries = retries;
        }
        if let Some(interval) = poller.interval {
            self.poller.interval = interval;
        }
        if let Some(timeout) = poller.inactivity_timeout {
            self.poller.inactivity_timeout = timeout;
        }
        self
    }

    /// Apply command line flags on top of everything else
    pub fn merge_cli(mut self, cli: &CliOverrides) -> Self {
        if let Some(ip) = cli.ip_address {
            self.ip_address = ip;
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(dir) = &cli.directory {
            self.directory = dir.clone();
        }
        if cli.read_only {
            self.read_only = true;
        }
        if cli.max_blksize.is_some() {
            self.opt_local.max_blksize = cli.max_blksize;
        }
        if let Some(timeout) = cli.timeout {
            self.opt_local.timeout = timeout;
        }
        self
    }

    /// Set the per-ACK timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.opt_local.timeout = timeout;
        self
    }

    /// Set the block size ceiling instead of probing it at startup
    pub fn with_max_blksize(mut self, max_blksize: u16) -> Self {
        self.opt_local.max_blksize = Some(max_blksize);
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.directory.is_dir() {
            bail!("Root directory does not exist: {}", self.directory.display());
        }
        let block_range = MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE;
        if let Some(max) = self.opt_local.max_blksize
            && !block_range.contains(&max)
        {
            bail!("max_blksize {} outside {:?}", max, block_range);
        }
        if self.opt_local.retries == 0 || self.opt_local.oack_retries == 0 {
            bail!("retries must be at least 1");
        }
        if self.opt_local.timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        if self.max_transfers == 0 {
            bail!("max_transfers must be at least 1");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let tftp = TftpSection {
            port: Some(6969),
            timeout: Some(Duration::from_secs(2)),
            max_blksize: Some(1024),
            ..Default::default()
        };
        let cli = CliOverrides {
            port: Some(1069),
            read_only: true,
            ..Default::default()
        };

        let config = Config::with_defaults()
            .merge_file(&tftp, &PollerSection::default())
            .merge_cli(&cli);

        assert_eq!(config.port, 1069);
        assert!(config.read_only);
        assert_eq!(config.opt_local.timeout, Duration::from_secs(2));
        assert_eq!(config.opt_local.max_blksize, Some(1024));
        assert_eq!(config.ip_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(
            "127.0.0.1".parse().unwrap(),
            0,
            dir.path().to_path_buf(),
            false,
        );
        assert!(config.validate().is_ok());

        assert!(config.clone().with_max_blksize(4).validate().is_err());
        assert!(config.clone().with_timeout(Duration::ZERO).validate().is_err());

        let mut missing = config.clone();
        missing.directory = dir.path().join("nope");
        assert!(missing.validate().is_err());
    }
}
