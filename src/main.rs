use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use netopskit::config::AppConfig;
use netopskit::tftp;
use netopskit::tftp::server::{CliOverrides, Config};

#[derive(Parser)]
#[command(name = "netopskit", version, about = "Network operations toolkit")]
struct Cli {
    /// Configuration file (defaults to ./netopskit.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the TFTP server
    Tftp {
        /// IP address to listen on
        #[arg(short, long)]
        ip: Option<IpAddr>,

        /// UDP port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Root directory to serve
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Reject write requests
        #[arg(long)]
        read_only: bool,

        /// Largest block size to negotiate (probed when omitted)
        #[arg(long)]
        max_blksize: Option<u16>,

        /// Seconds to wait for each acknowledgment
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    let file = AppConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Tftp {
            ip,
            port,
            root,
            read_only,
            max_blksize,
            timeout,
        } => {
            let overrides = CliOverrides {
                ip_address: ip,
                port,
                directory: root,
                read_only,
                max_blksize,
                timeout: timeout.map(Duration::from_secs),
            };
            let config = Config::with_defaults()
                .merge_file(&file.tftp, &file.poller)
                .merge_cli(&overrides);

            tftp::server::run(config).await
        }
    }
}
