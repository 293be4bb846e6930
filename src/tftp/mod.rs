//! TFTP (Trivial File Transfer Protocol) implementation
//!
//! This module implements the TFTP server used to move firmware images and
//! device configurations, based on the following RFC standards:
//! - [RFC 1350](https://www.rfc-editor.org/rfc/rfc1350) TFTP Protocol version 2
//! - [RFC 2347](https://www.rfc-editor.org/rfc/rfc2347) TFTP Option Extension
//! - [RFC 2348](https://www.rfc-editor.org/rfc/rfc2348) Blocksize Option
//! - [RFC 2349](https://www.rfc-editor.org/rfc/rfc2349) Timeout and Transfer Size Options
//!
//! ## Module Structure
//!
//! ```text
//! tftp/
//! ├── core/           # Core protocol implementation
//! │   ├── packet      # Packet serialization/deserialization
//! │   ├── options     # Protocol options and negotiation
//! │   ├── request     # Request validation, path confinement
//! │   └── socket      # Transfer sockets, datagram limits
//! │
//! └── server/         # TFTP server
//!     ├── server      # Request listener
//!     ├── worker      # Per-transfer tasks
//!     ├── state       # Clients, transfers, statistics
//!     ├── poller      # Status polling
//!     ├── events      # Notifications
//!     └── config      # Server configuration
//! ```
//!
//! ## Usage Examples
//!
//! ### Start TFTP Server
//!
//! ```rust,no_run
//! use netopskit::tftp::server::{Config, Server};
//! use std::path::PathBuf;
//!
//! # async fn start() -> anyhow::Result<()> {
//! let config = Config::with_defaults().merge_cli(&netopskit::tftp::server::CliOverrides {
//!     port: Some(6969),
//!     directory: Some(PathBuf::from("/var/tftp")),
//!     ..Default::default()
//! });
//!
//! let server = Server::new(&config).await?;
//! let poller = server.poller().spawn();
//! server.listen().await?;
//! poller.await?;
//! # Ok(())
//! # }
//! ```

// Submodules
pub mod core;
pub mod server;
