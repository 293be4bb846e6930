//! NetOpsKit
//!
//! Tooling for network administrators. This crate provides the embedded TFTP
//! server used to push firmware and configurations to network devices.

pub mod config;
pub mod tftp;
