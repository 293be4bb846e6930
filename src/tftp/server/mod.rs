//! TFTP server implementation
//!
//! This module provides complete TFTP server functionality:
//! - `server`: Request listener, dispatches client requests
//! - `worker`: Per-transfer tasks, handle file transfers
//! - `state`: Shared client, transfer and statistics bookkeeping
//! - `poller`: Periodic status polling and notifications
//! - `events`: Notification channel for UI consumers
//! - `config`: Server configuration

mod config;
mod events;
mod poller;
mod server;
mod state;
mod worker;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;

// Public server types
pub use config::{CliOverrides, Config};
pub use events::{Event, EventBus};
pub use poller::{PollerConfig, StatusPoller};
pub use server::{Server, ShutdownHandle};
pub use state::{
    ClientRecord, Outcome, ServerState, ServerStatistics, Status, TransferRecord, client_id,
    format_speed, format_uptime,
};
pub use worker::block_count;

/// Run the TFTP server until Ctrl+C
pub async fn run(config: Config) -> Result<()> {
    log::info!(
        "Starting TFTP server on {}:{}",
        config.ip_address,
        config.port
    );

    let server = Arc::new(Server::new(&config).await?);
    let events = server.subscribe();
    let poller = server.poller().spawn();

    let reporter = tokio::spawn(report_events(events));

    let listener = tokio::spawn({
        let server = server.clone();
        async move { server.listen().await }
    });

    log::info!("TFTP server listening, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    server.stop();

    listener.await??;
    poller.await?;
    reporter.abort();

    let stats = server.status()?.statistics;
    log::info!(
        "Uptime {}, transfers: {} total, {} ok, {} failed",
        format_uptime(stats.uptime),
        stats.total_transfers,
        stats.successful_transfers,
        stats.failed_transfers
    );
    log::info!(
        "{} bytes sent, {} bytes received, average {}",
        stats.bytes_downloaded,
        stats.bytes_uploaded,
        format_speed(stats.average_speed)
    );
    Ok(())
}

/// Log progress and completion events at debug level until the bus closes
///
/// Returns the number of events handled. Other messages are already logged
/// where they are raised.
async fn report_events(mut events: broadcast::Receiver<Event>) -> u64 {
    let mut handled = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("Status reporter skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return handled,
        };
        handled += 1;
        match event {
            Event::TransferUpdated {
                client_id,
                transfer,
            } => log::debug!(
                "{} {}: {}/{} bytes at {}",
                client_id,
                transfer.filename,
                transfer.progress,
                transfer.file_size,
                format_speed(transfer.speed)
            ),
            Event::TransferCompleted { client_id, success } => {
                log::debug!("Transfer for {} finished, success: {}", client_id, success)
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reporter_survives_a_lagging_burst() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        for i in 0..1100 {
            bus.emit(Event::TransferCompleted {
                client_id: format!("10.0.0.1:{}", i),
                success: true,
            });
        }
        drop(bus);

        let handled = report_events(rx).await;
        assert!(handled >= 1000, "handled only {} events", handled);
    }
}
