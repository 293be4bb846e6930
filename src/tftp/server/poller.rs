//! Periodic status polling
//!
//! Runs beside the engine and turns state changes into notifications, so the
//! transfer path never has to push updates itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local};
use log::Level;
use tokio::task::JoinHandle;

use super::events::{Event, EventBus};
use super::server::ShutdownHandle;
use super::state::ServerState;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between ticks
    pub interval: Duration,
    /// Silence after which a client is considered gone
    pub inactivity_timeout: Duration,
    /// Pause after a failed tick
    pub error_delay: Duration,
    /// Pause once failures exceed `max_consecutive_errors`
    pub backoff_delay: Duration,
    pub max_consecutive_errors: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            inactivity_timeout: Duration::from_secs(300),
            error_delay: Duration::from_secs(1),
            backoff_delay: Duration::from_secs(5),
            max_consecutive_errors: 5,
        }
    }
}

pub struct StatusPoller {
    state: Arc<ServerState>,
    events: EventBus,
    shutdown: ShutdownHandle,
    config: PollerConfig,
    consecutive_errors: u32,
}

impl StatusPoller {
    pub fn new(
        state: Arc<ServerState>,
        events: EventBus,
        shutdown: ShutdownHandle,
        config: PollerConfig,
    ) -> Self {
        Self {
            state,
            events,
            shutdown,
            config,
            consecutive_errors: 0,
        }
    }

    /// One polling pass as of `now`
    ///
    /// Emits `ClientDisconnected` for clients that went inactive during this
    /// pass and `TransferUpdated` for every unfinished transfer.
    pub fn tick(&mut self, now: DateTime<Local>) -> Result<()> {
        let expired = self
            .state
            .expire_inactive_clients(now, self.config.inactivity_timeout)?;
        for client_id in expired {
            self.events
                .log(Level::Info, format!("Client {} disconnected (inactive)", client_id));
            self.events.emit(Event::ClientDisconnected { client_id });
        }

        let status = self.state.snapshot()?;
        for (client_id, transfer) in status.transfers {
            if !transfer.completed {
                self.events.emit(Event::TransferUpdated {
                    client_id,
                    transfer,
                });
            }
        }
        Ok(())
    }

    /// Delay before the next tick given how the last one went
    fn next_delay(&mut self, result: &Result<()>) -> Duration {
        match result {
            Ok(()) => {
                self.consecutive_errors = 0;
                self.config.interval
            }
            Err(e) => {
                self.consecutive_errors += 1;
                log::error!("Error in TFTP status poller: {:#}", e);
                if self.consecutive_errors > self.config.max_consecutive_errors {
                    log::error!(
                        "Too many consecutive errors in TFTP status poller, pausing for longer"
                    );
                    self.config.backoff_delay
                } else {
                    self.config.error_delay
                }
            }
        }
    }

    pub async fn run(mut self) {
        log::debug!("TFTP status poller started");
        while self.shutdown.is_running() {
            let result = self.tick(Local::now());
            let delay = self.next_delay(&result);
            tokio::time::sleep(delay).await;
        }
        log::debug!("TFTP status poller stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::PathBuf;

    use anyhow::anyhow;

    use super::*;
    use crate::tftp::core::Direction;
    use crate::tftp::server::state::client_id;

    fn poller() -> (StatusPoller, Arc<ServerState>, EventBus) {
        let state = Arc::new(ServerState::new(PathBuf::from("/srv/tftp"), 512));
        let events = EventBus::new();
        let poller = StatusPoller::new(
            state.clone(),
            events.clone(),
            ShutdownHandle::new(),
            PollerConfig::default(),
        );
        (poller, state, events)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn disconnect_is_reported_once_per_transition() {
        let (mut poller, state, events) = poller();
        let mut rx = events.subscribe();
        let addr: SocketAddr = "10.1.1.5:4000".parse().unwrap();
        state.touch_client(&addr).unwrap();

        let later = Local::now() + chrono::Duration::seconds(301);
        poller.tick(later).unwrap();
        poller.tick(later).unwrap();

        let disconnects = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, Event::ClientDisconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
        assert!(!state.snapshot().unwrap().clients["10.1.1.5:4000"].active);
    }

    #[test]
    fn recent_clients_stay_active() {
        let (mut poller, state, events) = poller();
        let mut rx = events.subscribe();
        state.touch_client(&"10.1.1.5:4000".parse().unwrap()).unwrap();

        poller.tick(Local::now() + chrono::Duration::seconds(299)).unwrap();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(state.snapshot().unwrap().active_clients, 1);
    }

    #[test]
    fn updates_only_unfinished_transfers() {
        let (mut poller, state, events) = poller();
        let mut rx = events.subscribe();
        let running: SocketAddr = "10.1.1.5:4000".parse().unwrap();
        let done: SocketAddr = "10.1.1.6:4000".parse().unwrap();

        state
            .begin_transfer(&client_id(&running), "ios.bin", Direction::Download, 10, 512)
            .unwrap();
        let finished = state
            .begin_transfer(&client_id(&done), "sw.cfg", Direction::Upload, 10, 512)
            .unwrap();
        state
            .finish_transfer(
                &client_id(&done),
                finished.id,
                Direction::Upload,
                crate::tftp::server::state::Outcome::Success(10),
            )
            .unwrap();

        poller.tick(Local::now()).unwrap();
        poller.tick(Local::now()).unwrap();

        let updated: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::TransferUpdated { client_id, .. } => Some(client_id),
                _ => None,
            })
            .collect();
        assert_eq!(updated, vec!["10.1.1.5:4000".to_string(); 2]);
    }

    #[test]
    fn backs_off_after_repeated_errors() {
        let (mut poller, _, _) = poller();
        let config = PollerConfig::default();

        for _ in 0..config.max_consecutive_errors {
            assert_eq!(poller.next_delay(&Err(anyhow!("boom"))), config.error_delay);
        }
        assert_eq!(poller.next_delay(&Err(anyhow!("boom"))), config.backoff_delay);
        assert_eq!(poller.next_delay(&Ok(())), config.interval);
        assert_eq!(poller.next_delay(&Err(anyhow!("boom"))), config.error_delay);
    }
}
