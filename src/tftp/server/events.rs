//! Notifications for UI-facing consumers
//!
//! The engine and the status poller publish on a broadcast channel; slow or
//! absent subscribers never block the protocol path.

use log::Level;
use tokio::sync::broadcast;

use super::state::{ClientRecord, TransferRecord};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    ClientConnected {
        client_id: String,
        client: ClientRecord,
    },
    ClientDisconnected {
        client_id: String,
    },
    TransferStarted {
        client_id: String,
        transfer: TransferRecord,
    },
    TransferUpdated {
        client_id: String,
        transfer: TransferRecord,
    },
    TransferCompleted {
        client_id: String,
        success: bool,
    },
    Log {
        level: Level,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Log through the `log` facade and publish the same line
    pub fn log(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{}", message);
        self.emit(Event::Log { level, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.log(Level::Warn, "Client rejected options");

        match rx.try_recv().unwrap() {
            Event::Log { level, message } => {
                assert_eq!(level, Level::Warn);
                assert_eq!(message, "Client rejected options");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(Event::ClientDisconnected {
            client_id: "10.0.0.1:69".to_string(),
        });
    }
}
