//! Shared bookkeeping for clients, transfers and statistics
//!
//! One mutex guards everything. It is held for a single read or update and
//! never across socket I/O; readers get copies.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Local};

use crate::tftp::core::Direction;

/// Key used for both maps: `ip:port` of the requesting client
pub fn client_id(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

/// One distinct client address seen by the listener
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub ip: IpAddr,
    pub port: u16,
    pub last_seen: DateTime<Local>,
    pub active: bool,
}

/// Bookkeeping for one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    /// Distinguishes a replaced transfer from its successor for the same client
    pub id: u64,
    pub filename: String,
    pub direction: Direction,
    /// Zero until known (file size on reads, tsize on writes)
    pub file_size: u64,
    pub start_time: DateTime<Local>,
    pub last_activity: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    /// Bytes acknowledged so far
    pub progress: u64,
    /// Bytes per second
    pub speed: f64,
    /// Estimated seconds left, -1 when unknown
    pub remaining_time: f64,
    pub block_size: u16,
    pub completed: bool,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct Statistics {
    total_transfers: u64,
    successful_transfers: u64,
    failed_transfers: u64,
    bytes_downloaded: u64,
    bytes_uploaded: u64,
    start_time: DateTime<Local>,
}

impl Statistics {
    fn new() -> Self {
        Self {
            total_transfers: 0,
            successful_transfers: 0,
            failed_transfers: 0,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            start_time: Local::now(),
        }
    }
}

/// Aggregate counters with derived rates
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatistics {
    pub total_transfers: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub start_time: DateTime<Local>,
    pub uptime: Duration,
    /// Total bytes moved divided by uptime
    pub average_speed: f64,
}

/// Consistent copy of the server state
#[derive(Debug, Clone)]
pub struct Status {
    pub running: bool,
    pub bind_address: Option<SocketAddr>,
    pub root_dir: PathBuf,
    pub block_size: u16,
    pub clients: HashMap<String, ClientRecord>,
    pub transfers: HashMap<String, TransferRecord>,
    pub active_clients: usize,
    pub active_transfers: usize,
    pub statistics: ServerStatistics,
}

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes actually moved
    Success(u64),
    Failure(String),
}

struct Inner {
    running: bool,
    bind_address: Option<SocketAddr>,
    clients: HashMap<String, ClientRecord>,
    transfers: HashMap<String, TransferRecord>,
    statistics: Statistics,
}

/// The store owned by one server instance
pub struct ServerState {
    root_dir: PathBuf,
    block_size: u16,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl ServerState {
    pub fn new(root_dir: PathBuf, block_size: u16) -> Self {
        Self {
            root_dir,
            block_size,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                running: false,
                bind_address: None,
                clients: HashMap::new(),
                transfers: HashMap::new(),
                statistics: Statistics::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("server state lock poisoned"))
    }

    pub(crate) fn set_running(
        &self,
        running: bool,
        bind_address: Option<SocketAddr>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        inner.running = running;
        if bind_address.is_some() {
            inner.bind_address = bind_address;
        }
        Ok(())
    }

    /// Create or refresh the record for `addr`
    ///
    /// Returns the record when it was newly created.
    pub fn touch_client(&self, addr: &SocketAddr) -> Result<Option<ClientRecord>> {
        let now = Local::now();
        let mut inner = self.lock()?;

        if let Some(client) = inner.clients.get_mut(&client_id(addr)) {
            client.last_seen = now;
            client.active = true;
            return Ok(None);
        }

        let record = ClientRecord {
            ip: addr.ip(),
            port: addr.port(),
            last_seen: now,
            active: true,
        };
        inner.clients.insert(client_id(addr), record.clone());
        Ok(Some(record))
    }

    /// Register a new transfer, replacing any previous record for the client
    pub fn begin_transfer(
        &self,
        client: &str,
        filename: &str,
        direction: Direction,
        file_size: u64,
        block_size: u16,
    ) -> Result<TransferRecord> {
        let now = Local::now();
        let record = TransferRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            filename: filename.to_string(),
            direction,
            file_size,
            start_time: now,
            last_activity: now,
            end_time: None,
            progress: 0,
            speed: 0.0,
            remaining_time: -1.0,
            block_size,
            completed: false,
            succeeded: false,
            error: None,
        };

        let mut inner = self.lock()?;
        if let Some(previous) = inner.transfers.get(client)
            && !previous.completed
        {
            log::warn!(
                "Abandoning unfinished transfer of {} for {}",
                previous.filename,
                client
            );
        }
        inner.transfers.insert(client.to_string(), record.clone());
        inner.statistics.total_transfers += 1;
        Ok(record)
    }

    /// Record the parameters that survived option negotiation
    pub fn set_negotiated(
        &self,
        client: &str,
        id: u64,
        block_size: u16,
        file_size: u64,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(record) = current(&mut inner.transfers, client, id) {
            record.block_size = block_size;
            record.file_size = file_size;
        }
        Ok(())
    }

    /// Record acknowledged bytes and refresh rate estimates
    pub fn update_progress(
        &self,
        client: &str,
        id: u64,
        progress: u64,
        elapsed: Duration,
    ) -> Result<()> {
        let now = Local::now();
        let mut inner = self.lock()?;

        if let Some(record) = current(&mut inner.transfers, client, id) {
            record.progress = progress;
            record.last_activity = now;
            let secs = elapsed.as_secs_f64();
            record.speed = if secs > 0.0 {
                progress as f64 / secs
            } else {
                0.0
            };
            record.remaining_time = if record.speed > 0.0 && record.file_size >= progress {
                (record.file_size - progress) as f64 / record.speed
            } else {
                -1.0
            };
        }
        if let Some(c) = inner.clients.get_mut(client) {
            c.last_seen = now;
            c.active = true;
        }
        Ok(())
    }

    /// Finalize a transfer and fold it into the statistics
    ///
    /// Statistics count every transfer; the record is only touched if it has
    /// not been replaced by a newer request from the same client.
    pub fn finish_transfer(
        &self,
        client: &str,
        id: u64,
        direction: Direction,
        outcome: Outcome,
    ) -> Result<()> {
        let now = Local::now();
        let mut inner = self.lock()?;

        if let Some(record) = current(&mut inner.transfers, client, id) {
            record.completed = true;
            record.end_time = Some(now);
            record.last_activity = now;
            match &outcome {
                Outcome::Success(_) => {
                    record.succeeded = true;
                    record.remaining_time = 0.0;
                }
                Outcome::Failure(reason) => record.error = Some(reason.clone()),
            }
        }

        let stats = &mut inner.statistics;
        match outcome {
            Outcome::Success(bytes) => {
                stats.successful_transfers += 1;
                match direction {
                    Direction::Upload => stats.bytes_uploaded += bytes,
                    Direction::Download => stats.bytes_downloaded += bytes,
                }
            }
            Outcome::Failure(_) => stats.failed_transfers += 1,
        }
        Ok(())
    }

    /// Mark clients idle for longer than `inactivity` as inactive
    ///
    /// Returns the ids that transitioned from active to inactive in this call.
    pub fn expire_inactive_clients(
        &self,
        now: DateTime<Local>,
        inactivity: Duration,
    ) -> Result<Vec<String>> {
        let limit = chrono::Duration::from_std(inactivity)?;
        let mut inner = self.lock()?;

        let mut expired = Vec::new();
        for (id, client) in inner.clients.iter_mut() {
            if client.active && now.signed_duration_since(client.last_seen) > limit {
                client.active = false;
                expired.push(id.clone());
            }
        }
        expired.sort();
        Ok(expired)
    }

    pub fn reset_statistics(&self) -> Result<()> {
        self.lock()?.statistics = Statistics::new();
        Ok(())
    }

    /// Copy out the full state
    pub fn snapshot(&self) -> Result<Status> {
        let now = Local::now();
        let inner = self.lock()?;

        let stats = &inner.statistics;
        let uptime = now
            .signed_duration_since(stats.start_time)
            .to_std()
            .unwrap_or_default();
        let total_bytes = stats.bytes_downloaded + stats.bytes_uploaded;
        let average_speed = if uptime.as_secs_f64() > 0.0 {
            total_bytes as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        Ok(Status {
            running: inner.running,
            bind_address: inner.bind_address,
            root_dir: self.root_dir.clone(),
            block_size: self.block_size,
            clients: inner.clients.clone(),
            transfers: inner.transfers.clone(),
            active_clients: inner.clients.values().filter(|c| c.active).count(),
            active_transfers: inner.transfers.values().filter(|t| !t.completed).count(),
            statistics: ServerStatistics {
                total_transfers: stats.total_transfers,
                successful_transfers: stats.successful_transfers,
                failed_transfers: stats.failed_transfers,
                bytes_downloaded: stats.bytes_downloaded,
                bytes_uploaded: stats.bytes_uploaded,
                start_time: stats.start_time,
                uptime,
                average_speed,
            },
        })
    }
}

fn current<'a>(
    transfers: &'a mut HashMap<String, TransferRecord>,
    client: &str,
    id: u64,
) -> Option<&'a mut TransferRecord> {
    transfers.get_mut(client).filter(|record| record.id == id)
}

/// `HH:MM:SS`, prefixed with the day count past 24 hours
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (days, rem) = (secs / 86400, secs % 86400);
    let (hours, rem) = (rem / 3600, rem % 3600);
    let (minutes, seconds) = (rem / 60, rem % 60);

    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < 1024.0 {
        format!("{:.1} B/s", bytes_per_sec)
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ServerState {
        ServerState::new(PathBuf::from("/srv/tftp"), 512)
    }

    fn addr() -> SocketAddr {
        "192.168.1.20:50123".parse().unwrap()
    }

    #[test]
    fn touch_client_creates_once() {
        let state = state();
        assert!(state.touch_client(&addr()).unwrap().is_some());
        assert!(state.touch_client(&addr()).unwrap().is_none());

        let status = state.snapshot().unwrap();
        assert_eq!(status.clients.len(), 1);
        assert_eq!(status.active_clients, 1);
        let client = &status.clients["192.168.1.20:50123"];
        assert_eq!(client.port, 50123);
        assert!(client.active);
    }

    #[test]
    fn progress_updates_speed_and_estimate() {
        let state = state();
        let id = client_id(&addr());
        let record = state
            .begin_transfer(&id, "firmware.bin", Direction::Download, 2000, 512)
            .unwrap();

        state
            .update_progress(&id, record.id, 1000, Duration::from_secs(2))
            .unwrap();

        let transfer = state.snapshot().unwrap().transfers[&id].clone();
        assert_eq!(transfer.progress, 1000);
        assert_eq!(transfer.speed, 500.0);
        assert_eq!(transfer.remaining_time, 2.0);
        assert!(!transfer.completed);
    }

    #[test]
    fn finishing_updates_statistics_by_direction() {
        let state = state();
        let id = client_id(&addr());

        let down = state
            .begin_transfer(&id, "a.bin", Direction::Download, 2500, 1024)
            .unwrap();
        state.finish_transfer(&id, down.id, Direction::Download, Outcome::Success(2500)).unwrap();

        let up = state
            .begin_transfer(&id, "b.cfg", Direction::Upload, 0, 512)
            .unwrap();
        state.finish_transfer(&id, up.id, Direction::Upload, Outcome::Success(300)).unwrap();

        let fail = state
            .begin_transfer(&id, "c.bin", Direction::Download, 10, 512)
            .unwrap();
        state
            .finish_transfer(
                &id,
                fail.id,
                Direction::Download,
                Outcome::Failure("timed out".into()),
            )
            .unwrap();

        let status = state.snapshot().unwrap();
        let stats = &status.statistics;
        assert_eq!(stats.total_transfers, 3);
        assert_eq!(stats.successful_transfers, 2);
        assert_eq!(stats.failed_transfers, 1);
        assert_eq!(stats.bytes_downloaded, 2500);
        assert_eq!(stats.bytes_uploaded, 300);

        let record = &status.transfers[&id];
        assert!(record.completed);
        assert!(!record.succeeded);
        assert_eq!(record.error.as_deref(), Some("timed out"));
        assert!(record.end_time.is_some());
    }

    #[test]
    fn replaced_transfer_does_not_touch_successor() {
        let state = state();
        let id = client_id(&addr());
        let old = state
            .begin_transfer(&id, "old.bin", Direction::Download, 100, 512)
            .unwrap();
        let new = state
            .begin_transfer(&id, "new.bin", Direction::Download, 100, 512)
            .unwrap();

        state.update_progress(&id, old.id, 50, Duration::from_secs(1)).unwrap();
        state
            .finish_transfer(&id, old.id, Direction::Download, Outcome::Failure("abandoned".into()))
            .unwrap();

        let status = state.snapshot().unwrap();
        let record = &status.transfers[&id];
        assert_eq!(record.id, new.id);
        assert_eq!(record.filename, "new.bin");
        assert_eq!(record.progress, 0);
        assert!(!record.completed);
        assert_eq!(status.active_transfers, 1);
        assert_eq!(status.statistics.failed_transfers, 1);
    }

    #[test]
    fn inactive_clients_expire_exactly_once() {
        let state = state();
        state.touch_client(&addr()).unwrap();
        let later = Local::now() + chrono::Duration::seconds(301);
        let timeout = Duration::from_secs(300);

        assert!(state.expire_inactive_clients(Local::now(), timeout).unwrap().is_empty());
        assert_eq!(
            state.expire_inactive_clients(later, timeout).unwrap(),
            vec!["192.168.1.20:50123".to_string()]
        );
        assert!(state.expire_inactive_clients(later, timeout).unwrap().is_empty());
        assert_eq!(state.snapshot().unwrap().active_clients, 0);

        // a new datagram revives the client
        state.touch_client(&addr()).unwrap();
        assert_eq!(state.snapshot().unwrap().active_clients, 1);
    }

    #[test]
    fn reset_clears_counters() {
        let state = state();
        let id = client_id(&addr());
        let record = state
            .begin_transfer(&id, "a.bin", Direction::Download, 1, 512)
            .unwrap();
        state.finish_transfer(&id, record.id, Direction::Download, Outcome::Success(1)).unwrap();

        state.reset_statistics().unwrap();
        let stats = state.snapshot().unwrap().statistics;
        assert_eq!(stats.total_transfers, 0);
        assert_eq!(stats.bytes_downloaded, 0);
    }

    #[test]
    fn formats_uptime_and_speed() {
        assert_eq!(format_uptime(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_uptime(Duration::from_secs(90061)), "1d 01:01:01");
        assert_eq!(format_speed(512.0), "512.0 B/s");
        assert_eq!(format_speed(1536.0), "1.5 KB/s");
        assert_eq!(format_speed(3.0 * 1024.0 * 1024.0), "3.0 MB/s");
    }
}
