use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use log::Level;
use tokio::net::UdpSocket;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::{sleep, timeout};

use super::config::Config;
use super::events::{Event, EventBus};
use super::poller::{PollerConfig, StatusPoller};
use super::state::{ServerState, Status, client_id};
use super::worker::{Context, Worker};
use crate::tftp::core::options::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::tftp::core::{
    Direction, ErrorCode, MAX_PACKET_SIZE, Packet, PacketError, Request, probe_max_blksize,
};

/// Bound on each listener receive, so a stop request is noticed promptly
const LISTEN_POLL: Duration = Duration::from_millis(500);
/// Upper end of the startup block size probe
const PROBE_CEILING: u16 = 8192;

/// Process-wide stop flag shared by the listener, workers and the poller
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// TFTP server
///
/// Owns the listening socket and the shared state. Each accepted request runs
/// as a separate task on its own socket.
///
/// # Example
///
/// ```rust,no_run
/// use netopskit::tftp::server::{Config, Server};
/// use std::path::PathBuf;
///
/// # async fn start() -> anyhow::Result<()> {
/// let config = Config::new("0.0.0.0".parse()?, 69, PathBuf::from("/srv/tftp"), false);
/// let server = Server::new(&config).await?;
/// server.listen().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    socket: UdpSocket,
    local_addr: SocketAddr,
    ctx: Arc<Context>,
    limiter: Arc<Semaphore>,
    read_only: bool,
    poller: PollerConfig,
}

impl Server {
    /// Bind the listening socket and resolve the block size ceiling
    pub async fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let root = config.directory.canonicalize().with_context(|| {
            format!("Failed to resolve root directory {}", config.directory.display())
        })?;

        let max_blksize = match config.opt_local.max_blksize {
            Some(max) => max.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE),
            None => tokio::task::spawn_blocking(|| probe_max_blksize(PROBE_CEILING))
                .await
                .context("Block size probe panicked")?,
        };

        let addr = SocketAddr::new(config.ip_address, config.port);
        let socket = bind_with_retry(addr, config.bind_attempts).await?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;

        log::info!("TFTP server bound to {}", local_addr);
        log::info!("Root directory: {}", root.display());
        log::info!("Read-only mode: {}", config.read_only);
        log::info!(
            "Block size: default {}, negotiable up to {}",
            DEFAULT_BLOCK_SIZE,
            max_blksize
        );
        log::info!(
            "Timeout: {:?}, retries: {}",
            config.opt_local.timeout,
            config.opt_local.retries
        );

        let state = Arc::new(ServerState::new(root.clone(), DEFAULT_BLOCK_SIZE));
        let ctx = Arc::new(Context {
            state,
            events: EventBus::new(),
            shutdown: ShutdownHandle::new(),
            local: config.opt_local.clone(),
            max_blksize,
            local_ip: config.ip_address,
            root,
        });

        Ok(Self {
            socket,
            local_addr,
            ctx,
            limiter: Arc::new(Semaphore::new(config.max_transfers)),
            read_only: config.read_only,
            poller: config.poller.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block size ceiling applied to `blksize` negotiation
    pub fn max_blksize(&self) -> u16 {
        self.ctx.max_blksize
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ctx.events.subscribe()
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.ctx.state.clone()
    }

    /// Lock-protected copy of clients, transfers and statistics
    pub fn status(&self) -> Result<Status> {
        self.ctx.state.snapshot()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.ctx.shutdown.clone()
    }

    /// Ask the listener, workers and poller to wind down
    pub fn stop(&self) {
        log::info!("Stopping server...");
        self.ctx.shutdown.stop();
    }

    /// Status poller wired to this server's state and events
    pub fn poller(&self) -> StatusPoller {
        StatusPoller::new(
            self.ctx.state.clone(),
            self.ctx.events.clone(),
            self.ctx.shutdown.clone(),
            self.poller.clone(),
        )
    }

    /// Receive and dispatch requests until [`Server::stop`] is called
    pub async fn listen(&self) -> Result<()> {
        let shutdown = &self.ctx.shutdown;
        self.ctx.state.set_running(true, Some(self.local_addr))?;
        self.ctx
            .events
            .log(Level::Info, format!("Server started on {}", self.local_addr));

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while shutdown.is_running() {
            let (len, peer) = match timeout(LISTEN_POLL, self.socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    if e.kind() != io::ErrorKind::ConnectionReset {
                        log::error!("Socket receive error: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                    continue;
                }
            };
            if !shutdown.is_running() {
                break;
            }
            self.handle_datagram(&buf[..len], peer).await;
        }

        self.ctx.state.set_running(false, None)?;
        self.ctx.events.log(Level::Info, "Server stopped");
        Ok(())
    }

    async fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) {
        let packet = match Packet::deserialize(datagram) {
            // Only requests may open a conversation on this port
            Ok(Packet::Oack(_)) => Err(PacketError::UnknownOpcode(6)),
            other => other,
        };

        if let Err(e @ (PacketError::TooShort | PacketError::UnknownOpcode(_))) = &packet {
            log::warn!("{} from {}", e, peer);
            self.reply_error(peer, ErrorCode::IllegalOperation, &e.to_string())
                .await;
            return;
        }

        self.register_client(peer);

        match packet {
            Err(e) => {
                log::warn!("Error parsing request from {}: {}", peer, e);
                self.reply_error(peer, ErrorCode::IllegalOperation, &e.to_string())
                    .await;
            }
            Ok(packet @ (Packet::Rrq { .. } | Packet::Wrq { .. })) => {
                self.dispatch(packet, peer).await;
            }
            Ok(other) => {
                log::debug!("Ignoring {:?} from {} on the listening port", other.opcode(), peer);
            }
        }
    }

    fn register_client(&self, peer: SocketAddr) {
        match self.ctx.state.touch_client(&peer) {
            Ok(Some(client)) => {
                let id = client_id(&peer);
                self.ctx
                    .events
                    .log(Level::Info, format!("New client connected: {}", id));
                self.ctx.events.emit(Event::ClientConnected {
                    client_id: id,
                    client,
                });
            }
            Ok(None) => {}
            Err(e) => log::error!("Failed to record client {}: {:#}", peer, e),
        }
    }

    async fn dispatch(&self, packet: Packet, peer: SocketAddr) {
        let request = match Request::from_packet(packet, &self.ctx.root) {
            Ok(request) => request,
            Err(e) => {
                self.ctx
                    .events
                    .log(Level::Warn, format!("Rejecting request from {}: {}", peer, e));
                let code = e.to_error_code();
                self.reply_error(peer, code, code.default_message()).await;
                return;
            }
        };

        if request.direction == Direction::Upload && self.read_only {
            self.ctx.events.log(
                Level::Warn,
                format!("Rejecting write of {} from {}: read-only mode", request.filename, peer),
            );
            self.reply_error(peer, ErrorCode::AccessViolation, "Server is read-only")
                .await;
            return;
        }

        let Ok(permit) = self.limiter.clone().try_acquire_owned() else {
            self.ctx.events.log(
                Level::Warn,
                format!("Too many concurrent transfers, refusing {}", peer),
            );
            self.reply_error(peer, ErrorCode::NotDefined, "Server busy, try again later")
                .await;
            return;
        };

        self.ctx.events.log(
            Level::Info,
            format!(
                "Received {} request from {} for file: {} (mode {})",
                match request.direction {
                    Direction::Download => "READ",
                    Direction::Upload => "WRITE",
                },
                client_id(&peer),
                request.filename,
                request.mode.as_str()
            ),
        );

        tokio::spawn(Worker::run(self.ctx.clone(), peer, request, permit));
    }

    async fn reply_error(&self, peer: SocketAddr, code: ErrorCode, msg: &str) {
        let packet = Packet::error_msg(code, msg);
        if let Err(e) = self.socket.send_to(&packet.serialize(), peer).await {
            log::error!("Failed to send error to {}: {}", peer, e);
        }
    }
}

async fn bind_with_retry(addr: SocketAddr, attempts: u32) -> Result<UdpSocket> {
    let mut attempt = 1;
    loop {
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < attempts => {
                let wait = Duration::from_secs(2 * attempt as u64);
                log::warn!(
                    "Port {} is busy, waiting {:?} (attempt {}/{})",
                    addr.port(),
                    wait,
                    attempt,
                    attempts
                );
                sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to bind TFTP socket on {}", addr));
            }
        }
    }
}
