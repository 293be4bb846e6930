//! Per-transfer workers
//!
//! Each accepted RRQ/WRQ runs as its own task with its own socket. Blocks move
//! in lock-step: block N+1 is never sent (or acknowledged) before block N has
//! been acknowledged (or received).

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::Level;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use super::events::{Event, EventBus};
use super::server::ShutdownHandle;
use super::state::{Outcome, ServerState, TransferRecord, client_id};
use crate::tftp::core::{
    Direction, ErrorCode, OptionsPrivate, OptionsProtocol, Packet, Received, Request, RequestType,
    Socket, TransferOption, is_message_too_long,
};

/// Everything a worker shares with the listener
pub(crate) struct Context {
    pub state: Arc<ServerState>,
    pub events: EventBus,
    pub shutdown: ShutdownHandle,
    pub local: OptionsPrivate,
    pub max_blksize: u16,
    pub local_ip: IpAddr,
    /// Canonical root directory
    pub root: PathBuf,
}

/// Number of DATA packets needed for `size` bytes in blocks of `block_size`
///
/// A file that is an exact multiple of the block size (including an empty
/// file) ends with a zero-length block.
pub fn block_count(size: u64, block_size: u16) -> u64 {
    size / block_size as u64 + 1
}

/// Why a transfer stopped early
#[derive(Debug)]
enum Failure {
    /// Retry budget spent waiting for the named packet
    Timeout(String),
    /// The client sent an ERROR
    Peer { code: u16, msg: String },
    /// Datagram larger than the platform accepts
    MessageTooLong(io::Error),
    Io(io::Error),
    Cancelled,
    Protocol(String),
}

impl Failure {
    /// ERROR packet to send back, if any
    fn reply(&self) -> Option<Packet> {
        match self {
            Failure::Peer { .. } => None,
            Failure::Protocol(msg) => {
                Some(Packet::error_msg(ErrorCode::IllegalOperation, msg.clone()))
            }
            other => Some(Packet::error_msg(ErrorCode::NotDefined, other.to_string())),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Timeout(what) => write!(f, "Transfer timed out waiting for {}", what),
            Failure::Peer { code, msg } => write!(f, "Client error {}: {}", code, msg),
            Failure::MessageTooLong(e) => {
                write!(f, "Datagram exceeds platform buffer limit: {}", e)
            }
            Failure::Io(e) => write!(f, "I/O error: {}", e),
            Failure::Cancelled => write!(f, "Server shutting down"),
            Failure::Protocol(msg) => write!(f, "{}", msg),
        }
    }
}

/// How a reply to a transmitted packet is handled
enum Reply<T> {
    Done(T),
    /// Keep waiting on the same deadline without retransmitting
    Ignore,
    Fail(Failure),
}

/// A single file transfer with one client
pub struct Worker {
    ctx: Arc<Context>,
    socket: Socket,
    client_id: String,
    request: Request,
    _permit: OwnedSemaphorePermit,
}

impl Worker {
    /// Run the transfer for `request` to completion
    pub(crate) async fn run(
        ctx: Arc<Context>,
        peer: SocketAddr,
        request: Request,
        permit: OwnedSemaphorePermit,
    ) {
        let socket = match Socket::bind(ctx.local_ip, peer).await {
            Ok(socket) => socket,
            Err(e) => {
                ctx.events.log(
                    Level::Error,
                    format!("Failed to create transfer socket for {}: {}", peer, e),
                );
                return;
            }
        };

        let worker = Worker {
            client_id: client_id(&peer),
            ctx,
            socket,
            request,
            _permit: permit,
        };

        match worker.request.direction {
            Direction::Download => worker.send_file().await,
            Direction::Upload => worker.receive_file().await,
        }
    }

    /// RRQ: stream the file to the client
    async fn send_file(self) {
        let (mut file, file_size) = match self.open_source().await {
            Ok(opened) => opened,
            Err(reply) => return self.reject(reply).await,
        };

        let mut options = self.request.options.clone();
        let mut negotiated = OptionsProtocol::parse(
            &mut options,
            RequestType::Read(file_size),
            &self.ctx.local,
            self.ctx.max_blksize,
        );

        let Some(record) = self.begin(file_size, negotiated.block_size).await else {
            return;
        };

        let result = self
            .download(&mut file, &options, &mut negotiated, &record)
            .await;
        self.finish(&record, result).await;
    }

    async fn download(
        &self,
        file: &mut File,
        options: &[TransferOption],
        negotiated: &mut OptionsProtocol,
        record: &TransferRecord,
    ) -> Result<u64, Failure> {
        if !options.is_empty() {
            self.negotiate_read(options, negotiated, record).await?;
        }
        log::debug!(
            "Sending {} in {} blocks of {} bytes",
            self.request.filename,
            block_count(record.file_size, negotiated.block_size),
            negotiated.block_size
        );
        self.send_blocks(file, negotiated, record).await
    }

    /// WRQ: receive the file from the client
    async fn receive_file(self) {
        let (file, staged) = match self.create_target().await {
            Ok(created) => created,
            Err(reply) => return self.reject(reply).await,
        };

        let mut options = self.request.options.clone();
        let negotiated = OptionsProtocol::parse(
            &mut options,
            RequestType::Write,
            &self.ctx.local,
            self.ctx.max_blksize,
        );

        let Some(record) = self
            .begin(negotiated.transfer_size.unwrap_or(0), negotiated.block_size)
            .await
        else {
            drop(file);
            remove_partial(&staged).await;
            return;
        };

        let result = self
            .receive_blocks(file, &staged, options, negotiated, &record)
            .await;
        if result.is_err() {
            remove_partial(&staged).await;
        }

        self.finish(&record, result).await;
    }

    /// Open the requested file, or the ERROR packet explaining why not
    async fn open_source(&self) -> Result<(File, u64), Packet> {
        let path = &self.request.path;

        let canonical = tokio::fs::canonicalize(path).await.map_err(io_reply)?;
        if !canonical.starts_with(&self.ctx.root) {
            log::warn!("{} resolves outside the root directory", path.display());
            return Err(Packet::error(ErrorCode::AccessViolation));
        }

        let file = File::open(&canonical).await.map_err(io_reply)?;
        let metadata = file.metadata().await.map_err(io_reply)?;
        if !metadata.is_file() {
            return Err(Packet::error(ErrorCode::FileNotFound));
        }
        Ok((file, metadata.len()))
    }

    /// Stage an upload inside the root directory
    ///
    /// Data goes to a hidden file next to the target, which replaces the
    /// target only once the upload completes.
    async fn create_target(&self) -> Result<(File, Staged), Packet> {
        let path = &self.request.path;

        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(Packet::error(ErrorCode::AccessViolation));
        };
        let parent = tokio::fs::canonicalize(parent).await.map_err(io_reply)?;
        if !parent.starts_with(&self.ctx.root) {
            log::warn!("{} resolves outside the root directory", path.display());
            return Err(Packet::error(ErrorCode::AccessViolation));
        }

        let target = parent.join(name);
        match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                log::warn!("Refusing to write through symlink {}", target.display());
                return Err(Packet::error(ErrorCode::AccessViolation));
            }
            Ok(meta) if meta.is_dir() => return Err(Packet::error(ErrorCode::AccessViolation)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_reply(e)),
        }

        let port = self.socket.local_addr().map(|a| a.port()).unwrap_or_default();
        let temp = parent.join(format!(".{}.{}.part", name.to_string_lossy(), port));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await
            .map_err(io_reply)?;

        Ok((file, Staged { temp, target }))
    }

    /// Refuse the request before any transfer state exists
    async fn reject(&self, reply: Packet) {
        if let Packet::Error { code, msg } = &reply {
            self.ctx.events.log(
                Level::Warn,
                format!(
                    "Refusing {} of {} for {}: {} ({})",
                    self.request.direction, self.request.filename, self.client_id, msg, code
                ),
            );
        }
        if let Err(e) = self.socket.send(&reply).await {
            log::error!("Failed to send error to {}: {}", self.client_id, e);
        }
    }

    async fn begin(&self, file_size: u64, block_size: u16) -> Option<TransferRecord> {
        match self.ctx.state.begin_transfer(
            &self.client_id,
            &self.request.filename,
            self.request.direction,
            file_size,
            block_size,
        ) {
            Ok(record) => {
                self.ctx.events.log(
                    Level::Info,
                    format!(
                        "Starting {} of {} ({} bytes) with {} from port {}",
                        self.request.direction,
                        self.request.filename,
                        file_size,
                        self.client_id,
                        self.socket
                            .local_addr()
                            .map(|a| a.port().to_string())
                            .unwrap_or_else(|_| "?".to_string()),
                    ),
                );
                self.ctx.events.emit(Event::TransferStarted {
                    client_id: self.client_id.clone(),
                    transfer: record.clone(),
                });
                Some(record)
            }
            Err(e) => {
                log::error!("Failed to register transfer for {}: {:#}", self.client_id, e);
                self.reject(Packet::error_msg(ErrorCode::NotDefined, "Internal server error"))
                    .await;
                None
            }
        }
    }

    async fn finish(&self, record: &TransferRecord, result: Result<u64, Failure>) {
        let (outcome, success) = match result {
            Ok(bytes) => {
                self.ctx.events.log(
                    Level::Info,
                    format!(
                        "Transfer completed for {}: {} ({} bytes)",
                        self.client_id, self.request.filename, bytes
                    ),
                );
                (Outcome::Success(bytes), true)
            }
            Err(failure) => {
                if let Some(reply) = failure.reply()
                    && let Err(e) = self.socket.send(&reply).await
                {
                    log::warn!("Failed to send error to {}: {}", self.client_id, e);
                }
                self.ctx.events.log(
                    Level::Error,
                    format!(
                        "Transfer failed for {}: {}: {}",
                        self.client_id, self.request.filename, failure
                    ),
                );
                (Outcome::Failure(failure.to_string()), false)
            }
        };

        if let Err(e) = self.ctx.state.finish_transfer(
            &self.client_id,
            record.id,
            self.request.direction,
            outcome,
        ) {
            log::error!("Failed to record transfer result: {:#}", e);
        }
        self.ctx.events.emit(Event::TransferCompleted {
            client_id: self.client_id.clone(),
            success,
        });
    }

    /// OACK handshake for a read request
    ///
    /// A client that answers the OACK with an ERROR gets a plain RFC 1350
    /// transfer instead.
    async fn negotiate_read(
        &self,
        options: &[TransferOption],
        negotiated: &mut OptionsProtocol,
        record: &TransferRecord,
    ) -> Result<(), Failure> {
        let oack = Packet::Oack(options.to_vec());
        log::info!("Sending OACK to {} with options: {:?}", self.client_id, options);

        let accepted = self
            .exchange(
                &oack,
                self.ctx.local.oack_retries,
                negotiated.timeout,
                "OACK acknowledgment",
                |reply| match reply {
                    Packet::Ack(0) => Reply::Done(true),
                    Packet::Ack(_) => Reply::Ignore,
                    Packet::Error { code, msg } => {
                        log::warn!("Client rejected options with error {}: {}", code, msg);
                        Reply::Done(false)
                    }
                    other => Reply::Fail(unexpected(&other)),
                },
            )
            .await?;

        if !accepted {
            self.fall_back(negotiated, record);
        }
        Ok(())
    }

    fn fall_back(&self, negotiated: &mut OptionsProtocol, record: &TransferRecord) {
        self.ctx.events.log(
            Level::Info,
            format!("Falling back to standard TFTP (no options) for {}", self.client_id),
        );
        *negotiated = OptionsProtocol::unnegotiated(&self.ctx.local);
        if let Err(e) = self.ctx.state.set_negotiated(
            &self.client_id,
            record.id,
            negotiated.block_size,
            record.file_size,
        ) {
            log::error!("Failed to record negotiated options: {:#}", e);
        }
    }

    async fn send_blocks(
        &self,
        file: &mut File,
        negotiated: &OptionsProtocol,
        record: &TransferRecord,
    ) -> Result<u64, Failure> {
        let block_size = negotiated.block_size as usize;
        let mut buf = vec![0u8; block_size];
        let mut block_num: u16 = 1;
        let mut sent: u64 = 0;
        let started = Instant::now();

        loop {
            let len = read_block(file, &mut buf).await.map_err(Failure::Io)?;
            let packet = Packet::Data {
                block_num,
                data: buf[..len].to_vec(),
            };

            self.exchange(
                &packet,
                self.ctx.local.retries,
                negotiated.timeout,
                &format!("ACK of block {}", block_num),
                |reply| match reply {
                    Packet::Ack(n) if n == block_num => Reply::Done(()),
                    // Duplicate of an earlier ACK
                    Packet::Ack(_) => Reply::Ignore,
                    Packet::Error { code, msg } => Reply::Fail(Failure::Peer { code, msg }),
                    other => Reply::Fail(unexpected(&other)),
                },
            )
            .await?;

            sent += len as u64;
            self.progress(record, sent, started.elapsed());

            if len < block_size {
                return Ok(sent);
            }
            block_num = block_num.wrapping_add(1);
        }
    }

    async fn receive_blocks(
        &self,
        mut file: File,
        staged: &Staged,
        options: Vec<TransferOption>,
        mut negotiated: OptionsProtocol,
        record: &TransferRecord,
    ) -> Result<u64, Failure> {
        let mut reply = if options.is_empty() {
            Packet::Ack(0)
        } else {
            log::info!("Sending OACK to {} with options: {:?}", self.client_id, options);
            Packet::Oack(options)
        };
        let mut expected: u16 = 1;
        let mut received: u64 = 0;
        let started = Instant::now();

        loop {
            let awaiting_oack = matches!(reply, Packet::Oack(_));
            let attempts = if awaiting_oack {
                self.ctx.local.oack_retries
            } else {
                self.ctx.local.retries
            };

            let data = self
                .exchange(
                    &reply,
                    attempts,
                    negotiated.timeout,
                    &format!("block {}", expected),
                    |packet| match packet {
                        Packet::Data { block_num, data } if block_num == expected => {
                            Reply::Done(Some(data))
                        }
                        // Retransmission of a block we already hold
                        Packet::Data { .. } => Reply::Ignore,
                        Packet::Error { code, msg } if awaiting_oack => {
                            log::warn!("Client rejected options with error {}: {}", code, msg);
                            Reply::Done(None)
                        }
                        Packet::Error { code, msg } => Reply::Fail(Failure::Peer { code, msg }),
                        other => Reply::Fail(unexpected(&other)),
                    },
                )
                .await?;

            let Some(data) = data else {
                self.fall_back(&mut negotiated, record);
                reply = Packet::Ack(0);
                continue;
            };

            let block_size = negotiated.block_size as usize;
            if data.len() > block_size {
                return Err(Failure::Protocol(format!(
                    "DATA block of {} bytes exceeds block size {}",
                    data.len(),
                    block_size
                )));
            }

            file.write_all(&data).await.map_err(Failure::Io)?;
            received += data.len() as u64;
            self.progress(record, received, started.elapsed());
            reply = Packet::Ack(expected);

            if data.len() < block_size {
                file.flush().await.map_err(Failure::Io)?;
                file.sync_all().await.map_err(Failure::Io)?;
                drop(file);
                tokio::fs::rename(&staged.temp, &staged.target)
                    .await
                    .map_err(Failure::Io)?;
                self.transmit(&reply).await?;
                return Ok(received);
            }
            expected = expected.wrapping_add(1);
        }
    }

    /// Send `packet` and wait for a reply `accept` recognizes
    ///
    /// The packet goes out at most `attempts` times; each transmission waits
    /// up to `timeout`. Replies `accept` ignores do not trigger a resend. A
    /// datagram from another address triggers an immediate resend that does
    /// not count against `attempts`.
    async fn exchange<T>(
        &self,
        packet: &Packet,
        attempts: u32,
        timeout: Duration,
        awaiting: &str,
        mut accept: impl FnMut(Packet) -> Reply<T>,
    ) -> Result<T, Failure> {
        for attempt in 1..=attempts {
            if !self.ctx.shutdown.is_running() {
                return Err(Failure::Cancelled);
            }
            if attempt > 1 {
                log::warn!(
                    "Timeout waiting for {} from {}, retry {}/{}",
                    awaiting,
                    self.client_id,
                    attempt - 1,
                    attempts - 1
                );
            }
            self.transmit(packet).await?;

            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.socket.recv(remaining).await.map_err(Failure::Io)? {
                    Received::Timeout => break,
                    // Resend on the same deadline; this does not use up an attempt
                    Received::Foreign(src) => {
                        log::warn!(
                            "Datagram from unexpected address {} (expected {}), resending",
                            src,
                            self.socket.peer()
                        );
                        self.transmit(packet).await?;
                    }
                    Received::Packet(reply) => match accept(reply) {
                        Reply::Done(value) => return Ok(value),
                        Reply::Ignore => continue,
                        Reply::Fail(failure) => return Err(failure),
                    },
                }
            }
        }

        Err(Failure::Timeout(awaiting.to_string()))
    }

    /// Send one packet; only an oversized datagram is fatal here
    async fn transmit(&self, packet: &Packet) -> Result<(), Failure> {
        match self.socket.send(packet).await {
            Ok(()) => Ok(()),
            Err(e) if is_message_too_long(&e) => Err(Failure::MessageTooLong(e)),
            Err(e) => {
                log::warn!("Send to {} failed: {}", self.socket.peer(), e);
                Ok(())
            }
        }
    }

    fn progress(&self, record: &TransferRecord, bytes: u64, elapsed: Duration) {
        if let Err(e) = self
            .ctx
            .state
            .update_progress(&self.client_id, record.id, bytes, elapsed)
        {
            log::error!("Failed to record progress: {:#}", e);
        }
    }
}

/// An upload in progress and where it lands on success
struct Staged {
    temp: PathBuf,
    target: PathBuf,
}

async fn remove_partial(staged: &Staged) {
    if let Err(e) = tokio::fs::remove_file(&staged.temp).await {
        log::warn!("Could not remove partial upload {}: {}", staged.temp.display(), e);
    }
}

fn unexpected(packet: &Packet) -> Failure {
    Failure::Protocol(format!("Unexpected {:?} packet during transfer", packet.opcode()))
}

fn io_reply(e: io::Error) -> Packet {
    match e.kind() {
        io::ErrorKind::NotFound => Packet::error(ErrorCode::FileNotFound),
        io::ErrorKind::PermissionDenied => Packet::error(ErrorCode::AccessViolation),
        _ => Packet::error_msg(ErrorCode::NotDefined, e.to_string()),
    }
}

/// Fill `buf` from `file`, short only at end of file
async fn read_block(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_includes_terminating_block() {
        assert_eq!(block_count(0, 512), 1);
        assert_eq!(block_count(511, 512), 1);
        assert_eq!(block_count(512, 512), 2);
        assert_eq!(block_count(513, 512), 2);
        assert_eq!(block_count(2500, 1024), 3);
        assert_eq!(block_count(2048, 1024), 3);
    }

    #[test]
    fn peer_errors_are_not_answered() {
        let failure = Failure::Peer {
            code: 0,
            msg: "cancelled".to_string(),
        };
        assert!(failure.reply().is_none());

        let failure = Failure::Timeout("ACK of block 7".to_string());
        assert_eq!(
            failure.reply(),
            Some(Packet::error_msg(
                ErrorCode::NotDefined,
                "Transfer timed out waiting for ACK of block 7"
            ))
        );

        let failure = Failure::Protocol("bad".to_string());
        assert_eq!(
            failure.reply(),
            Some(Packet::error_msg(ErrorCode::IllegalOperation, "bad"))
        );
    }

    #[tokio::test]
    async fn read_block_fills_until_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, vec![7u8; 1300]).unwrap();

        let mut file = File::open(&path).await.unwrap();
        let mut buf = vec![0u8; 512];
        let mut sizes = Vec::new();
        loop {
            let n = read_block(&mut file, &mut buf).await.unwrap();
            sizes.push(n);
            if n < buf.len() {
                break;
            }
        }
        assert_eq!(sizes, vec![512, 512, 276]);
    }
}
