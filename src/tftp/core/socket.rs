//! Transfer sockets and platform datagram limits

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout};

use super::packet::{MAX_PACKET_SIZE, Packet};

/// Block sizes tried, largest first, when probing the loopback path
const PROBE_SIZES: [u16; 4] = [8192, 4096, 2048, 1024];
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Whether an I/O error means the datagram was larger than the stack accepts
///
/// Retrying with the same block size cannot succeed after this error.
pub fn is_message_too_long(err: &io::Error) -> bool {
    #[cfg(windows)]
    const EMSGSIZE: i32 = 10040;
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    const EMSGSIZE: i32 = 40;
    #[cfg(not(any(
        windows,
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    )))]
    const EMSGSIZE: i32 = 90;

    err.raw_os_error() == Some(EMSGSIZE)
}

/// Find the largest block size whose DATA datagram survives a loopback round trip
///
/// Returns at most `ceiling`, and 512 when nothing larger gets through.
pub fn probe_max_blksize(ceiling: u16) -> u16 {
    let candidates = PROBE_SIZES.iter().copied().filter(|size| *size <= ceiling);
    let start = if ceiling > PROBE_SIZES[0] {
        Some(ceiling)
    } else {
        None
    };

    for size in start.into_iter().chain(candidates) {
        match probe_once(size) {
            Ok(true) => {
                log::debug!("Block size probe: {} bytes round-trips", size);
                return size;
            }
            Ok(false) => log::debug!("Block size probe: {} bytes truncated or lost", size),
            Err(e) => log::debug!("Block size probe: {} bytes failed: {}", size, e),
        }
    }

    log::warn!("Block size probe found no large datagram support, using 512");
    512.min(ceiling)
}

fn probe_once(block_size: u16) -> io::Result<bool> {
    let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let sender = StdUdpSocket::bind(loopback)?;
    let receiver = StdUdpSocket::bind(loopback)?;
    receiver.set_read_timeout(Some(PROBE_TIMEOUT))?;

    let datagram = Packet::Data {
        block_num: 1,
        data: vec![0xa5; block_size as usize],
    }
    .serialize();
    sender.send_to(&datagram, receiver.local_addr()?)?;

    let mut buf = vec![0u8; datagram.len() + 1];
    let (n, _) = receiver.recv_from(&mut buf)?;
    Ok(n == datagram.len())
}

/// What arrived while waiting on a transfer socket
#[derive(Debug)]
pub enum Received {
    Packet(Packet),
    /// A datagram from an address other than the peer
    Foreign(SocketAddr),
    Timeout,
}

/// A per-transfer UDP socket talking to exactly one peer
pub struct Socket {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl Socket {
    /// Bind an OS-assigned port on `local_ip`, matching the peer's family
    /// when `local_ip` is unspecified
    pub async fn bind(local_ip: IpAddr, peer: SocketAddr) -> io::Result<Self> {
        let ip = match (local_ip, peer) {
            (ip, _) if !ip.is_unspecified() => ip,
            (_, SocketAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (_, SocketAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        log::debug!("Transfer socket {} bound for {}", socket.local_addr()?, peer);

        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, packet: &Packet) -> io::Result<()> {
        self.socket.send_to(&packet.serialize(), self.peer).await?;
        Ok(())
    }

    /// Wait up to `wait` for a decodable packet from the peer
    ///
    /// A datagram from another address is reported as `Foreign`. Undecodable
    /// datagrams are skipped without extending the deadline.
    pub async fn recv(&self, wait: Duration) -> io::Result<Received> {
        let deadline = Instant::now() + wait;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let (n, src) = match timeout(
                deadline.saturating_duration_since(Instant::now()),
                self.socket.recv_from(&mut buf),
            )
            .await
            {
                Err(_) => return Ok(Received::Timeout),
                // ICMP port unreachable surfaces as a reset on some platforms
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Ok(Err(e)) => return Err(e),
                Ok(Ok(received)) => received,
            };

            if src != self.peer {
                return Ok(Received::Foreign(src));
            }

            match Packet::deserialize(&buf[..n]) {
                Ok(packet) => return Ok(Received::Packet(packet)),
                Err(e) => log::warn!("Ignoring undecodable datagram from {}: {}", src, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn recognizes_message_too_long() {
        assert!(is_message_too_long(&io::Error::from_raw_os_error(90)));
        assert!(!is_message_too_long(&io::Error::from_raw_os_error(111)));
        assert!(!is_message_too_long(&io::Error::new(io::ErrorKind::TimedOut, "timeout")));
    }

    #[test]
    fn probe_respects_ceiling() {
        assert!(probe_max_blksize(1024) <= 1024);
        assert!(probe_max_blksize(8192) >= 512);
    }

    #[tokio::test]
    async fn recv_reports_foreign_senders() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = Socket::bind("127.0.0.1".parse().unwrap(), peer.local_addr().unwrap())
            .await
            .unwrap();
        let target = socket.local_addr().unwrap();

        stranger.send_to(&Packet::Ack(1).serialize(), target).await.unwrap();
        peer.send_to(&Packet::Ack(2).serialize(), target).await.unwrap();

        match socket.recv(Duration::from_secs(1)).await.unwrap() {
            Received::Foreign(src) => assert_eq!(src, stranger.local_addr().unwrap()),
            other => panic!("expected the stranger's datagram, got {:?}", other),
        }
        match socket.recv(Duration::from_secs(1)).await.unwrap() {
            Received::Packet(packet) => assert_eq!(packet, Packet::Ack(2)),
            other => panic!("expected the peer's ACK, got {:?}", other),
        }
        assert!(matches!(
            socket.recv(Duration::from_millis(50)).await.unwrap(),
            Received::Timeout
        ));
    }
}
