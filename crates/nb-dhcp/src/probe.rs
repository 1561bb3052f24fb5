//! Best-effort duplicate address detection.

use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
/// TCP port probed when ICMP sockets are not permitted
const ECHO_PORT: u16 = 7;

/// Answers "does something already use this address?"
pub trait LivenessProbe: Send + Sync + 'static {
    fn is_alive(&self, ip: Ipv4Addr) -> impl Future<Output = bool> + Send;
}

/// Never finds a responder.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl LivenessProbe for NoProbe {
    async fn is_alive(&self, _ip: Ipv4Addr) -> bool {
        false
    }
}

/// ICMP echo with a small hop limit, falling back to a TCP connect on the
/// echo port. Any failure counts as "nobody there".
#[derive(Debug, Clone)]
pub struct IcmpProbe {
    ttl: u32,
    timeout: Duration,
    interface: Option<String>,
}

impl IcmpProbe {
    pub fn new(interface: Option<String>) -> Self {
        Self {
            ttl: 6,
            timeout: Duration::from_millis(400),
            interface,
        }
    }

    fn socket(&self) -> io::Result<UdpSocket> {
        // Unprivileged ping socket: the kernel owns the ICMP identifier
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))?;
        socket.set_ttl(self.ttl)?;

        #[cfg(target_os = "linux")]
        if let Some(interface) = &self.interface {
            socket.bind_device(Some(interface.as_bytes()))?;
        }

        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    async fn ping(&self, ip: Ipv4Addr) -> io::Result<bool> {
        let socket = self.socket()?;
        let dest = SocketAddr::V4(SocketAddrV4::new(ip, 0));
        let seq = (u32::from(ip) & 0xffff) as u16;
        socket.send_to(&echo_request(seq), dest).await?;

        let mut buf = [0u8; 256];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from.ip() == ip && is_echo_reply(&buf[..len], seq) {
                return Ok(true);
            }
        }
    }
}

impl LivenessProbe for IcmpProbe {
    async fn is_alive(&self, ip: Ipv4Addr) -> bool {
        let probe = async {
            match self.ping(ip).await {
                Ok(alive) => alive,
                Err(e) => {
                    debug!("ICMP probe of {} unavailable ({}), trying TCP echo", ip, e);
                    tcp_echo(ip).await
                }
            }
        };
        tokio::time::timeout(self.timeout, probe).await.unwrap_or(false)
    }
}

/// A refused connection still proves a host answers on `ip`.
async fn tcp_echo(ip: Ipv4Addr) -> bool {
    match TcpStream::connect(SocketAddrV4::new(ip, ECHO_PORT)).await {
        Ok(_) => true,
        Err(e) => e.kind() == io::ErrorKind::ConnectionRefused,
    }
}

fn echo_request(seq: u16) -> Vec<u8> {
    let mut pkt = vec![ICMP_ECHO_REQUEST, 0, 0, 0, 0, 0];
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(b"netboot-probe");
    let sum = checksum(&pkt);
    pkt[2..4].copy_from_slice(&sum.to_be_bytes());
    pkt
}

fn is_echo_reply(data: &[u8], seq: u16) -> bool {
    data.len() >= 8 && data[0] == ICMP_ECHO_REPLY && data[6..8] == seq.to_be_bytes()
}

/// RFC 1071 internet checksum
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
