//! Per-client TFTP sessions
//!
//! Sessions are keyed by client IP alone: two boot loaders behind the same
//! address share one session, and a new read request replaces the running
//! transfer.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Result, TftpError};
use crate::packet::TftpPacket;

/// Default block size (RFC 1350)
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Smallest block size accepted (RFC 2348)
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Maximum block size (RFC 2348)
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Clamp a requested `blksize` value. Unparsable values are ignored.
pub fn negotiate_block_size(requested: &str) -> Option<u16> {
    let value: u64 = requested.trim().parse().ok()?;
    Some(value.clamp(MIN_BLOCK_SIZE as u64, MAX_BLOCK_SIZE as u64) as u16)
}

/// Map a 16-bit ACK number onto the absolute block counter, assuming it
/// refers to `last_sent` or a block before it.
pub fn acked_block(last_sent: u64, wire: u16) -> u64 {
    let back = (last_sent as u16).wrapping_sub(wire) as u64;
    last_sent.saturating_sub(back)
}

/// What an ACK led to
#[derive(Debug)]
pub enum AckOutcome {
    /// Next (or repeated) data block
    Data(TftpPacket),
    /// The final block was acknowledged, first time only
    Completed { blocks: u64 },
    /// Nothing left to send
    Idle,
}

/// An open read transfer
#[derive(Debug)]
pub struct Transfer {
    path: String,
    file: File,
    size: u64,
    block_size: u16,
    last_sent: u64,
    eof: bool,
    completed: bool,
}

impl Transfer {
    /// Open `full` read-only. `path` is the root-relative name used in logs.
    pub async fn open(path: String, full: &Path) -> Result<Self> {
        let file = File::open(full).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(TftpError::FileNotFound(path));
        }
        Ok(Self {
            path,
            file,
            size: meta.len(),
            block_size: DEFAULT_BLOCK_SIZE,
            last_sent: 0,
            eof: false,
            completed: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    pub fn set_block_size(&mut self, block_size: u16) {
        self.block_size = block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Read and frame absolute block `block` (1-based). A short block marks
    /// the end of the file.
    pub async fn send_block(&mut self, block: u64) -> Result<TftpPacket> {
        let block_size = self.block_size as usize;
        let offset = (block - 1) * self.block_size as u64;
        self.file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = BytesMut::zeroed(block_size);
        let mut filled = 0;
        while filled < block_size {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        self.eof = filled < block_size;
        self.last_sent = block;
        Ok(TftpPacket::data(block as u16, Bytes::from(buf)))
    }

    /// Handle ACK `wire`: send the block after it until the end of the file.
    pub async fn acknowledge(&mut self, wire: u16) -> Result<AckOutcome> {
        let acked = acked_block(self.last_sent, wire);
        if self.eof {
            if acked == self.last_sent && !self.completed {
                self.completed = true;
                return Ok(AckOutcome::Completed {
                    blocks: self.last_sent,
                });
            }
            return Ok(AckOutcome::Idle);
        }
        Ok(AckOutcome::Data(self.send_block(acked + 1).await?))
    }
}

/// State kept for one client address
#[derive(Debug)]
pub struct TftpSession {
    client: Ipv4Addr,
    port: u16,
    last_seen: Instant,
    pub transfer: Option<Transfer>,
}

impl TftpSession {
    fn new(client: Ipv4Addr, port: u16, now: Instant) -> Self {
        Self {
            client,
            port,
            last_seen: now,
            transfer: None,
        }
    }

    pub fn client(&self) -> Ipv4Addr {
        self.client
    }

    /// Source port of the latest packet
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// All live sessions, with idle expiry
#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<Ipv4Addr, TftpSession>,
    timeout: Duration,
}

impl SessionTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Existing session for `client`, refreshed, or a new one.
    pub fn find_or_start(&mut self, client: Ipv4Addr, port: u16, now: Instant) -> &mut TftpSession {
        let session = self
            .sessions
            .entry(client)
            .or_insert_with(|| TftpSession::new(client, port, now));
        session.port = port;
        session.last_seen = now;
        session
    }

    pub fn get(&self, client: Ipv4Addr) -> Option<&TftpSession> {
        self.sessions.get(&client)
    }

    pub fn get_mut(&mut self, client: Ipv4Addr) -> Option<&mut TftpSession> {
        self.sessions.get_mut(&client)
    }

    pub fn remove(&mut self, client: Ipv4Addr) -> Option<TftpSession> {
        self.sessions.remove(&client)
    }

    /// Drop sessions idle longer than the timeout, closing their files.
    /// Returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        let timeout = self.timeout;
        self.sessions.retain(|_, s| s.idle(now) <= timeout);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_block_size() {
        assert_eq!(negotiate_block_size("1428"), Some(1428));
        assert_eq!(negotiate_block_size("1"), Some(8));
        assert_eq!(negotiate_block_size("100000"), Some(65464));
        assert_eq!(negotiate_block_size("lots"), None);
    }

    #[test]
    fn test_acked_block_rollover() {
        assert_eq!(acked_block(0, 0), 0);
        assert_eq!(acked_block(5, 5), 5);
        // Duplicate ACK of the previous block
        assert_eq!(acked_block(5, 4), 4);
        assert_eq!(acked_block(65535, 65535), 65535);
        assert_eq!(acked_block(65536, 0), 65536);
        assert_eq!(acked_block(65537, 1), 65537);
        assert_eq!(acked_block(65537, 0), 65536);
    }

    #[test]
    fn test_prune_idle_sessions() {
        let start = Instant::now();
        let mut table = SessionTable::new(Duration::from_secs(300));
        let a = Ipv4Addr::new(10, 0, 0, 20);
        let b = Ipv4Addr::new(10, 0, 0, 21);

        table.find_or_start(a, 2000, start);
        table.find_or_start(b, 2001, start + Duration::from_secs(200));
        assert_eq!(table.len(), 2);

        assert_eq!(table.prune(start + Duration::from_secs(301)), 1);
        assert!(table.get(a).is_none());
        assert_eq!(table.get(b).unwrap().port(), 2001);

        // A returning client starts over
        let session = table.find_or_start(a, 2002, start + Duration::from_secs(302));
        assert!(session.transfer.is_none());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_transfer_blocks_and_eof() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("kernel");
        let content: Vec<u8> = (0..20u8).collect();
        std::fs::write(&full, &content).unwrap();

        let mut transfer = Transfer::open("kernel".into(), &full).await.unwrap();
        transfer.set_block_size(8);
        assert_eq!(transfer.size(), 20);

        let first = transfer.send_block(1).await.unwrap();
        assert_eq!(first, TftpPacket::data(1, content[..8].to_vec()));

        let AckOutcome::Data(second) = transfer.acknowledge(1).await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(second, TftpPacket::data(2, content[8..16].to_vec()));

        let AckOutcome::Data(third) = transfer.acknowledge(2).await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(third, TftpPacket::data(3, content[16..].to_vec()));
        assert!(transfer.is_eof());

        assert!(matches!(
            transfer.acknowledge(3).await.unwrap(),
            AckOutcome::Completed { blocks: 3 }
        ));
        assert!(matches!(transfer.acknowledge(3).await.unwrap(), AckOutcome::Idle));
    }

    #[tokio::test]
    async fn test_open_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Transfer::open("".into(), dir.path()).await.unwrap_err();
        assert!(matches!(err, TftpError::FileNotFound(_)));
    }
}
