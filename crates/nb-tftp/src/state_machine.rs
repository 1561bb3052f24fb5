use nb_common::BootConfig;
use nb_common::EventBus;
use nb_common::events::TftpEvent;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Result, TftpError};
use crate::packet::{OPTION_BLOCK_SIZE, OPTION_TRANSFER_SIZE, TftpOptions, TftpPacket};
use crate::path;
use crate::session::{AckOutcome, SessionTable, Transfer, negotiate_block_size};

const WRITE_REFUSED: &str = "Writing is not implemented on this server";

/// Read-only TFTP protocol engine.
///
/// Owns the session table; one packet in, at most one packet out.
pub struct TftpEngine {
    config: Arc<BootConfig>,
    events: Arc<EventBus>,
    sessions: SessionTable,
}

impl TftpEngine {
    pub fn new(config: Arc<BootConfig>, events: Arc<EventBus>) -> Self {
        Self {
            sessions: SessionTable::new(config.session_timeout()),
            config,
            events,
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.sessions = SessionTable::new(timeout);
        self
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Handle one packet from `client`. Errors become ERROR packets.
    pub async fn handle(&mut self, client: Ipv4Addr, port: u16, packet: TftpPacket) -> Option<TftpPacket> {
        let opcode = packet.opcode();
        if !matches!(packet, TftpPacket::Data { .. } | TftpPacket::Ack { .. }) {
            self.trace(format_args!("TFTP {} received from {}", opcode, client));
        }
        self.sessions.find_or_start(client, port, Instant::now());

        let result = match packet {
            TftpPacket::ReadRequest {
                filename,
                mode,
                options,
            } => self.read_request(client, &filename, &mode, &options).await.map(Some),
            TftpPacket::WriteRequest { .. } | TftpPacket::Data { .. } => {
                Err(TftpError::AccessViolation(WRITE_REFUSED.to_string()))
            }
            TftpPacket::Oack { .. } => self.acknowledge(client, 0).await,
            TftpPacket::Ack { block } => self.acknowledge(client, block).await,
            TftpPacket::Error { code, message } => {
                info!(
                    "TFTP client {} aborted: {} ({}) {}",
                    client,
                    code as u16,
                    code.description(),
                    message
                );
                self.sessions.remove(client);
                Ok(None)
            }
        };

        match result {
            Ok(Some(reply)) => {
                if matches!(reply, TftpPacket::Oack { .. }) {
                    self.trace(format_args!("TFTP {} sent to {}", reply.opcode(), client));
                }
                Some(reply)
            }
            Ok(None) => None,
            Err(e) => Some(self.error_reply(client, e)),
        }
    }

    async fn read_request(
        &mut self,
        client: Ipv4Addr,
        filename: &str,
        mode: &str,
        options: &TftpOptions,
    ) -> Result<TftpPacket> {
        // A new request always ends the previous transfer
        if let Some(session) = self.sessions.get_mut(client) {
            session.transfer = None;
        }

        let root = Path::new(&self.config.tftp_root_folder);
        let (name, full) = path::resolve(root, filename, self.config.tftp_symlink_markers).await?;
        let mut transfer = match Transfer::open(name.clone(), &full).await {
            Err(TftpError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(TftpError::FileNotFound(name));
            }
            other => other?,
        };

        let mut acknowledged = TftpOptions::new();
        let requested = |key: &str| options.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        if let Some(block_size) = requested(OPTION_BLOCK_SIZE).and_then(negotiate_block_size) {
            transfer.set_block_size(block_size);
            acknowledged.push((OPTION_BLOCK_SIZE.to_string(), block_size.to_string()));
        }
        if requested(OPTION_TRANSFER_SIZE).is_some() {
            acknowledged.push((OPTION_TRANSFER_SIZE.to_string(), transfer.size().to_string()));
        }

        info!(
            "TFTP {} sending {} ({} bytes, {}-byte blocks, mode {})",
            client,
            name,
            transfer.size(),
            transfer.block_size(),
            mode
        );
        self.events.tftp(TftpEvent::TransferStarted {
            client,
            path: name,
            size: transfer.size(),
            block_size: transfer.block_size(),
        });

        let reply = if acknowledged.is_empty() {
            transfer.send_block(1).await?
        } else {
            TftpPacket::oack(acknowledged)
        };

        if let Some(session) = self.sessions.get_mut(client) {
            session.transfer = Some(transfer);
        }
        Ok(reply)
    }

    async fn acknowledge(&mut self, client: Ipv4Addr, block: u16) -> Result<Option<TftpPacket>> {
        let transfer = self
            .sessions
            .get_mut(client)
            .and_then(|s| s.transfer.as_mut())
            .ok_or(TftpError::UnknownTransfer)?;

        match transfer.acknowledge(block).await? {
            AckOutcome::Data(packet) => Ok(Some(packet)),
            AckOutcome::Completed { blocks } => {
                info!("TFTP {} received {} ({} blocks)", client, transfer.path(), blocks);
                self.events.tftp(TftpEvent::TransferCompleted {
                    client,
                    path: transfer.path().to_string(),
                    blocks,
                });
                Ok(None)
            }
            AckOutcome::Idle => Ok(None),
        }
    }

    fn error_reply(&self, client: Ipv4Addr, error: TftpError) -> TftpPacket {
        let reply = error.to_packet();
        if let TftpPacket::Error { code, message } = &reply {
            self.trace(format_args!(
                "TFTP {} {}:\"{}\" sent to {}",
                reply.opcode(),
                *code as u16,
                message,
                client
            ));
            self.events.tftp(TftpEvent::ErrorSent {
                client,
                code: *code as u16,
                message: message.clone(),
            });
        }
        reply
    }

    /// Remove idle sessions. Returns the number removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let count = self.sessions.prune(now);
        if count > 0 {
            debug!("Pruned {} idle TFTP sessions", count);
            self.events.tftp(TftpEvent::SessionsPruned { count });
        }
        count
    }

    /// Drop every session and its open file.
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    fn trace(&self, message: std::fmt::Arguments<'_>) {
        if self.config.tftp_log_packets {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ErrorCode;
    use bytes::Bytes;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 20);

    fn engine(root: &Path) -> (TftpEngine, Arc<EventBus>) {
        let mut config = BootConfig::default();
        config.tftp_root_folder = root.to_string_lossy().into_owned();
        let events = Arc::new(EventBus::new());
        (TftpEngine::new(Arc::new(config), events.clone()), events)
    }

    fn rrq(filename: &str, options: &[(&str, &str)]) -> TftpPacket {
        TftpPacket::ReadRequest {
            filename: filename.to_string(),
            mode: "octet".to_string(),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_rrq_without_options_sends_first_block() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("small"), b"hello").unwrap();
        let (mut engine, events) = engine(root.path());
        let mut rx = events.tftp.subscribe();

        let reply = engine.handle(CLIENT, 2000, rrq("small", &[])).await.unwrap();
        assert_eq!(reply, TftpPacket::data(1, Bytes::from_static(b"hello")));

        assert_eq!(engine.handle(CLIENT, 2000, TftpPacket::ack(1)).await, None);
        assert!(matches!(rx.recv().await.unwrap(), TftpEvent::TransferStarted { size: 5, .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TftpEvent::TransferCompleted { blocks: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_options_are_acknowledged_in_order() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("file"), vec![7u8; 3000]).unwrap();
        let (mut engine, _) = engine(root.path());

        let reply = engine
            .handle(CLIENT, 2000, rrq("file", &[("tsize", "0"), ("blksize", "1024"), ("timeout", "3")]))
            .await
            .unwrap();
        assert_eq!(
            reply,
            TftpPacket::oack(vec![
                ("blksize".to_string(), "1024".to_string()),
                ("tsize".to_string(), "3000".to_string()),
            ])
        );

        // OACK from the client counts as ACK 0
        let reply = engine
            .handle(CLIENT, 2000, TftpPacket::oack(vec![]))
            .await
            .unwrap();
        assert_eq!(reply, TftpPacket::data(1, vec![7u8; 1024]));
    }

    #[tokio::test]
    async fn test_unsupported_options_only_start_data() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("file"), b"x").unwrap();
        let (mut engine, _) = engine(root.path());

        let reply = engine
            .handle(CLIENT, 2000, rrq("file", &[("blksize", "huge"), ("timeout", "3")]))
            .await
            .unwrap();
        assert_eq!(reply.opcode(), crate::packet::Opcode::Data);
    }

    #[tokio::test]
    async fn test_errors() {
        let root = tempfile::tempdir().unwrap();
        let (mut engine, events) = engine(root.path());
        let mut rx = events.tftp.subscribe();

        let reply = engine.handle(CLIENT, 2000, rrq("missing", &[])).await.unwrap();
        assert!(matches!(reply, TftpPacket::Error { code: ErrorCode::FileNotFound, .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TftpEvent::ErrorSent { code: 1, .. }
        ));

        let wrq = TftpPacket::WriteRequest {
            filename: "upload".to_string(),
            mode: "octet".to_string(),
            options: vec![],
        };
        let reply = engine.handle(CLIENT, 2000, wrq).await.unwrap();
        assert_eq!(reply, TftpPacket::error(ErrorCode::AccessViolation, WRITE_REFUSED));

        let reply = engine
            .handle(CLIENT, 2000, TftpPacket::data(1, Bytes::new()))
            .await
            .unwrap();
        assert_eq!(reply, TftpPacket::error(ErrorCode::AccessViolation, WRITE_REFUSED));

        let reply = engine.handle(CLIENT, 2000, TftpPacket::ack(3)).await.unwrap();
        assert!(matches!(reply, TftpPacket::Error { code: ErrorCode::UnknownTransferId, .. }));
    }

    #[tokio::test]
    async fn test_client_error_ends_session() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("file"), vec![0u8; 2048]).unwrap();
        let (mut engine, _) = engine(root.path());

        engine.handle(CLIENT, 2000, rrq("file", &[])).await.unwrap();
        assert_eq!(engine.sessions().len(), 1);

        let abort = TftpPacket::error(ErrorCode::NotDefined, "user abort");
        assert_eq!(engine.handle(CLIENT, 2000, abort).await, None);
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_new_request_replaces_transfer() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a"), vec![1u8; 1000]).unwrap();
        std::fs::write(root.path().join("b"), vec![2u8; 1000]).unwrap();
        let (mut engine, _) = engine(root.path());

        engine.handle(CLIENT, 2000, rrq("a", &[])).await.unwrap();
        let reply = engine.handle(CLIENT, 2001, rrq("b", &[])).await.unwrap();
        assert_eq!(reply, TftpPacket::data(1, vec![2u8; 512]));

        let reply = engine.handle(CLIENT, 2001, TftpPacket::ack(1)).await.unwrap();
        assert_eq!(reply, TftpPacket::data(2, vec![2u8; 488]));
        assert_eq!(engine.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_emits_event() {
        let root = tempfile::tempdir().unwrap();
        let (engine, events) = engine(root.path());
        let mut engine = engine.with_session_timeout(Duration::from_secs(1));
        let mut rx = events.tftp.subscribe();

        engine.handle(CLIENT, 2000, TftpPacket::ack(0)).await;
        assert_eq!(engine.prune(Instant::now()), 0);
        assert_eq!(engine.prune(Instant::now() + Duration::from_secs(5)), 1);

        // ERROR for the stray ACK, then the prune
        assert!(matches!(rx.recv().await.unwrap(), TftpEvent::ErrorSent { code: 5, .. }));
        assert_eq!(rx.recv().await.unwrap(), TftpEvent::SessionsPruned { count: 1 });
    }
}
