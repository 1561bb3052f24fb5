use nb_common::{
    BootConfig, DatagramHandler, EventBus, Reply, ServiceError, ServiceHandle, ServiceOptions,
    UdpService,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::packet::TftpPacket;
use crate::state_machine::TftpEngine;

/// Datagram side of the TFTP service. Replies go back to the sender's
/// address and port.
pub struct TftpServer {
    engine: TftpEngine,
}

impl TftpServer {
    pub fn new(config: Arc<BootConfig>, events: Arc<EventBus>) -> Self {
        Self {
            engine: TftpEngine::new(config, events),
        }
    }

    pub fn from_engine(engine: TftpEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &TftpEngine {
        &self.engine
    }
}

impl DatagramHandler for TftpServer {
    async fn handle(&mut self, src: SocketAddr, data: &[u8]) -> Option<Reply> {
        let IpAddr::V4(client) = src.ip() else {
            debug!("Ignoring TFTP packet from non-IPv4 peer {}", src);
            return None;
        };
        let packet = match TftpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("Invalid TFTP packet from {}: {}", src, e);
                return None;
            }
        };

        let reply = self.engine.handle(client, src.port(), packet).await?;
        Some(Reply::new(src, reply.encode().to_vec()))
    }

    async fn maintain(&mut self) {
        self.engine.prune(Instant::now());
    }

    async fn shutdown(&mut self) {
        self.engine.clear();
    }
}

pub fn service_options(config: &BootConfig) -> ServiceOptions {
    let mut options = ServiceOptions::new(config.tftp_bind_addr());
    options.interface = config.interface().map(str::to_string);
    options
}

/// Start the TFTP service.
pub async fn start(config: Arc<BootConfig>, events: Arc<EventBus>) -> Result<ServiceHandle, ServiceError> {
    let server = TftpServer::new(config.clone(), events.clone());
    UdpService::new("tftp", service_options(&config), server)
        .with_events(events)
        .start()
        .await
}
