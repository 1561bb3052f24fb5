use nb_common::{
    BootConfig, DatagramHandler, EventBus, Reply, ServiceError, ServiceHandle, ServiceOptions,
    UdpService,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

use crate::SharedLeases;
use crate::packet::DhcpPacket;
use crate::probe::{IcmpProbe, LivenessProbe};
use crate::state_machine::DhcpEngine;

/// Datagram side of the DHCP service: decode, run the engine, broadcast the reply.
pub struct DhcpServer<P> {
    engine: DhcpEngine<P>,
    client_port: u16,
    log_packets: bool,
}

impl<P: LivenessProbe> DhcpServer<P> {
    pub fn new(config: Arc<BootConfig>, probe: P, events: Arc<EventBus>) -> Self {
        Self {
            client_port: config.dhcp_client_port,
            log_packets: config.dhcp_log_packets,
            engine: DhcpEngine::new(config, probe, events),
        }
    }

    pub fn leases(&self) -> SharedLeases {
        self.engine.leases()
    }
}

impl<P: LivenessProbe> DatagramHandler for DhcpServer<P> {
    async fn handle(&mut self, src: SocketAddr, data: &[u8]) -> Option<Reply> {
        let packet = match DhcpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("Invalid DHCP packet from {}: {}", src, e);
                return None;
            }
        };
        if self.log_packets {
            info!("DHCP packet from {}:\n{}", src, packet.describe());
        }

        let response = self.engine.handle_packet(&packet).await?;
        if self.log_packets {
            info!("DHCP reply:\n{}", response.describe());
        }

        // Clients have no address yet: every reply is broadcast
        let dest = SocketAddr::new(Ipv4Addr::BROADCAST.into(), self.client_port);
        Some(Reply::new(dest, response.to_bytes()))
    }
}

pub fn service_options(config: &BootConfig) -> ServiceOptions {
    let mut options = ServiceOptions::new(config.dhcp_bind_addr());
    options.interface = config.interface().map(str::to_string);
    options.broadcast = true;
    options.reply_delay = config.reply_delay();
    options
}

/// Start the DHCP service with the ICMP liveness probe.
pub async fn start(
    config: Arc<BootConfig>,
    events: Arc<EventBus>,
) -> Result<(ServiceHandle, SharedLeases), ServiceError> {
    let probe = IcmpProbe::new(config.interface().map(str::to_string));
    let server = DhcpServer::new(config.clone(), probe, events.clone());
    let leases = server.leases();

    let handle = UdpService::new("dhcp", service_options(&config), server)
        .with_events(events)
        .start()
        .await?;
    Ok((handle, leases))
}
