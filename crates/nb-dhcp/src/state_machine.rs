use nb_common::BootConfig;
use nb_common::EventBus;
use nb_common::events::DhcpEvent;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::SharedLeases;
use crate::lease_store::{Assignment, LeaseStore};
use crate::options::*;
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::pool::AddressPool;
use crate::probe::LivenessProbe;

/// Lease, renewal and rebinding time: 10 days
pub const LEASE_SECS: u32 = 86400 * 10;

/// Boot file size option unit (RFC 2132 §3.15)
const BOOT_SIZE_BLOCK: u64 = 512;

/// DISCOVER/REQUEST handling over the address pool and the lease table.
///
/// Stateless across packets except for the lease table, which is only
/// written from here.
pub struct DhcpEngine<P> {
    config: Arc<BootConfig>,
    pool: AddressPool,
    leases: SharedLeases,
    probe: P,
    events: Arc<EventBus>,
}

impl<P: LivenessProbe> DhcpEngine<P> {
    pub fn new(config: Arc<BootConfig>, probe: P, events: Arc<EventBus>) -> Self {
        Self {
            pool: AddressPool::from_config(&config),
            config,
            leases: Arc::new(tokio::sync::RwLock::new(LeaseStore::new())),
            probe,
            events,
        }
    }

    pub fn leases(&self) -> SharedLeases {
        self.leases.clone()
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    fn server_ip(&self) -> Ipv4Addr {
        self.config.network_address
    }

    /// Handle an incoming DHCP packet and produce a response (if any).
    pub async fn handle_packet(&self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        if packet.op != BOOTREQUEST {
            debug!("Ignoring DHCP packet with op {}", packet.op);
            return None;
        }

        let client = describe_client(packet);
        if self.config.dhcp_broadcasts_only && !packet.is_broadcast() {
            self.trace(format_args!("Ignoring packet without broadcast bit from {}", client));
            return None;
        }

        match packet.msg_type() {
            Some(DHCPDISCOVER) => self.handle_discover(packet, &client).await,
            Some(DHCPREQUEST) => self.handle_request(packet, &client).await,
            Some(other) => {
                debug!("Ignoring {} from {}", message_type_name(other), client);
                None
            }
            None => {
                debug!("Ignoring packet without message type from {}", client);
                None
            }
        }
    }

    async fn handle_discover(&self, packet: &DhcpPacket, client: &str) -> Option<DhcpPacket> {
        let key = packet.mac_str();
        self.trace(format_args!("DHCPDISCOVER from {}", client));

        let mut chosen = None;
        if let Some(ip) = packet.requested_ip().filter(|ip| !ip.is_unspecified()) {
            if !self.pool.is_valid(ip) {
                warn!(
                    "Requested IP {} is not on enforced subnet {}/{} for {}",
                    ip,
                    self.pool.network(),
                    self.pool.mask,
                    client
                );
                return self.nak_if_authoritative(packet, &key, "requested address off subnet");
            }

            let leases = self.leases.read().await;
            if self.pool.is_available(&leases, &self.probe, ip, &key).await {
                chosen = Some(ip);
            } else {
                warn!("Requested IP {} is already in use, not assigning it to {}", ip, client);
            }
        }

        let ip = match chosen {
            Some(ip) => ip,
            None => {
                let leases = self.leases.read().await;
                match self.pool.allocate(&leases, &self.probe, &key).await {
                    Some(ip) => ip,
                    None => {
                        error!("Failed to allocate IP for {}: pool exhausted", client);
                        self.events.dhcp(DhcpEvent::PoolExhausted { client: key });
                        return None;
                    }
                }
            }
        };

        self.assign(&key, ip).await;

        info!("DHCPOFFER {} to {}", ip, client);
        self.events.dhcp(DhcpEvent::Offered { client: key, ip });
        // DHCPOFFER: ciaddr is always 0 (RFC 2131 §4.3.1)
        Some(self.build_reply(packet, DHCPOFFER, ip, Ipv4Addr::UNSPECIFIED).await)
    }

    async fn handle_request(&self, packet: &DhcpPacket, client: &str) -> Option<DhcpPacket> {
        let key = packet.mac_str();

        let target = packet.server_id().unwrap_or(packet.siaddr);
        if !target.is_unspecified() && target != self.server_ip() {
            info!("DHCPREQUEST from {} to {} (ignored)", client, target);
            self.events.dhcp(DhcpEvent::Ignored {
                client: key,
                reason: format!("addressed to server {}", target),
            });
            return None;
        }

        self.trace(format_args!("DHCPREQUEST from {}", client));

        let requested = if packet.ciaddr.is_unspecified() {
            packet.requested_ip().filter(|ip| !ip.is_unspecified())
        } else {
            Some(packet.ciaddr)
        };

        let mut resolved = None;
        if let Some(ip) = requested {
            if !self.pool.is_valid(ip) {
                warn!(
                    "Requested IP {} is not on enforced subnet {}/{} for {}",
                    ip,
                    self.pool.network(),
                    self.pool.mask,
                    client
                );
                return self.nak_if_authoritative(packet, &key, "requested address off subnet");
            }

            let leases = self.leases.read().await;
            if self.pool.is_available(&leases, &self.probe, ip, &key).await {
                resolved = Some(ip);
            } else {
                warn!("Requested IP {} is already taken, requested by {}", ip, client);
            }
        }

        let Some(ip) = resolved else {
            warn!("DHCPNAK to {}: no address could be resolved", client);
            return Some(self.build_nak(packet, key, "no address could be resolved"));
        };

        self.assign(&key, ip).await;

        info!("DHCPACK {} to {}", ip, client);
        self.events.dhcp(DhcpEvent::Acknowledged { client: key, ip });
        // DHCPACK: echo client's ciaddr (RFC 2131 §4.3.1 Table 3)
        Some(self.build_reply(packet, DHCPACK, ip, packet.ciaddr).await)
    }

    async fn assign(&self, key: &str, ip: Ipv4Addr) {
        let outcome = self.leases.write().await.assign(key, ip);
        let previous = match outcome {
            Assignment::Unchanged => return,
            Assignment::Fresh => None,
            Assignment::Reassigned { previous } => Some(previous),
        };
        self.events.dhcp(DhcpEvent::Assigned {
            client: key.to_string(),
            ip,
            previous,
        });
    }

    fn nak_if_authoritative(&self, packet: &DhcpPacket, key: &str, reason: &str) -> Option<DhcpPacket> {
        if !self.config.dhcp_authoritative {
            self.events.dhcp(DhcpEvent::Ignored {
                client: key.to_string(),
                reason: reason.to_string(),
            });
            return None;
        }
        warn!("DHCPNAK to {}: {}", key, reason);
        Some(self.build_nak(packet, key.to_string(), reason))
    }

    fn build_nak(&self, packet: &DhcpPacket, key: String, reason: &str) -> DhcpPacket {
        self.events.dhcp(DhcpEvent::NakSent {
            client: key,
            reason: reason.to_string(),
        });
        // DHCPNAK: ciaddr and yiaddr are always 0 (RFC 2131 §4.3.2)
        packet.build_reply(
            DHCPNAK,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            vec![
                DhcpOption::server_id(self.server_ip()),
                packet.client_identifier(),
            ],
        )
    }

    async fn build_reply(
        &self,
        packet: &DhcpPacket,
        msg_type: u8,
        yiaddr: Ipv4Addr,
        ciaddr: Ipv4Addr,
    ) -> DhcpPacket {
        let mut options = self.requested_options(packet);
        options.extend(self.boot_options().await);
        options.extend(self.lease_options());
        options.push(packet.client_identifier());

        let boot_server = self.boot_server();
        let mut reply = packet.build_reply(
            msg_type,
            yiaddr,
            boot_server.unwrap_or(Ipv4Addr::UNSPECIFIED),
            ciaddr,
            options,
        );
        if !self.config.boot_file.is_empty() {
            reply.set_boot_file(&self.config.boot_file);
            if let Some(server) = boot_server {
                reply.set_server_name(&server.to_string());
            }
        }
        reply
    }

    /// Answers to the parameter request list, in the client's order.
    fn requested_options(&self, packet: &DhcpPacket) -> Vec<DhcpOption> {
        let config = &self.config;
        let mut options = Vec::new();
        for &code in packet.parameter_requests() {
            match code {
                OPT_SUBNET_MASK if !config.dhcp_subnet_mask.is_unspecified() => {
                    options.push(DhcpOption::ipv4(code, config.dhcp_subnet_mask));
                }
                OPT_ROUTER if !config.dhcp_opt_gateway_address.is_unspecified() => {
                    options.push(DhcpOption::ipv4(code, self.forward_loopback(config.dhcp_opt_gateway_address)));
                }
                OPT_DNS_SERVER if !config.dhcp_opt_dns_server_address.is_unspecified() => {
                    options.push(DhcpOption::ipv4(code, self.forward_loopback(config.dhcp_opt_dns_server_address)));
                }
                OPT_DOMAIN_NAME if !config.dhcp_opt_dns_domain.is_empty() => {
                    options.push(DhcpOption::text(code, &config.dhcp_opt_dns_domain));
                }
                OPT_TIME_SERVER if !config.dhcp_opt_time_server_address.is_unspecified() => {
                    options.push(DhcpOption::ipv4(code, self.forward_loopback(config.dhcp_opt_time_server_address)));
                }
                _ => {}
            }
        }
        options
    }

    /// Boot file name, size and TFTP server, when a boot file is configured.
    async fn boot_options(&self) -> Vec<DhcpOption> {
        let config = &self.config;
        let mut options = Vec::new();
        if config.boot_file.is_empty() {
            return options;
        }

        options.push(DhcpOption::nul_terminated(OPT_BOOT_FILE_NAME, &config.boot_file));

        let size = if config.boot_file_size != 0 {
            Some(u64::from(config.boot_file_size))
        } else {
            let path = Path::new(&config.tftp_root_folder).join(config.boot_file.trim_start_matches('/'));
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Some(meta.len()),
                _ => {
                    debug!("Boot file {} not found, size not advertised", path.display());
                    None
                }
            }
        };
        if let Some(size) = size {
            let blocks = size.div_ceil(BOOT_SIZE_BLOCK).min(u64::from(u16::MAX)) as u16;
            options.push(DhcpOption::new(OPT_BOOT_FILE_SIZE, blocks.to_be_bytes().to_vec()));
        }

        if let Some(server) = self.boot_server() {
            options.push(DhcpOption::text(OPT_TFTP_SERVER, &server.to_string()));
        }
        options
    }

    fn lease_options(&self) -> [DhcpOption; 4] {
        [
            DhcpOption::server_id(self.server_ip()),
            DhcpOption::rebinding_time(LEASE_SECS),
            DhcpOption::renewal_time(LEASE_SECS),
            DhcpOption::lease_time(LEASE_SECS),
        ]
    }

    /// Local server when TFTP runs here and no other server is configured,
    /// else the configured override.
    fn boot_server(&self) -> Option<Ipv4Addr> {
        let server = self.server_ip();
        let configured = self.config.dhcp_opt_boot_server_address;
        if self.config.tftp_enabled
            && !server.is_unspecified()
            && (configured.is_unspecified() || configured == server)
        {
            Some(server)
        } else if !configured.is_unspecified() {
            Some(configured)
        } else {
            None
        }
    }

    /// 127.0.0.1 in the configuration stands for this server.
    fn forward_loopback(&self, ip: Ipv4Addr) -> Ipv4Addr {
        if ip == Ipv4Addr::LOCALHOST { self.server_ip() } else { ip }
    }

    fn trace(&self, message: std::fmt::Arguments<'_>) {
        if self.config.dhcp_log_packets {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }
}

/// `client <hwaddress=..; hostname=..>` for log lines
fn describe_client(packet: &DhcpPacket) -> String {
    let mut out = format!("client <hwaddress={}", packet.mac_str());
    if let Some(hostname) = packet.hostname() {
        out.push_str("; hostname=");
        out.push_str(&hostname);
    }
    out.push('>');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FLAG_BROADCAST, MAGIC_COOKIE};
    use crate::probe::NoProbe;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    fn config() -> BootConfig {
        let mut config = BootConfig::default();
        config.network_address = Ipv4Addr::new(10, 0, 0, 1);
        config.dhcp_opt_gateway_address = Ipv4Addr::LOCALHOST;
        config.dhcp_opt_dns_server_address = Ipv4Addr::new(10, 0, 0, 53);
        config.dhcp_opt_dns_domain = "lab".to_string();
        config.boot_file_size = 1000;
        config.autoconfigure();
        config
    }

    fn engine(config: BootConfig) -> DhcpEngine<NoProbe> {
        DhcpEngine::new(Arc::new(config), NoProbe, Arc::new(EventBus::new()))
    }

    fn request(msg_type: u8, options: Vec<DhcpOption>) -> DhcpPacket {
        let mut data = vec![0u8; 240];
        data[0] = BOOTREQUEST;
        data[1] = 1;
        data[2] = 6;
        data[4..8].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        data[28..34].copy_from_slice(&MAC);
        data[236..240].copy_from_slice(&MAGIC_COOKIE);
        let mut packet = DhcpPacket::parse(&data).unwrap();
        packet.flags = FLAG_BROADCAST;
        packet.options.push(DhcpOption::msg_type(msg_type));
        packet.options.extend(options);
        packet
    }

    #[tokio::test]
    async fn test_offer_options_in_order() {
        let engine = engine(config());
        let discover = request(
            DHCPDISCOVER,
            vec![DhcpOption::new(OPT_PARAM_REQUEST, vec![1, 3, 6, 15, 4])],
        );

        let offer = engine.handle_packet(&discover).await.unwrap();
        assert_eq!(offer.msg_type(), Some(DHCPOFFER));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 0, 20));
        assert!(offer.is_broadcast());

        let codes: Vec<u8> = offer.options.iter().map(|o| o.code).collect();
        assert_eq!(codes, vec![53, 1, 3, 6, 15, 67, 13, 66, 54, 59, 58, 51, 61]);

        // Loopback gateway is rewritten to the server address
        assert_eq!(offer.get_option(OPT_ROUTER).unwrap().as_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(offer.get_option(OPT_DNS_SERVER).unwrap().as_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 53)));
        assert_eq!(offer.get_option(OPT_LEASE_TIME).unwrap().as_u32(), Some(864000));
        assert_eq!(offer.get_option(OPT_BOOT_FILE_SIZE).unwrap().data, vec![0, 2]);
        assert_eq!(offer.get_option(OPT_CLIENT_ID).unwrap().data, MAC.to_vec());
        assert_eq!(offer.siaddr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(offer.boot_file(), "pxelinux.0");
    }

    #[tokio::test]
    async fn test_boot_options_absent_without_boot_file() {
        let mut config = config();
        config.boot_file.clear();
        let engine = engine(config);

        let offer = engine.handle_packet(&request(DHCPDISCOVER, vec![])).await.unwrap();
        let codes: Vec<u8> = offer.options.iter().map(|o| o.code).collect();
        assert_eq!(codes, vec![53, 54, 59, 58, 51, 61]);
    }

    #[tokio::test]
    async fn test_boot_server_override() {
        let mut config = config();
        config.dhcp_opt_boot_server_address = Ipv4Addr::new(10, 0, 0, 9);
        let engine = engine(config);

        let offer = engine.handle_packet(&request(DHCPDISCOVER, vec![])).await.unwrap();
        assert_eq!(offer.get_option(OPT_TFTP_SERVER).unwrap().as_str(), "10.0.0.9");
        assert_eq!(offer.server_name(), "10.0.0.9");
    }

    #[tokio::test]
    async fn test_requested_address_honoured() {
        let engine = engine(config());
        let wanted = Ipv4Addr::new(10, 0, 0, 150);
        let discover = request(DHCPDISCOVER, vec![DhcpOption::ipv4(OPT_REQUESTED_IP, wanted)]);

        let offer = engine.handle_packet(&discover).await.unwrap();
        assert_eq!(offer.yiaddr, wanted);
    }

    #[tokio::test]
    async fn test_requested_server_address_falls_back_to_pool() {
        let engine = engine(config());
        let discover = request(
            DHCPDISCOVER,
            vec![DhcpOption::ipv4(OPT_REQUESTED_IP, Ipv4Addr::new(10, 0, 0, 1))],
        );
        let offer = engine.handle_packet(&discover).await.unwrap();
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 0, 20));
    }

    #[tokio::test]
    async fn test_discover_off_subnet() {
        let off_subnet = vec![DhcpOption::ipv4(OPT_REQUESTED_IP, Ipv4Addr::new(192, 168, 7, 7))];

        let engine_auth = engine(config());
        let nak = engine_auth.handle_packet(&request(DHCPDISCOVER, off_subnet.clone())).await.unwrap();
        assert_eq!(nak.msg_type(), Some(DHCPNAK));
        assert_eq!(nak.op, 2);

        let mut config = config();
        config.dhcp_authoritative = false;
        let engine_quiet = engine(config);
        assert!(engine_quiet.handle_packet(&request(DHCPDISCOVER, off_subnet)).await.is_none());
    }

    #[tokio::test]
    async fn test_request_for_other_server_ignored() {
        let engine = engine(config());
        let req = request(
            DHCPREQUEST,
            vec![
                DhcpOption::server_id(Ipv4Addr::new(10, 0, 0, 2)),
                DhcpOption::ipv4(OPT_REQUESTED_IP, Ipv4Addr::new(10, 0, 0, 20)),
            ],
        );
        assert!(engine.handle_packet(&req).await.is_none());

        let mut via_siaddr = request(DHCPREQUEST, vec![]);
        via_siaddr.siaddr = Ipv4Addr::new(10, 0, 0, 2);
        via_siaddr.ciaddr = Ipv4Addr::new(10, 0, 0, 20);
        assert!(engine.handle_packet(&via_siaddr).await.is_none());
        assert!(engine.leases().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_without_address_is_nakked() {
        let engine = engine(config());
        let nak = engine.handle_packet(&request(DHCPREQUEST, vec![])).await.unwrap();
        assert_eq!(nak.msg_type(), Some(DHCPNAK));
    }

    #[tokio::test]
    async fn test_request_prefers_ciaddr() {
        let engine = engine(config());
        let mut req = request(
            DHCPREQUEST,
            vec![DhcpOption::ipv4(OPT_REQUESTED_IP, Ipv4Addr::new(10, 0, 0, 30))],
        );
        req.ciaddr = Ipv4Addr::new(10, 0, 0, 31);

        let ack = engine.handle_packet(&req).await.unwrap();
        assert_eq!(ack.msg_type(), Some(DHCPACK));
        assert_eq!(ack.yiaddr, Ipv4Addr::new(10, 0, 0, 31));
        assert_eq!(ack.ciaddr, Ipv4Addr::new(10, 0, 0, 31));
    }

    #[tokio::test]
    async fn test_filters() {
        let mut config = config();
        config.dhcp_broadcasts_only = true;
        let engine = engine(config);

        let mut unicast = request(DHCPDISCOVER, vec![]);
        unicast.flags = 0;
        assert!(engine.handle_packet(&unicast).await.is_none());

        let mut reply = request(DHCPDISCOVER, vec![]);
        reply.op = 2;
        assert!(engine.handle_packet(&reply).await.is_none());

        assert!(engine.handle_packet(&request(DHCPINFORM, vec![])).await.is_none());
    }

    #[tokio::test]
    async fn test_offer_emits_events() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.dhcp.subscribe();
        let engine = DhcpEngine::new(Arc::new(config()), NoProbe, events);

        engine.handle_packet(&request(DHCPDISCOVER, vec![])).await.unwrap();

        let client = "52:54:00:12:34:56".to_string();
        let ip = Ipv4Addr::new(10, 0, 0, 20);
        assert_eq!(
            rx.recv().await.unwrap(),
            DhcpEvent::Assigned { client: client.clone(), ip, previous: None }
        );
        assert_eq!(rx.recv().await.unwrap(), DhcpEvent::Offered { client, ip });
    }
}
