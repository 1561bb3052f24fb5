use nb_common::BootConfig;
use std::net::Ipv4Addr;
use tracing::debug;

use crate::lease_store::LeaseStore;
use crate::probe::LivenessProbe;

/// Window of addresses handed out to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    pub base: Ipv4Addr,
    pub offset: u32,
    pub length: u32,
    pub mask: Ipv4Addr,
    pub enforce_subnet: bool,
    /// Address of this server, never handed out
    pub server: Ipv4Addr,
}

impl AddressPool {
    pub fn from_config(config: &BootConfig) -> Self {
        Self {
            base: config.dhcp_pool_address,
            offset: config.dhcp_pool_offset,
            length: config.dhcp_pool_length,
            mask: config.dhcp_subnet_mask,
            enforce_subnet: config.dhcp_enforce_subnet,
            server: config.network_address,
        }
    }

    /// Pool addresses in ascending order: `[base+offset, base+offset+length)`
    pub fn window(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let start = u32::from(self.base).saturating_add(self.offset);
        let end = start.saturating_add(self.length);
        (start..end).map(Ipv4Addr::from)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let start = u32::from(self.base).saturating_add(self.offset);
        let end = start.saturating_add(self.length);
        (start..end).contains(&u32::from(ip))
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) & u32::from(self.mask))
    }

    /// Is `ip` on the served subnet? Always true when enforcement is off.
    pub fn is_valid(&self, ip: Ipv4Addr) -> bool {
        if !self.enforce_subnet {
            return true;
        }
        let mask = u32::from(self.mask);
        u32::from(ip) & mask == u32::from(self.base) & mask
    }

    /// Can `ip` be given to `client`?
    ///
    /// Leased to `client`: yes. Leased to someone else: no. Otherwise the
    /// address must not be ours and the probe must find nobody on it.
    pub async fn is_available<P: LivenessProbe>(
        &self,
        leases: &LeaseStore,
        probe: &P,
        ip: Ipv4Addr,
        client: &str,
    ) -> bool {
        if let Some(holder) = leases.holder(ip) {
            return holder == client;
        }
        if ip == self.server {
            return false;
        }
        if probe.is_alive(ip).await {
            debug!("{} answered the liveness probe", ip);
            return false;
        }
        true
    }

    /// Existing lease of `client`, else the first available pool address.
    pub async fn allocate<P: LivenessProbe>(
        &self,
        leases: &LeaseStore,
        probe: &P,
        client: &str,
    ) -> Option<Ipv4Addr> {
        if let Some(ip) = leases.get(client) {
            return Some(ip);
        }

        for ip in self.window() {
            if self.is_available(leases, probe, ip, client).await {
                return Some(ip);
            }
        }
        None
    }
}
