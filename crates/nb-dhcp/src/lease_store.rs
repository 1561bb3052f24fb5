use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{info, warn};

/// A client → address binding. Leases never expire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub client: String,
    pub ip: Ipv4Addr,
}

/// Outcome of [`LeaseStore::assign`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Fresh,
    Reassigned { previous: Ipv4Addr },
    Unchanged,
}

/// Lease table indexed both ways
#[derive(Debug, Default)]
pub struct LeaseStore {
    by_client: HashMap<String, Ipv4Addr>,
    by_ip: HashMap<Ipv4Addr, String>,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address currently leased to `client`
    pub fn get(&self, client: &str) -> Option<Ipv4Addr> {
        self.by_client.get(client).copied()
    }

    /// Client holding `ip`
    pub fn holder(&self, ip: Ipv4Addr) -> Option<&str> {
        self.by_ip.get(&ip).map(String::as_str)
    }

    /// Record (or move) the lease of `client`.
    pub fn assign(&mut self, client: &str, ip: Ipv4Addr) -> Assignment {
        let previous = self.by_client.get(client).copied();
        if previous == Some(ip) {
            return Assignment::Unchanged;
        }

        if let Some(other) = self.by_ip.get(&ip).cloned() {
            warn!("{} was leased to {}, handing it to {}", ip, other, client);
            self.by_client.remove(&other);
        }
        if let Some(old_ip) = previous {
            self.by_ip.remove(&old_ip);
        }

        self.by_client.insert(client.to_string(), ip);
        self.by_ip.insert(ip, client.to_string());

        match previous {
            Some(previous) => {
                info!("Re-assigning {} to {} (was {})", ip, client, previous);
                Assignment::Reassigned { previous }
            }
            None => {
                info!("Assigning {} to {}", ip, client);
                Assignment::Fresh
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    /// All leases, sorted by address
    pub fn leases(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self
            .by_ip
            .iter()
            .map(|(ip, client)| Lease {
                client: client.clone(),
                ip: *ip,
            })
            .collect();
        leases.sort_by_key(|l| l.ip);
        leases
    }
}
