use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tokio::sync::broadcast;

use crate::service::ServiceState;

/// Event bus shared by the boot services.
///
/// Sends never fail the caller: an event published while nobody is
/// subscribed is simply dropped.
pub struct EventBus {
    /// Lease decisions (dhcp → operators)
    pub dhcp: broadcast::Sender<DhcpEvent>,
    /// Transfer progress (tftp → operators)
    pub tftp: broadcast::Sender<TftpEvent>,
    /// Service lifecycle transitions
    pub service: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            dhcp: broadcast::channel(256).0,
            tftp: broadcast::channel(256).0,
            service: broadcast::channel(32).0,
        }
    }

    pub fn dhcp(&self, event: DhcpEvent) {
        let _ = self.dhcp.send(event);
    }

    pub fn tftp(&self, event: TftpEvent) {
        let _ = self.tftp.send(event);
    }

    pub fn service(&self, name: &str, state: ServiceState) {
        let _ = self.service.send(ServiceEvent {
            service: name.to_string(),
            state,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DhcpEvent {
    Offered { client: String, ip: Ipv4Addr },
    Acknowledged { client: String, ip: Ipv4Addr },
    NakSent { client: String, reason: String },
    /// A lease was recorded; `previous` is set when the client moved address
    Assigned { client: String, ip: Ipv4Addr, previous: Option<Ipv4Addr> },
    PoolExhausted { client: String },
    Ignored { client: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TftpEvent {
    TransferStarted { client: Ipv4Addr, path: String, size: u64, block_size: u16 },
    TransferCompleted { client: Ipv4Addr, path: String, blocks: u64 },
    ErrorSent { client: Ipv4Addr, code: u16, message: String },
    SessionsPruned { count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub service: String,
    pub state: ServiceState,
}
