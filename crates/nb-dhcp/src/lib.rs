pub mod lease_store;
pub mod options;
pub mod packet;
pub mod pool;
pub mod probe;
pub mod server;
pub mod state_machine;

pub use lease_store::{Lease, LeaseStore};
pub use packet::{DhcpPacket, DhcpParseError};
pub use pool::AddressPool;
pub use probe::{IcmpProbe, LivenessProbe, NoProbe};
pub use server::DhcpServer;
pub use state_machine::DhcpEngine;

use std::sync::Arc;
use tokio::sync::RwLock;

/// Lease table shared with the operational interface
pub type SharedLeases = Arc<RwLock<LeaseStore>>;
