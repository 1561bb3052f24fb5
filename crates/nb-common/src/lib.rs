pub mod config;
pub mod error;
pub mod events;
pub mod service;

pub use config::BootConfig;
pub use error::{ConfigError, ServiceError};
pub use events::EventBus;
pub use service::{DatagramHandler, Reply, ServiceHandle, ServiceOptions, ServiceState, UdpService};
