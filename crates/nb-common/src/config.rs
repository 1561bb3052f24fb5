use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Boot server configuration shared (read-only) by the DHCP and TFTP services.
///
/// Addresses left at `0.0.0.0` mean "not configured". The file format is one
/// `key=value` pair per line; see [`KEYS`] for the persisted keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Interface the sockets are bound to (empty: any)
    pub network_interface: String,
    /// Address of this server on the boot network
    pub network_address: Ipv4Addr,

    pub dhcp_enabled: bool,
    pub dhcp_log_packets: bool,
    /// Send NAKs for requests outside the enforced subnet
    pub dhcp_authoritative: bool,
    pub dhcp_server_port: u16,
    pub dhcp_client_port: u16,
    pub dhcp_pool_address: Ipv4Addr,
    pub dhcp_pool_offset: u32,
    pub dhcp_pool_length: u32,
    pub dhcp_subnet_mask: Ipv4Addr,
    pub dhcp_enforce_subnet: bool,
    /// Drop requests that do not carry the broadcast flag
    pub dhcp_broadcasts_only: bool,
    /// Delay before each reply, in milliseconds
    pub dhcp_reply_delay: u64,
    pub dhcp_opt_time_server_address: Ipv4Addr,
    pub dhcp_opt_gateway_address: Ipv4Addr,
    pub dhcp_opt_dns_server_address: Ipv4Addr,
    pub dhcp_opt_dns_domain: String,
    pub dhcp_opt_boot_server_address: Ipv4Addr,

    pub tftp_enabled: bool,
    pub tftp_server_port: u16,
    pub tftp_log_packets: bool,
    pub tftp_root_folder: String,
    /// Follow small text files containing a relative path as if they were symlinks
    pub tftp_symlink_markers: bool,
    /// Idle session timeout, in seconds
    pub tftp_session_timeout: u64,

    /// Boot image offered to clients (relative to the TFTP root)
    pub boot_file: String,
    /// Advertised boot image size; 0 means "read it from disk"
    pub boot_file_size: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            network_interface: String::new(),
            network_address: Ipv4Addr::UNSPECIFIED,
            dhcp_enabled: true,
            dhcp_log_packets: false,
            dhcp_authoritative: true,
            dhcp_server_port: 67,
            dhcp_client_port: 68,
            dhcp_pool_address: Ipv4Addr::UNSPECIFIED,
            dhcp_pool_offset: 0,
            dhcp_pool_length: 0,
            dhcp_subnet_mask: Ipv4Addr::UNSPECIFIED,
            dhcp_enforce_subnet: true,
            dhcp_broadcasts_only: true,
            dhcp_reply_delay: 0,
            dhcp_opt_time_server_address: Ipv4Addr::UNSPECIFIED,
            dhcp_opt_gateway_address: Ipv4Addr::UNSPECIFIED,
            dhcp_opt_dns_server_address: Ipv4Addr::UNSPECIFIED,
            dhcp_opt_dns_domain: String::new(),
            dhcp_opt_boot_server_address: Ipv4Addr::UNSPECIFIED,
            tftp_enabled: true,
            tftp_server_port: 69,
            tftp_log_packets: false,
            tftp_root_folder: "/tftp".to_string(),
            tftp_symlink_markers: true,
            tftp_session_timeout: 300,
            boot_file: "pxelinux.0".to_string(),
            boot_file_size: 0,
        }
    }
}

/// How a configuration value is rendered in, and parsed from, a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Flag,
    Number,
    Text,
    /// Dotted-decimal IPv4 address
    Address,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Flag => "true/false",
            Format::Number => "a number",
            Format::Text => "text",
            Format::Address => "a dotted-decimal address",
        })
    }
}

/// Mutable view of one configuration field.
enum Slot<'a> {
    Flag(&'a mut bool),
    U16(&'a mut u16),
    U32(&'a mut u32),
    U64(&'a mut u64),
    Text(&'a mut String),
    Address(&'a mut Ipv4Addr),
}

impl Slot<'_> {
    fn format(&self) -> Format {
        match self {
            Slot::Flag(_) => Format::Flag,
            Slot::U16(_) | Slot::U32(_) | Slot::U64(_) => Format::Number,
            Slot::Text(_) => Format::Text,
            Slot::Address(_) => Format::Address,
        }
    }

    fn render(&self) -> String {
        match self {
            Slot::Flag(v) => v.to_string(),
            Slot::U16(v) => v.to_string(),
            Slot::U32(v) => v.to_string(),
            Slot::U64(v) => v.to_string(),
            Slot::Text(v) => v.to_string(),
            Slot::Address(v) => v.to_string(),
        }
    }

    /// Parse `raw` into the field. Returns `false` when the value does not fit the format.
    fn parse(&mut self, raw: &str) -> bool {
        match self {
            Slot::Flag(v) => match parse_flag(raw) {
                Some(b) => **v = b,
                None => return false,
            },
            Slot::U16(v) => match raw.parse() {
                Ok(n) => **v = n,
                Err(_) => return false,
            },
            Slot::U32(v) => match raw.parse() {
                Ok(n) => **v = n,
                Err(_) => return false,
            },
            Slot::U64(v) => match raw.parse() {
                Ok(n) => **v = n,
                Err(_) => return false,
            },
            Slot::Text(v) => **v = raw.to_string(),
            Slot::Address(v) => match raw.parse() {
                Ok(ip) => **v = ip,
                Err(_) => return false,
            },
        }
        true
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Declares the persisted keys once; the same table drives load and save.
macro_rules! schema {
    ($($key:ident => $slot:ident),* $(,)?) => {
        /// Every persisted configuration key, in file order.
        pub const KEYS: &[&str] = &[$(stringify!($key)),*];

        impl BootConfig {
            fn slot(&mut self, key: &str) -> Option<Slot<'_>> {
                match key {
                    $(stringify!($key) => Some(Slot::$slot(&mut self.$key)),)*
                    _ => None,
                }
            }
        }
    };
}

schema! {
    network_interface => Text,
    network_address => Address,
    dhcp_enabled => Flag,
    dhcp_log_packets => Flag,
    dhcp_authoritative => Flag,
    dhcp_server_port => U16,
    dhcp_client_port => U16,
    dhcp_pool_address => Address,
    dhcp_pool_offset => U32,
    dhcp_pool_length => U32,
    dhcp_subnet_mask => Address,
    dhcp_enforce_subnet => Flag,
    dhcp_broadcasts_only => Flag,
    dhcp_reply_delay => U64,
    dhcp_opt_time_server_address => Address,
    dhcp_opt_gateway_address => Address,
    dhcp_opt_dns_server_address => Address,
    dhcp_opt_dns_domain => Text,
    dhcp_opt_boot_server_address => Address,
    tftp_enabled => Flag,
    tftp_server_port => U16,
    tftp_log_packets => Flag,
    tftp_root_folder => Text,
    tftp_symlink_markers => Flag,
    tftp_session_timeout => U64,
    boot_file => Text,
    boot_file_size => U32,
}

impl BootConfig {
    /// Load the configuration from `path`, falling back to defaults when the
    /// file does not exist. Files ending in `.json` are read as JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        info!("Loading configuration from {}", path.display());
        if path.extension().is_some_and(|ext| ext == "json") {
            Ok(serde_json::from_str(&content)?)
        } else {
            Self::parse(&content)
        }
    }

    /// Parse `key=value` lines. Blank lines and `#` comments are skipped,
    /// unknown keys are reported and ignored.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!("Ignoring malformed config line {}: {}", index + 1, line);
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match config.slot(key) {
                Some(mut slot) => {
                    if !slot.parse(value) {
                        return Err(ConfigError::InvalidValue {
                            line: index + 1,
                            key: key.to_string(),
                            value: value.to_string(),
                            expected: slot.format(),
                        });
                    }
                    debug!("{} = {}", key, value);
                }
                None => warn!("Configuration key {} not found", key),
            }
        }

        Ok(config)
    }

    /// Render every schema key as `key=value` lines.
    pub fn render(&self) -> String {
        let mut copy = self.clone();
        let mut out = String::new();
        for key in KEYS {
            if let Some(slot) = copy.slot(key) {
                out.push_str(key);
                out.push('=');
                out.push_str(&slot.render());
                out.push('\n');
            }
        }
        out
    }

    /// Save the configuration to `path` (atomic write).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        let content = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(self)?
        } else {
            self.render()
        };

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, content).map_err(write_err)?;
        std::fs::rename(&tmp_path, path).map_err(write_err)?;
        Ok(())
    }

    /// Fill in the blanks left by the operator, logging every value chosen.
    pub fn autoconfigure(&mut self) {
        if self.dhcp_subnet_mask.is_unspecified() {
            self.dhcp_subnet_mask = Ipv4Addr::new(255, 255, 255, 0);
            info!("autoconfigure: dhcp_subnet_mask = {}", self.dhcp_subnet_mask);
        }
        if self.dhcp_pool_address.is_unspecified() {
            self.dhcp_pool_address =
                Ipv4Addr::from(u32::from(self.network_address) & u32::from(self.dhcp_subnet_mask));
            info!("autoconfigure: dhcp_pool_address = {}", self.dhcp_pool_address);
        }
        if self.dhcp_pool_offset == 0 {
            self.dhcp_pool_offset = 20;
            info!("autoconfigure: dhcp_pool_offset = {}", self.dhcp_pool_offset);
        }
        if self.dhcp_pool_length == 0 {
            self.dhcp_pool_length = 20;
            info!("autoconfigure: dhcp_pool_length = {}", self.dhcp_pool_length);
        }
        if self.tftp_root_folder.is_empty() {
            self.tftp_root_folder = "/tftp".to_string();
            info!("autoconfigure: tftp_root_folder = {}", self.tftp_root_folder);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dhcp_enabled && !self.tftp_enabled {
            return Err(ConfigError::Invalid(
                "no servers are enabled in the configuration".to_string(),
            ));
        }
        if self.network_address.is_unspecified() {
            return Err(ConfigError::Invalid(
                "network_address must be set to this server's address".to_string(),
            ));
        }
        if self.tftp_enabled && self.tftp_root_folder.is_empty() {
            return Err(ConfigError::Invalid("tftp_root_folder is empty".to_string()));
        }
        Ok(())
    }

    /// DHCP listens on the wildcard address: broadcasts are not delivered to
    /// sockets bound to a unicast address. The interface binding narrows it.
    pub fn dhcp_bind_addr(&self) -> SocketAddr {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.dhcp_server_port).into()
    }

    pub fn tftp_bind_addr(&self) -> SocketAddr {
        SocketAddrV4::new(self.network_address, self.tftp_server_port).into()
    }

    pub fn interface(&self) -> Option<&str> {
        if self.network_interface.is_empty() {
            None
        } else {
            Some(&self.network_interface)
        }
    }

    pub fn reply_delay(&self) -> Option<Duration> {
        (self.dhcp_reply_delay > 0).then(|| Duration::from_millis(self.dhcp_reply_delay))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.tftp_session_timeout)
    }
}
