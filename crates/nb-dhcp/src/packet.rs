//! DHCPv4 packet parser/serializer (RFC 2131)

use std::fmt::Write;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::options::{
    self, DhcpOption, OPT_CLIENT_ID, OPT_HOSTNAME, OPT_MSG_TYPE, OPT_PARAM_REQUEST,
    OPT_REQUESTED_IP, OPT_SERVER_ID,
};

/// DHCP magic cookie
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

/// Broadcast bit of the flags field
pub const FLAG_BROADCAST: u16 = 0x8000;

/// Fixed BOOTP header, magic cookie excluded
const HEADER_LEN: usize = 236;
const MIN_PACKET_LEN: usize = HEADER_LEN + MAGIC_COOKIE.len();
/// Conventional BOOTP minimum size of a sent packet
const MIN_ENCODED_LEN: usize = 300;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DhcpParseError {
    #[error("Packet too short: {0} bytes (minimum 240)")]
    TooShort(usize),
    #[error("Invalid magic cookie")]
    InvalidMagic,
    #[error("Option {code} at offset {offset} runs past the end of the packet")]
    TruncatedOption { code: u8, offset: usize },
}

/// Parsed DHCPv4 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

fn read_ipv4(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

/// NUL-terminated text of a fixed-width field
fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Copy `value` into a fixed-width field, keeping room for the NUL terminator.
fn set_field(field: &mut [u8], value: &str) {
    field.fill(0);
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len() - 1);
    field[..len].copy_from_slice(&bytes[..len]);
}

impl DhcpPacket {
    /// Parse a DHCP packet from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self, DhcpParseError> {
        if data.len() < MIN_PACKET_LEN {
            return Err(DhcpParseError::TooShort(data.len()));
        }

        // Verify magic cookie at offset 236
        if data[HEADER_LEN..MIN_PACKET_LEN] != MAGIC_COOKIE {
            return Err(DhcpParseError::InvalidMagic);
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        let options = options::parse_options(&data[MIN_PACKET_LEN..])?;

        Ok(DhcpPacket {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: read_ipv4(data, 12),
            yiaddr: read_ipv4(data, 16),
            siaddr: read_ipv4(data, 20),
            giaddr: read_ipv4(data, 24),
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(576);

        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
        buf.extend_from_slice(&MAGIC_COOKIE);

        let opt_bytes = options::encode_options(&self.options);
        buf.extend_from_slice(&opt_bytes);

        if buf.len() < MIN_ENCODED_LEN {
            buf.resize(MIN_ENCODED_LEN, 0);
        }

        buf
    }

    /// Hardware address bytes, `hlen` clamped to the field width
    pub fn mac_bytes(&self) -> &[u8] {
        let len = self.hlen.min(16) as usize;
        &self.chaddr[..len]
    }

    /// Get MAC address as a formatted string (aa:bb:cc:dd:ee:ff)
    pub fn mac_str(&self) -> String {
        let mut out = String::with_capacity(self.mac_bytes().len() * 3);
        for (i, b) in self.mac_bytes().iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            let _ = write!(out, "{:02x}", b);
        }
        out
    }

    pub fn server_name(&self) -> String {
        field_str(&self.sname)
    }

    pub fn boot_file(&self) -> String {
        field_str(&self.file)
    }

    /// Set the legacy server-name field (truncated to 63 bytes)
    pub fn set_server_name(&mut self, name: &str) {
        set_field(&mut self.sname, name);
    }

    /// Set the legacy boot-file field (truncated to 127 bytes)
    pub fn set_boot_file(&mut self, name: &str) {
        set_field(&mut self.file, name);
    }

    /// Find option by code
    pub fn get_option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|o| o.code == code)
    }

    /// Get DHCP message type
    pub fn msg_type(&self) -> Option<u8> {
        self.get_option(OPT_MSG_TYPE)?.as_u8()
    }

    /// Get requested IP address
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_REQUESTED_IP)?.as_ipv4()
    }

    /// Get server identifier
    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_SERVER_ID)?.as_ipv4()
    }

    /// Get hostname
    pub fn hostname(&self) -> Option<String> {
        Some(self.get_option(OPT_HOSTNAME)?.as_str()).filter(|h| !h.is_empty())
    }

    /// Codes listed in the parameter request list
    pub fn parameter_requests(&self) -> &[u8] {
        self.get_option(OPT_PARAM_REQUEST)
            .map(|o| o.data.as_slice())
            .unwrap_or_default()
    }

    /// Client identifier to echo back: the client's own option when it sent
    /// a non-empty one, else its hardware address.
    pub fn client_identifier(&self) -> DhcpOption {
        match self.get_option(OPT_CLIENT_ID) {
            Some(opt) if !opt.data.is_empty() => opt.clone(),
            _ => DhcpOption::new(OPT_CLIENT_ID, self.mac_bytes().to_vec()),
        }
    }

    /// Check if broadcast flag is set
    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    /// Build a broadcast reply packet from this request.
    pub fn build_reply(
        &self,
        msg_type: u8,
        yiaddr: Ipv4Addr,
        siaddr: Ipv4Addr,
        ciaddr: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> DhcpPacket {
        DhcpPacket {
            op: BOOTREPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: FLAG_BROADCAST,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: {
                let mut opts = vec![DhcpOption::msg_type(msg_type)];
                opts.extend(options);
                opts
            },
        }
    }

    /// Multi-line dump of the packet, for packet logging.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "op={} htype={} hlen={} hops={} xid={:08x} secs={} flags={:04x}",
            self.op, self.htype, self.hlen, self.hops, self.xid, self.secs, self.flags
        );
        let _ = writeln!(
            out,
            "ciaddr={} yiaddr={} siaddr={} giaddr={} chaddr={}",
            self.ciaddr,
            self.yiaddr,
            self.siaddr,
            self.giaddr,
            self.mac_str()
        );
        let _ = writeln!(out, "sname={:?} file={:?}", self.server_name(), self.boot_file());
        for opt in &self.options {
            let _ = write!(out, "  {:3} {:<26} len={:<3}", opt.code, options::option_name(opt.code), opt.data.len());
            if let Some(ip) = opt.as_ipv4() {
                let _ = write!(out, " {}", ip);
            } else if let Some(t) = opt.as_u8() {
                let _ = write!(out, " {}", t);
            } else {
                for b in &opt.data {
                    let _ = write!(out, " {:02x}", b);
                }
            }
            out.push('\n');
        }
        out
    }
}
