use std::net::Ipv4Addr;

use crate::packet::DhcpParseError;

/// DHCP option codes (RFC 2132)
pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_TIME_SERVER: u8 = 4;
pub const OPT_DNS_SERVER: u8 = 6;
pub const OPT_HOSTNAME: u8 = 12;
pub const OPT_BOOT_FILE_SIZE: u8 = 13;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MSG_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST: u8 = 55;
pub const OPT_RENEWAL_TIME: u8 = 58;
pub const OPT_REBINDING_TIME: u8 = 59;
pub const OPT_CLIENT_ID: u8 = 61;
pub const OPT_TFTP_SERVER: u8 = 66;
pub const OPT_BOOT_FILE_NAME: u8 = 67;
pub const OPT_END: u8 = 255;

/// DHCP message types
pub const DHCPDISCOVER: u8 = 1;
pub const DHCPOFFER: u8 = 2;
pub const DHCPREQUEST: u8 = 3;
pub const DHCPDECLINE: u8 = 4;
pub const DHCPACK: u8 = 5;
pub const DHCPNAK: u8 = 6;
pub const DHCPRELEASE: u8 = 7;
pub const DHCPINFORM: u8 = 8;

/// Largest payload a single option can carry (one length byte).
pub const MAX_OPTION_LEN: usize = 255;

/// A parsed DHCP option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl DhcpOption {
    pub fn new(code: u8, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    pub fn msg_type(t: u8) -> Self {
        Self::new(OPT_MSG_TYPE, vec![t])
    }

    pub fn ipv4(code: u8, ip: Ipv4Addr) -> Self {
        Self::new(code, ip.octets().to_vec())
    }

    pub fn u32(code: u8, value: u32) -> Self {
        Self::new(code, value.to_be_bytes().to_vec())
    }

    pub fn text(code: u8, value: &str) -> Self {
        Self::new(code, value.as_bytes().to_vec())
    }

    /// String payload followed by a NUL byte
    pub fn nul_terminated(code: u8, value: &str) -> Self {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        Self::new(code, data)
    }

    pub fn server_id(ip: Ipv4Addr) -> Self {
        Self::ipv4(OPT_SERVER_ID, ip)
    }

    pub fn lease_time(secs: u32) -> Self {
        Self::u32(OPT_LEASE_TIME, secs)
    }

    pub fn renewal_time(secs: u32) -> Self {
        Self::u32(OPT_RENEWAL_TIME, secs)
    }

    pub fn rebinding_time(secs: u32) -> Self {
        Self::u32(OPT_REBINDING_TIME, secs)
    }

    /// Extract IPv4 address from option data
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.data.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// Extract u32 from option data
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Extract u8 from option data
    pub fn as_u8(&self) -> Option<u8> {
        match self.data.as_slice() {
            [b] => Some(*b),
            _ => None,
        }
    }

    /// Text up to the first NUL byte
    pub fn as_str(&self) -> String {
        let end = self.data.iter().position(|&b| b == 0).unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}

/// Parse DHCP options from bytes (after magic cookie).
///
/// Pad bytes are skipped; parsing stops at the end marker or at the end of
/// the buffer. An option whose length runs past the buffer is an error.
pub fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>, DhcpParseError> {
    let mut options = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let code = data[i];
        if code == OPT_END {
            break;
        }
        if code == OPT_PAD {
            i += 1;
            continue;
        }

        let Some(&len) = data.get(i + 1) else {
            return Err(DhcpParseError::TruncatedOption { code, offset: i });
        };
        let start = i + 2;
        let end = start + len as usize;
        if end > data.len() {
            return Err(DhcpParseError::TruncatedOption { code, offset: i });
        }

        options.push(DhcpOption::new(code, data[start..end].to_vec()));
        i = end;
    }

    Ok(options)
}

/// Encode DHCP options to bytes, followed by the end marker.
///
/// Odd-length payloads are followed by one pad byte. Payloads longer than
/// 255 bytes are cut.
pub fn encode_options(options: &[DhcpOption]) -> Vec<u8> {
    let mut buf = Vec::new();
    for opt in options {
        let data = &opt.data[..opt.data.len().min(MAX_OPTION_LEN)];
        buf.push(opt.code);
        buf.push(data.len() as u8);
        buf.extend_from_slice(data);
        if data.len() % 2 == 1 {
            buf.push(OPT_PAD);
        }
    }
    buf.push(OPT_END);
    buf
}

/// Human-readable option name, for packet logs.
pub fn option_name(code: u8) -> &'static str {
    match code {
        0 => "Pad",
        1 => "Subnet Mask",
        2 => "Time Offset",
        3 => "Router",
        4 => "Time Server",
        5 => "Name Server",
        6 => "Domain Name Server",
        7 => "Log Server",
        12 => "Host Name",
        13 => "Boot File Size",
        15 => "Domain Name",
        17 => "Root Path",
        23 => "Default IP TTL",
        26 => "Interface MTU",
        28 => "Broadcast Address",
        42 => "NTP Servers",
        43 => "Vendor Specific",
        50 => "Requested IP Address",
        51 => "IP Address Lease Time",
        53 => "DHCP Message Type",
        54 => "Server Identifier",
        55 => "Parameter Request List",
        56 => "Message",
        57 => "Maximum DHCP Message Size",
        58 => "Renewal (T1) Time",
        59 => "Rebinding (T2) Time",
        60 => "Vendor Class Identifier",
        61 => "Client Identifier",
        66 => "TFTP Server Name",
        67 => "Bootfile Name",
        93 => "Client System Architecture",
        94 => "Client Network Interface",
        97 => "Client Machine Identifier",
        116 => "Auto-Configure",
        255 => "End",
        _ => "Unknown",
    }
}

pub fn message_type_name(t: u8) -> &'static str {
    match t {
        DHCPDISCOVER => "DHCPDISCOVER",
        DHCPOFFER => "DHCPOFFER",
        DHCPREQUEST => "DHCPREQUEST",
        DHCPDECLINE => "DHCPDECLINE",
        DHCPACK => "DHCPACK",
        DHCPNAK => "DHCPNAK",
        DHCPRELEASE => "DHCPRELEASE",
        DHCPINFORM => "DHCPINFORM",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odd_payloads_are_padded() {
        let encoded = encode_options(&[
            DhcpOption::msg_type(DHCPOFFER),
            DhcpOption::server_id(Ipv4Addr::new(10, 0, 0, 1)),
        ]);
        assert_eq!(encoded, vec![53, 1, 2, 0, 54, 4, 10, 0, 0, 1, 255]);
    }

    #[test]
    fn test_parse_skips_pad_and_stops_at_end() {
        let data = [53, 1, 1, 0, 0, 50, 4, 10, 0, 0, 9, 255, 12, 1, b'x'];
        let options = parse_options(&data).unwrap();
        assert_eq!(options.len(), 2);
        assert_eq!(options[1].as_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 9)));
    }

    #[test]
    fn test_parse_without_end_marker() {
        let options = parse_options(&[53, 1, 3]).unwrap();
        assert_eq!(options, vec![DhcpOption::msg_type(DHCPREQUEST)]);
    }

    #[test]
    fn test_truncated_option() {
        assert!(matches!(
            parse_options(&[53, 1, 1, 12, 10, b'a']),
            Err(DhcpParseError::TruncatedOption { code: 12, offset: 3 })
        ));
        assert!(parse_options(&[53]).is_err());
    }

    #[test]
    fn test_payload_capped() {
        let long = DhcpOption::new(OPT_HOSTNAME, vec![b'a'; 300]);
        let encoded = encode_options(&[long]);
        assert_eq!(encoded[1], 255);
        // 255 is odd: one pad byte, then the end marker
        assert_eq!(encoded.len(), 2 + 255 + 1 + 1);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(DhcpOption::lease_time(864000).as_u32(), Some(864000));
        assert_eq!(DhcpOption::nul_terminated(OPT_BOOT_FILE_NAME, "pxelinux.0").as_str(), "pxelinux.0");
        assert_eq!(DhcpOption::new(OPT_MSG_TYPE, vec![1, 2]).as_u8(), None);
        assert_eq!(option_name(OPT_TFTP_SERVER), "TFTP Server Name");
        assert_eq!(message_type_name(DHCPNAK), "DHCPNAK");
    }
}
