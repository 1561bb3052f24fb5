//! TFTP packet handling
//!
//! Parsing and building of TFTP packets according to RFC 1350, with the
//! option extension of RFC 2347 (option names are case-insensitive and are
//! stored lowercased, in the order received).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{Result, TftpError};

pub const OPTION_BLOCK_SIZE: &str = "blksize";
pub const OPTION_TRANSFER_SIZE: &str = "tsize";

/// TFTP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    /// Read request
    Rrq = 1,
    /// Write request
    Wrq = 2,
    /// Data packet
    Data = 3,
    /// Acknowledgment
    Ack = 4,
    /// Error
    Error = 5,
    /// Option acknowledgment (RFC 2347)
    Oack = 6,
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(TftpError::InvalidPacket(format!("unknown opcode: {}", value))),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Opcode::Rrq => "Read request (RRQ)",
            Opcode::Wrq => "Write request (WRQ)",
            Opcode::Data => "Data (DATA)",
            Opcode::Ack => "Acknowledgment (ACK)",
            Opcode::Error => "Error (ERROR)",
            Opcode::Oack => "Option acknowledgment (OACK)",
        })
    }
}

/// TFTP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Not defined, see error message
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    /// Option negotiation failed (RFC 2347)
    OptionNegotiationFailed = 8,
}

impl ErrorCode {
    /// Unknown codes map to `NotDefined`
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiationFailed,
            _ => ErrorCode::NotDefined,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined, see error message (if any)",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::OptionNegotiationFailed => "Option negotiation error",
        }
    }
}

/// Ordered `(name, value)` option pairs
pub type TftpOptions = Vec<(String, String)>;

/// TFTP packet types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    /// Read request
    ReadRequest {
        filename: String,
        mode: String,
        options: TftpOptions,
    },
    /// Write request
    WriteRequest {
        filename: String,
        mode: String,
        options: TftpOptions,
    },
    /// Data packet
    Data { block: u16, data: Bytes },
    /// Acknowledgment
    Ack { block: u16 },
    /// Error
    Error { code: ErrorCode, message: String },
    /// Option acknowledgment
    Oack { options: TftpOptions },
}

/// Read a NUL-terminated string. `None` when no terminator is left.
fn read_string(buf: &mut &[u8]) -> Option<String> {
    let end = buf.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Some(s)
}

/// Key/value pairs until the buffer is exhausted. A trailing unterminated
/// string is accepted as the last value.
fn read_options(mut buf: &[u8]) -> TftpOptions {
    let mut options = Vec::new();
    while buf.has_remaining() {
        let key = match read_string(&mut buf) {
            Some(k) if !k.is_empty() => k.to_lowercase(),
            _ => break,
        };
        let value = match read_string(&mut buf) {
            Some(v) => v,
            None => {
                let v = String::from_utf8_lossy(buf).into_owned();
                buf.advance(buf.len());
                v
            }
        };
        options.push((key, value));
    }
    options
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_options(buf: &mut BytesMut, options: &TftpOptions) {
    for (key, value) in options {
        put_string(buf, key);
        put_string(buf, value);
    }
}

impl TftpPacket {
    /// Parse a TFTP packet from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(TftpError::InvalidPacket("packet too short".to_string()));
        }

        let mut buf = data;
        let opcode = Opcode::try_from(buf.get_u16())?;

        match opcode {
            Opcode::Rrq => Self::parse_request(buf, false),
            Opcode::Wrq => Self::parse_request(buf, true),
            Opcode::Data => Self::parse_data(buf),
            Opcode::Ack => Self::parse_ack(buf),
            Opcode::Error => Self::parse_error(buf),
            Opcode::Oack => Ok(TftpPacket::Oack {
                options: read_options(buf),
            }),
        }
    }

    fn parse_request(mut buf: &[u8], is_write: bool) -> Result<Self> {
        let filename = read_string(&mut buf)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| TftpError::InvalidPacket("missing filename".to_string()))?;
        let mode = read_string(&mut buf)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| TftpError::InvalidPacket("missing mode".to_string()))?
            .to_lowercase();
        let options = read_options(buf);

        if is_write {
            Ok(TftpPacket::WriteRequest {
                filename,
                mode,
                options,
            })
        } else {
            Ok(TftpPacket::ReadRequest {
                filename,
                mode,
                options,
            })
        }
    }

    fn parse_data(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(TftpError::InvalidPacket("data packet too short".to_string()));
        }
        let block = buf.get_u16();
        Ok(TftpPacket::Data {
            block,
            data: Bytes::copy_from_slice(buf),
        })
    }

    fn parse_ack(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(TftpError::InvalidPacket("ack packet too short".to_string()));
        }
        Ok(TftpPacket::Ack {
            block: buf.get_u16(),
        })
    }

    fn parse_error(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(TftpError::InvalidPacket("error packet too short".to_string()));
        }
        let code = ErrorCode::from_u16(buf.get_u16());
        let message = match read_string(&mut buf) {
            Some(m) => m,
            None => String::from_utf8_lossy(buf).into_owned(),
        };
        Ok(TftpPacket::Error { code, message })
    }

    /// Encode the packet to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.opcode() as u16);

        match self {
            TftpPacket::ReadRequest {
                filename,
                mode,
                options,
            }
            | TftpPacket::WriteRequest {
                filename,
                mode,
                options,
            } => {
                put_string(&mut buf, filename);
                put_string(&mut buf, mode);
                put_options(&mut buf, options);
            }
            TftpPacket::Data { block, data } => {
                buf.put_u16(*block);
                buf.put_slice(data);
            }
            TftpPacket::Ack { block } => {
                buf.put_u16(*block);
            }
            TftpPacket::Error { code, message } => {
                buf.put_u16(*code as u16);
                put_string(&mut buf, message);
            }
            TftpPacket::Oack { options } => {
                put_options(&mut buf, options);
            }
        }

        buf.freeze()
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            TftpPacket::ReadRequest { .. } => Opcode::Rrq,
            TftpPacket::WriteRequest { .. } => Opcode::Wrq,
            TftpPacket::Data { .. } => Opcode::Data,
            TftpPacket::Ack { .. } => Opcode::Ack,
            TftpPacket::Error { .. } => Opcode::Error,
            TftpPacket::Oack { .. } => Opcode::Oack,
        }
    }

    /// First value of option `name` (lowercase) on a request or OACK
    pub fn option(&self, name: &str) -> Option<&str> {
        let options = match self {
            TftpPacket::ReadRequest { options, .. }
            | TftpPacket::WriteRequest { options, .. }
            | TftpPacket::Oack { options } => options,
            _ => return None,
        };
        options
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Create an error packet
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        TftpPacket::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a data packet
    pub fn data(block: u16, data: impl Into<Bytes>) -> Self {
        TftpPacket::Data {
            block,
            data: data.into(),
        }
    }

    /// Create an ACK packet
    pub fn ack(block: u16) -> Self {
        TftpPacket::Ack { block }
    }

    /// Create an OACK packet
    pub fn oack(options: TftpOptions) -> Self {
        TftpPacket::Oack { options }
    }
}
