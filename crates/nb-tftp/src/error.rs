//! Error types for TFTP operations

use thiserror::Error;

use crate::packet::{ErrorCode, TftpPacket};

/// Error type for TFTP operations
#[derive(Debug, Error)]
pub enum TftpError {
    /// Malformed or truncated TFTP packet
    #[error("invalid TFTP packet: {0}")]
    InvalidPacket(String),

    /// Requested file does not exist under the root
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Operation refused by this server
    #[error("access violation: {0}")]
    AccessViolation(String),

    /// Acknowledgment with no transfer in progress
    #[error("no transfer in progress")]
    UnknownTransfer,

    /// Symlink-marker chain longer than the hop limit
    #[error("too many symbolic link hops resolving {0}")]
    TooManyHops(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for TFTP operations
pub type Result<T> = std::result::Result<T, TftpError>;

impl TftpError {
    /// Wire error code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            TftpError::InvalidPacket(_) => ErrorCode::IllegalOperation,
            TftpError::FileNotFound(_) => ErrorCode::FileNotFound,
            TftpError::AccessViolation(_) => ErrorCode::AccessViolation,
            TftpError::UnknownTransfer => ErrorCode::UnknownTransferId,
            TftpError::TooManyHops(_) => ErrorCode::NotDefined,
            TftpError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            TftpError::Io(_) => ErrorCode::NotDefined,
        }
    }

    /// Error packet carrying this error
    pub fn to_packet(&self) -> TftpPacket {
        let message = match self {
            TftpError::AccessViolation(m) => m.clone(),
            TftpError::TooManyHops(_) => "too many symbolic link hops".to_string(),
            TftpError::Io(e) => e.to_string(),
            other => other.to_string(),
        };
        TftpPacket::error(self.code(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TftpError::FileNotFound("pxelinux.0".to_string());
        assert_eq!(err.to_string(), "file not found: pxelinux.0");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TftpError::FileNotFound("x".into()).code(), ErrorCode::FileNotFound);
        assert_eq!(TftpError::AccessViolation("x".into()).code(), ErrorCode::AccessViolation);

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(TftpError::from(missing).code(), ErrorCode::FileNotFound);

        let other = std::io::Error::other("disk on fire");
        let packet = TftpError::from(other).to_packet();
        assert_eq!(
            packet,
            TftpPacket::error(ErrorCode::NotDefined, "disk on fire")
        );
    }

    #[test]
    fn test_io_failures_other_than_not_found_are_undefined() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "Permission denied");
        assert_eq!(
            TftpError::from(denied).to_packet(),
            TftpPacket::error(ErrorCode::NotDefined, "Permission denied")
        );
    }

    #[test]
    fn test_access_violation_carries_bare_message() {
        let packet = TftpError::AccessViolation("Writing is not implemented on this server".into())
            .to_packet();
        assert_eq!(
            packet,
            TftpPacket::error(
                ErrorCode::AccessViolation,
                "Writing is not implemented on this server"
            )
        );
    }

    #[test]
    fn test_hop_limit_message() {
        let packet = TftpError::TooManyHops("a/b".into()).to_packet();
        assert_eq!(
            packet,
            TftpPacket::error(ErrorCode::NotDefined, "too many symbolic link hops")
        );
    }
}
