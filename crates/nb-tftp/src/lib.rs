//! Read-only TFTP service for network boot clients.
//!
//! Implements RFC 1350 reads with the RFC 2347 option extension
//! (`blksize`, `tsize`). Write requests are always refused.

pub mod error;
pub mod packet;
pub mod path;
pub mod server;
pub mod session;
pub mod state_machine;

pub use error::{Result, TftpError};
pub use packet::{ErrorCode, Opcode, TftpPacket};
pub use server::TftpServer;
pub use session::{SessionTable, TftpSession};
pub use state_machine::TftpEngine;
