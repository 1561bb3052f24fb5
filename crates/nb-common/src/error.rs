use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::Format;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write configuration {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line {line}: invalid value {value:?} for {key} (expected {expected})")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
        expected: Format,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{service}: failed to bind {addr}: {source}")]
    Bind {
        service: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{service}: socket setup failed: {source}")]
    Socket {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{service}: service task aborted: {reason}")]
    Aborted { service: String, reason: String },
}
