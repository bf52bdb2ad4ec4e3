//! Error types shared across the proxy.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Failure to decode an inbound client message.
///
/// These are never answered: without a trustworthy header there is no
/// transaction id to reply with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message too short ({0} bytes)")]
    TooShort(usize),

    #[error("message exceeds {limit} bytes ({len} bytes)")]
    Oversized { len: usize, limit: usize },

    #[error("message is a response, not a query")]
    NotAQuery,

    #[error("message is a query, not a response")]
    NotAResponse,

    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u8),

    #[error("expected exactly one question, got {0}")]
    QuestionCount(u16),

    #[error("malformed name at offset {0}")]
    BadName(usize),

    #[error("message truncated at offset {0}")]
    Truncated(usize),
}

/// Failure of a single upstream attempt.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{server} timed out after {timeout:?}")]
    Timeout { server: SocketAddr, timeout: Duration },

    #[error("{server} refused the query")]
    Refused { server: SocketAddr },

    #[error("{server} answered with rcode {rcode}")]
    Rcode { server: SocketAddr, rcode: u8 },

    #[error("{server} sent a truncated reply with no complete answer")]
    Truncated { server: SocketAddr },

    #[error("malformed response from {server}: {reason}")]
    Malformed { server: SocketAddr, reason: String },

    #[error("I/O error talking to {server}: {source}")]
    Io {
        server: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl UpstreamError {
    /// Short label used in logs and attempt reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Refused { .. } => "refused",
            Self::Rcode { .. } => "rcode",
            Self::Truncated { .. } => "truncated",
            Self::Malformed { .. } => "malformed",
            Self::Io { .. } => "io",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("no nameserver configured on this host")]
    NoNameserver,
}

/// Fatal proxy errors. Only startup can produce these.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
