use std::io;

use thiserror::Error;

use crate::syslog::Format;

/// Errors detected while loading or validating the configuration. They are fatal to startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid target address \"{0}\"")]
    InvalidAddress(String),
    #[error("cannot resolve \"{host}\": {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("unsupported protocol \"{0}\" (expected tcp or udp)")]
    UnsupportedProtocol(String),
    #[error("unsupported syslog format \"{0}\" (expected rfc3164 or rfc5424)")]
    UnsupportedFormat(String),
    #[error("invalid source address \"{0}\": only IPv4 can be spoofed")]
    InvalidSourceIp(String),
    #[error("{field} must be in {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: String,
        range: &'static str,
    },
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("data file {0} has no line to send")]
    EmptyDataFile(String),
    #[error("malformed configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse failure classes, used to break down the failed sends in the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Handshake,
    Io,
    Pool,
    Privilege,
}

impl FailureKind {
    pub const ALL: [FailureKind; 4] = [
        FailureKind::Handshake,
        FailureKind::Io,
        FailureKind::Pool,
        FailureKind::Privilege,
    ];
}

/// Errors raised on the delivery path. All of them are absorbed by the dispatcher.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("raw socket creation denied ({0}); root or CAP_NET_RAW is required to spoof")]
    Privilege(#[source] io::Error),
    #[error("no valid SYN+ACK received after {attempts} attempts")]
    HandshakeTimeout { attempts: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("connection is closed")]
    Closed,
    #[error("spoofed connections are send-only")]
    ReadUnsupported,
}

impl SendError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SendError::Privilege(_) => FailureKind::Privilege,
            SendError::HandshakeTimeout { .. } => FailureKind::Handshake,
            SendError::PoolClosed => FailureKind::Pool,
            SendError::Io(_) | SendError::Closed | SendError::ReadUnsupported => FailureKind::Io,
        }
    }

    /// Build the error returned by a failed raw socket creation.
    pub fn from_socket_creation(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::PermissionDenied || e.raw_os_error() == Some(libc::EPERM) {
            SendError::Privilege(e)
        } else {
            SendError::Io(e)
        }
    }
}

/// Any error ending a run
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A syslog line that could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line does not match the {format} layout")]
    NoMatch { format: Format },
    #[error("invalid {format} timestamp \"{value}\"")]
    InvalidTimestamp { format: Format, value: String },
    #[error("priority {0} is out of range (0-191)")]
    InvalidPriority(u32),
}
