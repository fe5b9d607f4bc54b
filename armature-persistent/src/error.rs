//! Persistent pool error types.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Usage history of the connection a failed request ran on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// Process-unique key of the connection.
    pub connection: u64,
    /// Attempts made on the connection since it was last (re)started.
    pub requests: u64,
    /// Time since the connection was last used, `None` if never.
    pub idle: Option<Duration>,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "after {} requests on connection #{}",
            self.requests, self.connection
        )?;
        match self.idle {
            Some(idle) => write!(f, ", last used {:.3}s ago", idle.as_secs_f64()),
            None => write!(f, ", never used before"),
        }
    }
}

/// Persistent pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Invalid configuration value, e.g. a malformed proxy.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The transport could not be started.
    #[error("Connection to {address} failed: {source}")]
    Connect {
        /// `host:port` that was dialed.
        address: String,
        /// Underlying cause.
        source: io::Error,
    },

    /// The peer sent a malformed response and no retry was left.
    #[error("Too many bad responses ({message}) {diagnostics}")]
    BadResponse {
        /// Parser message for the last bad response.
        message: String,
        /// Connection usage at the time of failure.
        diagnostics: Diagnostics,
    },

    /// The connection failed mid-request and no retry was left.
    #[error("Too many connection resets (due to {source}) {diagnostics}")]
    Reset {
        /// Underlying I/O, timeout or TLS failure.
        source: io::Error,
        /// Connection usage at the time of failure.
        diagnostics: Diagnostics,
    },

    /// A body could not be encoded or decoded.
    #[error("Body error: {0}")]
    Decode(String),

    /// TLS client setup failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The destination URL cannot be used.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// I/O error outside a request, e.g. reading certificate files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PoolError {
    /// Check if this is a connection start failure.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    /// Check if the request failed with a connection reset.
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset { .. })
    }

    /// Check if the request failed with a malformed response.
    pub fn is_bad_response(&self) -> bool {
        matches!(self, Self::BadResponse { .. })
    }

    /// Check if the underlying failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Reset { source, .. } | Self::Connect { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Connection usage for request failures.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            Self::BadResponse { diagnostics, .. } | Self::Reset { diagnostics, .. } => {
                Some(diagnostics)
            }
            _ => None,
        }
    }
}
