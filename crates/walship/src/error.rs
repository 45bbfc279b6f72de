//! Error types for WAL shipping.

use std::fmt;
use thiserror::Error;

/// Application-level failure reported by the peer cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The target table does not exist on the peer cluster.
    TableNotFound {
        /// Name of the missing table.
        table: String,
    },
    /// Any other remote-side failure.
    Other,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::TableNotFound { table } => write!(f, "table not found: {}", table),
            RemoteErrorKind::Other => write!(f, "remote failure"),
        }
    }
}

/// Errors that can occur while shipping entries to a peer cluster.
#[derive(Debug, Error)]
pub enum ShipError {
    /// The peer cluster rejected the call with an application error.
    #[error("error on the remote cluster ({kind}): {msg}")]
    Remote {
        /// What kind of remote failure this is.
        kind: RemoteErrorKind,
        /// Message returned by the peer.
        msg: String,
    },

    /// The call to a sink did not complete within the socket timeout.
    #[error("call to {sink} timed out after {timeout_ms}ms")]
    SocketTimeout {
        /// Address of the sink.
        sink: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The sink refused the connection or is unreachable.
    #[error("connection refused by {sink}")]
    ConnectionRefused {
        /// Address of the sink.
        sink: String,
    },

    /// Local or network failure that is not one of the above.
    #[error("transport error: {msg}")]
    Transport {
        /// Error message describing the failure.
        msg: String,
    },

    /// The sink directory has no healthy sink to hand out.
    #[error("no replication sinks are available")]
    NoSinksAvailable,

    /// A dispatch unit ended without producing a result (panicked or aborted).
    #[error("worker for sub-batch {ordinal} failed: {msg}")]
    WorkerFailed {
        /// Ordinal of the sub-batch the worker was shipping.
        ordinal: usize,
        /// Reason reported by the runtime.
        msg: String,
    },

    /// The shipper was stopped.
    #[error("shipper stopped")]
    Shutdown,

    /// Invalid or unreadable configuration.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Error message describing the problem.
        msg: String,
    },

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Backoff class a failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// A table is missing on the peer; shipping cannot proceed without losing data.
    MissingTable,
    /// The call timed out; the peer may be failing over.
    SocketTimeout,
    /// The sink is unreachable; the sink pool must be re-chosen.
    ConnectRefused,
    /// Any other local or network failure.
    Other,
}

impl FailureClass {
    /// Stable lowercase label, used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::MissingTable => "missing_table",
            FailureClass::SocketTimeout => "socket_timeout",
            FailureClass::ConnectRefused => "connect_refused",
            FailureClass::Other => "other",
        }
    }
}

impl ShipError {
    /// Classify this error into the backoff class it triggers.
    pub fn class(&self) -> FailureClass {
        match self {
            ShipError::Remote {
                kind: RemoteErrorKind::TableNotFound { .. },
                ..
            } => FailureClass::MissingTable,
            ShipError::Remote {
                kind: RemoteErrorKind::Other,
                ..
            } => FailureClass::Other,
            ShipError::SocketTimeout { .. } => FailureClass::SocketTimeout,
            ShipError::ConnectionRefused { .. } => FailureClass::ConnectRefused,
            ShipError::Transport { .. } => FailureClass::Other,
            ShipError::NoSinksAvailable => FailureClass::Other,
            ShipError::WorkerFailed { .. } => FailureClass::Other,
            ShipError::Shutdown => FailureClass::Other,
            ShipError::Config { .. } => FailureClass::Other,
            ShipError::Io(_) => FailureClass::Other,
        }
    }
}

/// Result alias for shipping operations.
pub type Result<T> = std::result::Result<T, ShipError>;
