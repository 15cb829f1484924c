use std::{io, net::SocketAddr, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors surfaced by [`crate::client::StorageClient`] and everything built on it.
///
/// A compare that does not hold is not an error: CAS-style operations return
/// `Ok(false)` and lookups of missing keys return `Ok(None)`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to any of {endpoints:?} within {timeout:?}")]
    Connect {
        endpoints: Vec<String>,
        timeout: Duration,
        #[source]
        source: io::Error,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("I/O error talking to the store: {0}")]
    Io(#[from] io::Error),

    #[error("store closed the connection")]
    ConnectionClosed,

    #[error("store rejected request: {0}")]
    Server(String),

    #[error("unexpected response to {operation}: {response}")]
    UnexpectedResponse {
        operation: &'static str,
        response: String,
    },

    #[error("storage client is closed")]
    Closed,

    #[error("stored record under '{key}' is corrupted: {source}")]
    Corrupted {
        key: String,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to encode record for '{key}': {source}")]
    Encoding {
        key: String,
        #[source]
        source: bincode::Error,
    },

    #[error("lock '{key}' is not held by this mutex")]
    LockNotHeld { key: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("session lease {lease} expired")]
    SessionExpired { lease: u64 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors from starting or stopping a [`crate::node::StoreNode`].
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid cluster descriptor '{descriptor}': {reason}")]
    InvalidCluster { descriptor: String, reason: String },

    #[error("member '{member}' is not part of cluster '{descriptor}'")]
    NotAMember { member: String, descriptor: String },

    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("data directory {path:?}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("data directory {path:?} belongs to member '{found}', not '{expected}'")]
    MemberMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("snapshot {path:?} is unreadable: {reason}")]
    Snapshot { path: PathBuf, reason: String },

    #[error("node is already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("node task failed: {0}")]
    Task(String),
}

/// Errors from reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
}
