//! Error types for sandbox-net

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::command::CommandError;

/// Errors that can occur in the host networking layer
#[derive(Error, Debug)]
pub enum NetError {
    /// Every usable address in the subnet is leased
    #[error("IP pool exhausted: all {capacity} usable addresses in {subnet}/24 are allocated")]
    PoolExhausted { subnet: Ipv4Addr, capacity: usize },

    /// Address has no allocation in the registry
    #[error("address not allocated: {0}")]
    NotAllocated(Ipv4Addr),

    /// Non-blocking lock attempt found the lock held
    #[error("lock {path} is already held by another process")]
    LockHeld { path: String },

    /// Lock file could not be opened or locked
    #[error("lock error: {0}")]
    Lock(String),

    /// Host command (`ip`, `iptables`) failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// TAP device operation failed
    #[error("TAP device {device}: {detail}")]
    TapDevice { device: String, detail: String },

    /// Invalid network configuration
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokio::task::JoinError> for NetError {
    fn from(err: tokio::task::JoinError) -> Self {
        NetError::Io(std::io::Error::other(err.to_string()))
    }
}

/// Result type for sandbox-net operations
pub type Result<T> = std::result::Result<T, NetError>;
