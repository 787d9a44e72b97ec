//! Subnet leases, lease change events and the lease store capability.
//!
//! A lease is owned by the (distributed) lease store; the data plane only
//! ever observes it. The JSON layout matches what the rest of the cluster
//! publishes:
//!
//! ```text
//! {"Subnet": "10.1.15.0/24",
//!  "Attrs": {"PublicIP": "192.168.1.5", "BackendType": "vxlan",
//!            "BackendData": {"VtepMAC": "aa:bb:cc:dd:ee:ff"}}}
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Attributes published with a lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseAttrs {
    #[serde(rename = "PublicIP")]
    pub public_ip: Ipv4Addr,
    #[serde(rename = "BackendType", default)]
    pub backend_type: String,
    /// Backend-specific metadata, opaque to everything but the backend.
    #[serde(
        rename = "BackendData",
        default,
        skip_serializing_if = "serde_json::Value::is_null"
    )]
    pub backend_data: serde_json::Value,
}

impl LeaseAttrs {
    pub fn new(public_ip: Ipv4Addr, backend_type: impl Into<String>) -> Self {
        Self {
            public_ip,
            backend_type: backend_type.into(),
            backend_data: serde_json::Value::Null,
        }
    }

    /// Set the backend data (builder pattern)
    pub fn with_backend_data(mut self, data: serde_json::Value) -> Self {
        self.backend_data = data;
        self
    }
}

/// A subnet allocation for one cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    #[serde(rename = "Subnet")]
    pub subnet: Ipv4Net,
    #[serde(rename = "Attrs")]
    pub attrs: LeaseAttrs,
    #[serde(
        rename = "Expiration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expiration: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn new(subnet: Ipv4Net, attrs: LeaseAttrs) -> Self {
        Self {
            subnet,
            attrs,
            expiration: None,
        }
    }

    /// True if both leases describe the same subnet with the same attributes,
    /// ignoring expiration.
    pub fn same_allocation(&self, other: &Lease) -> bool {
        self.subnet == other.subnet && self.attrs == other.attrs
    }
}

/// Kind of lease change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Added,
    Removed,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => write!(f, "added"),
            EventType::Removed => write!(f, "removed"),
        }
    }
}

/// One lease change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "Type")]
    pub event_type: EventType,
    #[serde(rename = "Lease")]
    pub lease: Lease,
}

impl Event {
    pub fn added(lease: Lease) -> Self {
        Self {
            event_type: EventType::Added,
            lease,
        }
    }

    pub fn removed(lease: Lease) -> Self {
        Self {
            event_type: EventType::Removed,
            lease,
        }
    }
}

/// Errors returned by a lease store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The watch cursor is older than the store's retained history.
    #[error("watch cursor {0} has expired")]
    CursorExpired(u64),

    #[error("{0}")]
    Other(String),
}

impl LeaseError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Cancellation and deadline mean shutdown, not failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, LeaseError::Canceled | LeaseError::DeadlineExceeded)
    }
}

/// Result of one watch call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaseWatchResult {
    /// Incremental changes since the requested cursor.
    pub events: Vec<Event>,
    /// Full set of current leases; present when no cursor was given.
    pub snapshot: Option<Vec<Lease>>,
    /// Cursor to pass to the next call.
    pub cursor: u64,
}

/// Lease store capability consumed by the backends.
///
/// Implementations must deliver events for the same subnet in causal order
/// and must return [`LeaseError::Canceled`] once `cancel` fires.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire (or renew) a lease for this node carrying `attrs`.
    async fn acquire_lease(
        &self,
        cancel: &CancellationToken,
        attrs: &LeaseAttrs,
    ) -> Result<Lease, LeaseError>;

    /// Without a cursor, return a snapshot of all leases. With a cursor,
    /// block until changes newer than it exist and return them.
    async fn watch_leases(
        &self,
        cancel: &CancellationToken,
        cursor: Option<u64>,
    ) -> Result<LeaseWatchResult, LeaseError>;
}
