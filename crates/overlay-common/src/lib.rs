//! Shared infrastructure for the overlayd data plane.
//!
//! - [`lease`]: subnet leases, change events and the [`LeaseStore`] capability
//! - [`link`]: the [`LinkLayer`] capability (links, addresses, neighbors, FDB, routes)
//! - [`iptables`]: the [`IpTables`] capability
//! - [`shell`]: command execution with proper quoting
//! - [`iface`]: external interface selection and address helpers
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use overlay_common::{iface, ShellLinkLayer};
//!
//! let link = ShellLinkLayer::new();
//! let ext = iface::lookup_ext_iface(&link, Some("eth0"), None).await?;
//! println!("{} mtu {}", ext.iface.name, ext.iface.mtu);
//! ```

pub mod annotations;
pub mod commands;
pub mod config;
pub mod error;
pub mod iface;
pub mod iptables;
pub mod lease;
pub mod link;
pub mod memory_store;
pub mod shell;
pub mod shell_link;
pub mod types;

// Re-export commonly used items at crate root
pub use config::NetworkConfig;
pub use error::{OverlayError, OverlayResult};
pub use iface::ExternalInterface;
pub use iptables::{IpTables, ShellIpTables};
pub use lease::{Event, EventType, Lease, LeaseAttrs, LeaseError, LeaseStore, LeaseWatchResult};
pub use link::LinkLayer;
pub use memory_store::MemoryLeaseStore;
pub use shell_link::ShellLinkLayer;
pub use types::{LinkInfo, MacAddress, Neighbor, Route, VxlanLinkAttrs, VxlanLinkInfo};
