//! Overlay network data plane.
//!
//! Backends turn peer subnet leases into host networking state:
//!
//! - [`backend::vxlan`]: VXLAN device plus per-peer ARP, FDB and routes,
//!   with optional direct routing for peers on the same segment
//! - [`backend::udp`]: UDP encapsulation peer table
//! - [`firewall`]: masquerade and forward rules kept installed by a
//!   periodic reconciler
//!
//! [`backend::BackendManager`] creates backends by name; [`daemon::run`]
//! wires one network and its firewall rules to a cancellation token.

pub mod backend;
pub mod config;
pub mod daemon;
pub mod firewall;
pub mod saga;
pub mod watch;

pub use backend::{
    register_builtin, Backend, BackendContext, BackendManager, BackendRegistry, Network,
};
pub use daemon::DaemonOptions;
pub use firewall::{FirewallReconciler, IpTablesRule};
