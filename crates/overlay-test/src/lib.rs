//! Test infrastructure for the overlayd data plane
//!
//! Provides:
//! - An in-memory kernel ([`FakeKernel`]) with failure injection
//! - An in-memory firewall ([`FakeIpTables`])
//! - Lease, event and host fixtures
//! - Kernel state verification helpers

pub mod firewall;
pub mod fixtures;
pub mod kernel;
mod verification;

pub use firewall::{FakeIpTables, InstalledRule};
pub use fixtures::*;
pub use kernel::{FailPoint, FakeKernel, KernelState};
pub use verification::*;
