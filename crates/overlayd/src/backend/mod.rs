//! Encapsulation backends.
//!
//! A [`Backend`] turns the overlay configuration into a running [`Network`]:
//! it prepares host state, acquires this node's subnet lease and returns a
//! reconciler bound to both. Backends are created by name through the
//! [`BackendRegistry`](manager::BackendRegistry).

pub mod manager;
pub mod udp;
pub mod vxlan;

use async_trait::async_trait;
use overlay_common::{ExternalInterface, Lease, LeaseStore, LinkLayer, NetworkConfig, OverlayResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use manager::{BackendCtor, BackendManager, BackendRegistry};

/// Host capabilities shared by every backend instance.
#[derive(Clone)]
pub struct BackendContext {
    pub store: Arc<dyn LeaseStore>,
    pub link: Arc<dyn LinkLayer>,
    pub ext_iface: Arc<ExternalInterface>,
}

impl BackendContext {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        link: Arc<dyn LinkLayer>,
        ext_iface: ExternalInterface,
    ) -> Self {
        Self {
            store,
            link,
            ext_iface: Arc::new(ext_iface),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend type name as published in leases.
    fn name(&self) -> &'static str;

    /// Prepare host state, acquire a lease and return the network.
    ///
    /// Cancellation during lease acquisition is returned unchanged as
    /// [`OverlayError::Lease`](overlay_common::OverlayError::Lease).
    async fn register_network(
        &self,
        cancel: &CancellationToken,
        config: &NetworkConfig,
    ) -> OverlayResult<Box<dyn Network>>;
}

#[async_trait]
pub trait Network: Send + Sync {
    /// This node's lease.
    fn lease(&self) -> &Lease;

    /// MTU available to workloads after encapsulation overhead.
    fn mtu(&self) -> u32;

    /// Reconcile peer leases until `cancel` fires.
    async fn run(self: Box<Self>, cancel: CancellationToken);
}

/// Register the backends shipped with the daemon.
pub fn register_builtin(registry: &mut BackendRegistry) {
    vxlan::register(registry);
    udp::register(registry);
}
