//! VXLAN network reconciler.
//!
//! Turns peer lease events into ARP, FDB and route entries on the tunnel
//! device, or into a plain route via the peer's public IP when direct
//! routing applies.

use async_trait::async_trait;
use overlay_common::iface::direct_routing;
use overlay_common::{Event, EventType, ExternalInterface, Lease, LeaseStore, Neighbor, Route};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{VxlanDevice, VxlanLeaseAttrs, BACKEND_TYPE, ENCAP_OVERHEAD};
use crate::backend::Network;
use crate::saga::{undo_all, KernelStep, Saga};
use crate::watch::watch_leases;

pub struct VxlanNetwork {
    dev: VxlanDevice,
    lease: Lease,
    ext_iface: Arc<ExternalInterface>,
    store: Arc<dyn LeaseStore>,
}

impl VxlanNetwork {
    pub fn new(
        dev: VxlanDevice,
        lease: Lease,
        ext_iface: Arc<ExternalInterface>,
        store: Arc<dyn LeaseStore>,
    ) -> Self {
        Self {
            dev,
            lease,
            ext_iface,
            store,
        }
    }

    pub fn device(&self) -> &VxlanDevice {
        &self.dev
    }

    /// Reconcile one batch of peer events, in order.
    pub async fn handle_batch(&self, batch: &[Event]) {
        for event in batch {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: &Event) {
        let lease = &event.lease;
        let subnet = lease.subnet;

        if lease.attrs.backend_type != BACKEND_TYPE {
            warn!(
                subnet = %subnet,
                backend_type = %lease.attrs.backend_type,
                "Ignoring non-vxlan subnet"
            );
            return;
        }

        let attrs: VxlanLeaseAttrs = match serde_json::from_value(lease.attrs.backend_data.clone())
        {
            Ok(attrs) => attrs,
            Err(e) => {
                error!(subnet = %subnet, error = %e, "Error decoding subnet lease JSON");
                return;
            }
        };

        let steps = self.steps_for(lease, &attrs).await;
        match event.event_type {
            EventType::Added => {
                info!(subnet = %subnet, public_ip = %lease.attrs.public_ip, "Adding subnet");
                if let Err(e) = Saga::run(self.dev.link(), steps).await {
                    // Not retried; the next event for this subnet reconciles it.
                    error!(subnet = %subnet, error = %e, "Failed to add subnet");
                }
            }
            EventType::Removed => {
                info!(subnet = %subnet, public_ip = %lease.attrs.public_ip, "Removing subnet");
                let failures = undo_all(self.dev.link(), &steps).await;
                if !failures.is_empty() {
                    warn!(subnet = %subnet, failures = failures.len(), "Subnet removal incomplete");
                }
            }
        }
    }

    /// Kernel entries for one peer, in the order they must be applied.
    async fn steps_for(&self, lease: &Lease, attrs: &VxlanLeaseAttrs) -> Vec<KernelStep> {
        let subnet = lease.subnet;
        let public_ip = lease.attrs.public_ip;

        if self.use_direct_route(lease).await {
            debug!(subnet = %subnet, "Peer is directly reachable");
            return vec![KernelStep::Route(Route::via(subnet, public_ip))];
        }

        let index = self.dev.index();
        vec![
            KernelStep::Neighbor {
                link_index: index,
                neigh: Neighbor::new(subnet.network(), attrs.vtep_mac),
            },
            KernelStep::Fdb {
                link_index: index,
                neigh: Neighbor::new(public_ip, attrs.vtep_mac),
            },
            KernelStep::Route(
                Route::via(subnet, subnet.network())
                    .with_link(index)
                    .with_onlink(),
            ),
        ]
    }

    async fn use_direct_route(&self, lease: &Lease) -> bool {
        if !self.dev.direct_routing {
            return false;
        }
        match direct_routing(self.dev.link(), lease.attrs.public_ip).await {
            Ok(direct) => direct,
            Err(e) => {
                error!(public_ip = %lease.attrs.public_ip, error = %e, "Direct routing check failed");
                false
            }
        }
    }
}

#[async_trait]
impl Network for VxlanNetwork {
    fn lease(&self) -> &Lease {
        &self.lease
    }

    fn mtu(&self) -> u32 {
        self.ext_iface.iface.mtu.saturating_sub(ENCAP_OVERHEAD)
    }

    #[instrument(skip_all, fields(subnet = %self.lease.subnet, dev = %self.dev.name()))]
    async fn run(self: Box<Self>, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<Vec<Event>>(1);

        debug!("Starting lease watch");
        let watcher = tokio::spawn(watch_leases(
            cancel.clone(),
            self.store.clone(),
            self.lease.clone(),
            tx,
        ));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => self.handle_batch(&batch).await,
                    None => {
                        debug!("Lease watch channel closed");
                        break;
                    }
                },
            }
        }

        drop(rx);
        if let Err(e) = watcher.await {
            error!(error = %e, "Lease watch task failed");
        }
        info!("Network stopped");
    }
}
