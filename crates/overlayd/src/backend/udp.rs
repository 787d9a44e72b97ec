//! UDP backend.
//!
//! Encapsulates overlay packets in plain UDP datagrams. There is no kernel
//! device state to manage; the network keeps a peer table mapping each
//! remote subnet to the UDP endpoint that serves it.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use overlay_common::{
    Event, EventType, ExternalInterface, Lease, LeaseAttrs, LeaseStore, NetworkConfig,
    OverlayError, OverlayResult,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{Backend, BackendContext, BackendRegistry, Network};
use crate::watch::watch_leases;

pub const BACKEND_TYPE: &str = "udp";

/// Outer IPv4 (20) + UDP (8) headers.
pub const ENCAP_OVERHEAD: u32 = 28;

pub const DEFAULT_PORT: u16 = 8285;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    #[serde(rename = "Port")]
    pub port: u16,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

impl UdpConfig {
    pub fn decode(config: &NetworkConfig) -> OverlayResult<Self> {
        match config.backend_json() {
            Some(json) => serde_json::from_value(json.clone())
                .map_err(|e| OverlayError::config_decode(BACKEND_TYPE, e)),
            None => Ok(Self::default()),
        }
    }
}

pub struct UdpBackend {
    ctx: BackendContext,
}

impl UdpBackend {
    pub fn new(ctx: &BackendContext) -> Self {
        Self { ctx: ctx.clone() }
    }
}

/// Register the `udp` constructor.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(BACKEND_TYPE, |ctx| {
        Ok(Arc::new(UdpBackend::new(ctx)) as Arc<dyn Backend>)
    });
}

#[async_trait]
impl Backend for UdpBackend {
    fn name(&self) -> &'static str {
        BACKEND_TYPE
    }

    #[instrument(skip_all)]
    async fn register_network(
        &self,
        cancel: &CancellationToken,
        config: &NetworkConfig,
    ) -> OverlayResult<Box<dyn Network>> {
        let cfg = UdpConfig::decode(config)?;

        let attrs = LeaseAttrs::new(self.ctx.ext_iface.ext_addr, BACKEND_TYPE);
        let lease = self
            .ctx
            .store
            .acquire_lease(cancel, &attrs)
            .await
            .map_err(OverlayError::from_acquire)?;

        // The tunnel covers the whole overlay, not just this node's subnet.
        let tunnel_net = Ipv4Net::new(lease.subnet.network(), config.network.prefix_len())
            .map_err(|e| OverlayError::internal(e.to_string()))?;
        info!(subnet = %lease.subnet, tunnel_net = %tunnel_net, port = cfg.port, "Acquired lease");

        Ok(Box::new(UdpNetwork::new(
            lease,
            tunnel_net,
            cfg.port,
            self.ctx.ext_iface.clone(),
            self.ctx.store.clone(),
        )))
    }
}

/// Peer table shared with the packet path.
pub type PeerTable = Arc<RwLock<HashMap<Ipv4Net, SocketAddrV4>>>;

pub struct UdpNetwork {
    lease: Lease,
    tunnel_net: Ipv4Net,
    port: u16,
    ext_iface: Arc<ExternalInterface>,
    store: Arc<dyn LeaseStore>,
    peers: PeerTable,
}

impl UdpNetwork {
    pub fn new(
        lease: Lease,
        tunnel_net: Ipv4Net,
        port: u16,
        ext_iface: Arc<ExternalInterface>,
        store: Arc<dyn LeaseStore>,
    ) -> Self {
        Self {
            lease,
            tunnel_net,
            port,
            ext_iface,
            store,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn tunnel_net(&self) -> Ipv4Net {
        self.tunnel_net
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Handle to the peer table.
    pub fn peers(&self) -> PeerTable {
        self.peers.clone()
    }

    /// UDP endpoint serving the peer subnet that contains `dst`.
    pub async fn lookup(&self, dst: Ipv4Addr) -> Option<SocketAddrV4> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .find(|(subnet, _)| subnet.contains(&dst))
            .map(|(_, endpoint)| *endpoint)
    }

    pub async fn handle_batch(&self, batch: &[Event]) {
        let mut peers = self.peers.write().await;
        for event in batch {
            let lease = &event.lease;
            if lease.attrs.backend_type != BACKEND_TYPE {
                warn!(
                    subnet = %lease.subnet,
                    backend_type = %lease.attrs.backend_type,
                    "Ignoring non-udp subnet"
                );
                continue;
            }

            match event.event_type {
                EventType::Added => {
                    let endpoint = SocketAddrV4::new(lease.attrs.public_ip, self.port);
                    info!(subnet = %lease.subnet, endpoint = %endpoint, "Adding peer");
                    peers.insert(lease.subnet, endpoint);
                }
                EventType::Removed => {
                    info!(subnet = %lease.subnet, "Removing peer");
                    peers.remove(&lease.subnet);
                }
            }
        }
    }
}

#[async_trait]
impl Network for UdpNetwork {
    fn lease(&self) -> &Lease {
        &self.lease
    }

    fn mtu(&self) -> u32 {
        self.ext_iface.iface.mtu.saturating_sub(ENCAP_OVERHEAD)
    }

    #[instrument(skip_all, fields(subnet = %self.lease.subnet))]
    async fn run(self: Box<Self>, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<Vec<Event>>(1);
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
                    None => break,
                },
            }
        }

        drop(rx);
        if let Err(e) = watcher.await {
            error!(error = %e, "Lease watch task failed");
        }
        debug!("Network stopped");
    }
}
