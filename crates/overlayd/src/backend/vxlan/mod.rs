//! VXLAN backend.
//!
//! Creates one VXLAN device per VNI, publishes its MAC in the lease and
//! programs ARP, FDB and route entries for every peer.

mod device;
mod network;

pub use device::VxlanDevice;
pub use network::VxlanNetwork;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use overlay_common::{
    LeaseAttrs, MacAddress, NetworkConfig, OverlayError, OverlayResult, VxlanLinkAttrs,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::{Backend, BackendContext, BackendRegistry, Network};

/// Backend type name.
pub const BACKEND_TYPE: &str = "vxlan";

/// VXLAN header overhead: outer IPv4 (20) + UDP (8) + VXLAN (8) + inner Ethernet (14).
pub const ENCAP_OVERHEAD: u32 = 50;

const DEFAULT_VNI: u32 = 1;

/// `Backend` section of the network config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VxlanConfig {
    #[serde(rename = "VNI")]
    pub vni: u32,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "GBP")]
    pub gbp: bool,
    #[serde(rename = "Learning")]
    pub learning: bool,
    #[serde(rename = "DirectRouting")]
    pub direct_routing: bool,
}

impl Default for VxlanConfig {
    fn default() -> Self {
        Self {
            vni: DEFAULT_VNI,
            port: 0,
            gbp: false,
            learning: false,
            direct_routing: false,
        }
    }
}

impl VxlanConfig {
    pub fn decode(config: &NetworkConfig) -> OverlayResult<Self> {
        match config.backend_json() {
            Some(json) => serde_json::from_value(json.clone())
                .map_err(|e| OverlayError::config_decode(BACKEND_TYPE, e)),
            None => Ok(Self::default()),
        }
    }
}

/// Backend data published in VXLAN leases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanLeaseAttrs {
    #[serde(rename = "VtepMAC")]
    pub vtep_mac: MacAddress,
}

pub struct VxlanBackend {
    ctx: BackendContext,
}

impl VxlanBackend {
    pub fn new(ctx: &BackendContext) -> Self {
        Self { ctx: ctx.clone() }
    }
}

/// Register the `vxlan` constructor.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(BACKEND_TYPE, |ctx| {
        Ok(Arc::new(VxlanBackend::new(ctx)) as Arc<dyn Backend>)
    });
}

#[async_trait]
impl Backend for VxlanBackend {
    fn name(&self) -> &'static str {
        BACKEND_TYPE
    }

    #[instrument(skip_all)]
    async fn register_network(
        &self,
        cancel: &CancellationToken,
        config: &NetworkConfig,
    ) -> OverlayResult<Box<dyn Network>> {
        let cfg = VxlanConfig::decode(config)?;
        let ext = &self.ctx.ext_iface;
        info!(
            vni = cfg.vni,
            port = cfg.port,
            gbp = cfg.gbp,
            learning = cfg.learning,
            direct_routing = cfg.direct_routing,
            "VXLAN config"
        );

        let attrs = VxlanLinkAttrs {
            vni: cfg.vni,
            name: format!("overlay.{}", cfg.vni),
            vtep_index: ext.iface.index,
            vtep_addr: ext.iface_addr,
            port: cfg.port,
            gbp: cfg.gbp,
            learning: cfg.learning,
        };
        let dev = VxlanDevice::ensure(self.ctx.link.clone(), &attrs, cfg.direct_routing).await?;

        let data = serde_json::to_value(VxlanLeaseAttrs { vtep_mac: dev.mac() })
            .map_err(|e| OverlayError::internal(format!("encode lease attrs: {}", e)))?;
        let lease_attrs = LeaseAttrs::new(ext.ext_addr, BACKEND_TYPE).with_backend_data(data);

        let lease = self
            .ctx
            .store
            .acquire_lease(cancel, &lease_attrs)
            .await
            .map_err(OverlayError::from_acquire)?;
        info!(subnet = %lease.subnet, "Acquired lease");

        // Host-only prefix: no implicit subnet route on the tunnel device.
        let addr = Ipv4Net::new(lease.subnet.network(), 32)
            .map_err(|e| OverlayError::internal(e.to_string()))?;
        dev.configure(addr).await.map_err(|e| {
            OverlayError::kernel(
                "configure",
                format!("failed to configure interface {}: {}", dev.name(), e),
            )
        })?;

        Ok(Box::new(VxlanNetwork::new(
            dev,
            lease,
            self.ctx.ext_iface.clone(),
            self.ctx.store.clone(),
        )))
    }
}
