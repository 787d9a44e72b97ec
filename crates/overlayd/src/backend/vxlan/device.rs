//! VXLAN tunnel device.

use ipnet::Ipv4Net;
use overlay_common::iface::ensure_v4_address_on_link;
use overlay_common::{LinkInfo, LinkLayer, MacAddress, OverlayError, OverlayResult, VxlanLinkAttrs};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Tunnel device as configured on the host.
pub struct VxlanDevice {
    link: Arc<dyn LinkLayer>,
    info: LinkInfo,
    /// Route peers on the same segment without encapsulation.
    pub direct_routing: bool,
}

impl VxlanDevice {
    /// Create the device, or reuse an existing one with the same identity.
    ///
    /// A link with the same name but different attributes is deleted and
    /// recreated.
    #[instrument(skip(link, attrs), fields(name = %attrs.name, vni = attrs.vni))]
    pub async fn ensure(
        link: Arc<dyn LinkLayer>,
        attrs: &VxlanLinkAttrs,
        direct_routing: bool,
    ) -> OverlayResult<Self> {
        let created = match link.link_by_name(&attrs.name).await? {
            Some(existing) => match attrs.incompatibility(&existing) {
                None => {
                    info!("Reusing existing VXLAN device");
                    existing
                }
                Some(reason) => {
                    warn!(reason = %reason, "Existing device is incompatible, recreating");
                    link.link_del(existing.index).await?;
                    link.vxlan_add(attrs).await?
                }
            },
            None => link.vxlan_add(attrs).await?,
        };

        // The kernel assigns the MAC; read the link back to learn it.
        let info = link.link_by_index(created.index).await?;
        if info.mac.is_zero() {
            return Err(OverlayError::internal(format!(
                "device {} has no hardware address",
                info.name
            )));
        }

        Ok(Self {
            link,
            info,
            direct_routing,
        })
    }

    /// Assign `addr` as the only address and bring the device up.
    pub async fn configure(&self, addr: Ipv4Net) -> OverlayResult<()> {
        ensure_v4_address_on_link(self.link.as_ref(), &self.info, addr).await?;
        self.link.link_set_up(self.info.index).await.map_err(|e| {
            OverlayError::kernel(
                "link set up",
                format!("failed to set interface {} to UP state: {}", self.info.name, e),
            )
        })
    }

    pub fn index(&self) -> u32 {
        self.info.index
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn mac(&self) -> MacAddress {
        self.info.mac
    }

    pub fn link(&self) -> &dyn LinkLayer {
        self.link.as_ref()
    }
}
