//! Interface and address helpers.
//!
//! Everything here goes through a [`LinkLayer`] so the same logic runs
//! against the host and against the in-memory kernel used in tests.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{debug, info};

use crate::error::{OverlayError, OverlayResult};
use crate::link::LinkLayer;
use crate::types::LinkInfo;

/// The node's chosen external interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInterface {
    pub iface: LinkInfo,
    /// Address on `iface` used as the tunnel source.
    pub iface_addr: Ipv4Addr,
    /// Address advertised to peers; differs from `iface_addr` behind NAT.
    pub ext_addr: Ipv4Addr,
}

fn is_global_unicast(ip: &Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_loopback()
        || ip.is_multicast()
        || ip.is_link_local())
}

/// First IPv4 address on the link, preferring global unicast over
/// link-local.
pub async fn get_iface_ip4_addr(link: &dyn LinkLayer, index: u32) -> OverlayResult<Ipv4Addr> {
    let addrs = link.addr_list(index).await?;

    let mut link_local = None;
    for addr in addrs.iter().map(|a| a.addr()) {
        if is_global_unicast(&addr) {
            return Ok(addr);
        }
        if addr.is_link_local() && link_local.is_none() {
            link_local = Some(addr);
        }
    }

    link_local.ok_or_else(|| {
        OverlayError::invalid_config(
            "iface",
            format!("no IPv4 address found on link #{}", index),
        )
    })
}

/// Returns true if `ip` is configured on the link.
pub async fn get_iface_ip4_addr_match(
    link: &dyn LinkLayer,
    index: u32,
    ip: Ipv4Addr,
) -> OverlayResult<bool> {
    let addrs = link.addr_list(index).await?;
    Ok(addrs.iter().any(|a| a.addr() == ip))
}

/// Interface carrying the IPv4 default route.
pub async fn get_default_gateway_iface(link: &dyn LinkLayer) -> OverlayResult<LinkInfo> {
    let routes = link.route_list().await?;
    let default = routes
        .iter()
        .find(|r| r.is_default())
        .ok_or_else(|| OverlayError::invalid_config("iface", "unable to find default route"))?;

    match default.link_index {
        Some(index) if index > 0 => link.link_by_index(index).await,
        _ => Err(OverlayError::invalid_config(
            "iface",
            "found default route but could not determine interface",
        )),
    }
}

/// Interface that has `ip` configured.
pub async fn get_interface_by_ip(link: &dyn LinkLayer, ip: Ipv4Addr) -> OverlayResult<LinkInfo> {
    for iface in link.link_list().await? {
        if get_iface_ip4_addr_match(link, iface.index, ip).await? {
            return Ok(iface);
        }
    }
    Err(OverlayError::invalid_config(
        "iface",
        format!("no interface with address {} found", ip),
    ))
}

/// Returns true when `ip` is reached through exactly one route with no
/// gateway, i.e. it shares a segment with this host.
pub async fn direct_routing(link: &dyn LinkLayer, ip: Ipv4Addr) -> OverlayResult<bool> {
    let routes = link
        .route_get(ip)
        .await
        .map_err(|e| OverlayError::kernel("route get", format!("{}: {}", ip, e)))?;
    Ok(routes.len() == 1 && routes[0].gw.is_none())
}

/// Make `addr` the only IPv4 address on the link.
///
/// Fails if the link already carries more than one address; a single
/// differing address is replaced.
pub async fn ensure_v4_address_on_link(
    link: &dyn LinkLayer,
    dev: &LinkInfo,
    addr: Ipv4Net,
) -> OverlayResult<()> {
    let mut existing = link.addr_list(dev.index).await?;

    if existing.len() > 1 {
        return Err(OverlayError::invalid_config(
            "address",
            format!(
                "link {} has incompatible addresses {:?}; remove additional addresses and try again",
                dev.name, existing
            ),
        ));
    }

    if let Some(current) = existing.first().copied() {
        if current != addr {
            link.addr_del(dev.index, current).await.map_err(|e| {
                OverlayError::kernel(
                    "addr del",
                    format!("failed to remove {} from {}: {}", current, dev.name, e),
                )
            })?;
            existing.clear();
        }
    }

    if existing.is_empty() {
        link.addr_add(dev.index, addr).await.map_err(|e| {
            OverlayError::kernel(
                "addr add",
                format!("failed to add {} to {}: {}", addr, dev.name, e),
            )
        })?;
        debug!(dev = %dev.name, addr = %addr, "Assigned address");
    }

    Ok(())
}

/// Choose the external interface.
///
/// `iface` may be an interface name or one of its addresses; without it the
/// default-route interface is used. `public_ip` overrides the advertised
/// address.
pub async fn lookup_ext_iface(
    link: &dyn LinkLayer,
    iface: Option<&str>,
    public_ip: Option<Ipv4Addr>,
) -> OverlayResult<ExternalInterface> {
    let (dev, iface_addr) = match iface {
        Some(spec) => match spec.parse::<Ipv4Addr>() {
            Ok(ip) => (get_interface_by_ip(link, ip).await?, Some(ip)),
            Err(_) => {
                let dev = link
                    .link_by_name(spec)
                    .await?
                    .ok_or_else(|| OverlayError::link_not_found(spec))?;
                (dev, None)
            }
        },
        None => {
            info!("Determining IP address of default interface");
            (get_default_gateway_iface(link).await?, None)
        }
    };

    let iface_addr = match iface_addr {
        Some(ip) => ip,
        None => get_iface_ip4_addr(link, dev.index).await?,
    };

    if dev.mtu == 0 {
        return Err(OverlayError::invalid_config(
            "iface",
            format!("failed to determine MTU for {} interface", iface_addr),
        ));
    }

    let ext_addr = public_ip.unwrap_or(iface_addr);
    info!(
        iface = %dev.name,
        iface_addr = %iface_addr,
        ext_addr = %ext_addr,
        "Using interface"
    );

    Ok(ExternalInterface {
        iface: dev,
        iface_addr,
        ext_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_unicast() {
        assert!(is_global_unicast(&Ipv4Addr::new(192, 168, 1, 2)));
        assert!(is_global_unicast(&Ipv4Addr::new(10, 1, 15, 0)));
        assert!(!is_global_unicast(&Ipv4Addr::new(169, 254, 0, 1)));
        assert!(!is_global_unicast(&Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_global_unicast(&Ipv4Addr::new(224, 0, 0, 5)));
        assert!(!is_global_unicast(&Ipv4Addr::BROADCAST));
    }
}
