//! Link layer capability.
//!
//! Each method is one kernel transaction from the caller's point of view.
//! Callers never assume atomicity across calls; multi-step changes are
//! composed (and compensated) above this layer.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::error::OverlayResult;
use crate::types::{LinkInfo, Neighbor, Route, VxlanLinkAttrs};

#[async_trait]
pub trait LinkLayer: Send + Sync {
    /// Look up a link by name; `Ok(None)` if it does not exist.
    async fn link_by_name(&self, name: &str) -> OverlayResult<Option<LinkInfo>>;

    /// Look up a link by index.
    async fn link_by_index(&self, index: u32) -> OverlayResult<LinkInfo>;

    /// All links on the host.
    async fn link_list(&self) -> OverlayResult<Vec<LinkInfo>>;

    /// Create a VXLAN link and return it as the kernel reports it.
    async fn vxlan_add(&self, attrs: &VxlanLinkAttrs) -> OverlayResult<LinkInfo>;

    /// Delete a link by index.
    async fn link_del(&self, index: u32) -> OverlayResult<()>;

    /// Set a link administratively up.
    async fn link_set_up(&self, index: u32) -> OverlayResult<()>;

    /// IPv4 addresses configured on a link.
    async fn addr_list(&self, index: u32) -> OverlayResult<Vec<Ipv4Net>>;

    async fn addr_add(&self, index: u32, addr: Ipv4Net) -> OverlayResult<()>;

    async fn addr_del(&self, index: u32, addr: Ipv4Net) -> OverlayResult<()>;

    /// Add or replace a permanent ARP entry on a link.
    async fn neigh_add(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()>;

    async fn neigh_del(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()>;

    /// Add or replace a permanent forwarding-database entry pointing `mac`
    /// at the remote endpoint `neigh.ip`.
    async fn fdb_add(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()>;

    async fn fdb_del(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()>;

    /// Insert or replace a route.
    async fn route_replace(&self, route: &Route) -> OverlayResult<()>;

    async fn route_del(&self, route: &Route) -> OverlayResult<()>;

    /// All IPv4 routes in the main table.
    async fn route_list(&self) -> OverlayResult<Vec<Route>>;

    /// Routes the kernel would use to reach `dst`.
    async fn route_get(&self, dst: Ipv4Addr) -> OverlayResult<Vec<Route>>;
}
