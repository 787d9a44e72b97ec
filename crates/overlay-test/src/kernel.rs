//! In-memory kernel model implementing [`LinkLayer`].
//!
//! Holds links, addresses, neighbor/FDB entries and routes the way the
//! kernel keys them, records every mutation in a journal, and can be told
//! to fail selected operations.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use overlay_common::{
    LinkInfo, LinkLayer, MacAddress, Neighbor, OverlayError, OverlayResult, Route, VxlanLinkAttrs,
    VxlanLinkInfo,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    VxlanAdd,
    LinkDel,
    AddrAdd,
    AddrDel,
    NeighAdd,
    NeighDel,
    FdbAdd,
    FdbDel,
    RouteReplace,
    RouteDel,
    RouteGet,
}

/// Snapshot of the modeled kernel tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    pub links: BTreeMap<u32, LinkInfo>,
    pub addrs: BTreeMap<u32, BTreeSet<Ipv4Net>>,
    /// Keyed by (link, ip).
    pub neighbors: BTreeMap<(u32, Ipv4Addr), MacAddress>,
    /// Keyed by (link, mac); value is the remote endpoint.
    pub fdb: BTreeMap<(u32, MacAddress), Ipv4Addr>,
    /// Main table, one route per destination.
    pub routes: BTreeMap<Option<Ipv4Net>, Route>,
}

impl KernelState {
    pub fn neighbor(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.neighbors
            .iter()
            .find(|((_, n_ip), _)| *n_ip == ip)
            .map(|(_, mac)| *mac)
    }

    /// FDB entry whose remote endpoint is `dst`.
    pub fn fdb_to(&self, dst: Ipv4Addr) -> Option<MacAddress> {
        self.fdb
            .iter()
            .find(|(_, remote)| **remote == dst)
            .map(|((_, mac), _)| *mac)
    }

    pub fn route_to(&self, dst: Ipv4Net) -> Option<&Route> {
        self.routes.get(&Some(dst))
    }

    pub fn link_named(&self, name: &str) -> Option<&LinkInfo> {
        self.links.values().find(|l| l.name == name)
    }
}

#[derive(Debug)]
struct Inner {
    state: KernelState,
    next_index: u32,
    /// Addresses `route_get` reports as on-link.
    direct: HashSet<Ipv4Addr>,
    gateway: Option<(Ipv4Addr, u32)>,
    /// Remaining failures per point; `usize::MAX` means always.
    failures: HashMap<FailPoint, usize>,
    journal: Vec<String>,
}

#[derive(Debug)]
pub struct FakeKernel {
    inner: Mutex<Inner>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// Kernel with only the loopback link.
    pub fn new() -> Self {
        let mut state = KernelState::default();
        state.links.insert(
            1,
            LinkInfo {
                index: 1,
                name: "lo".to_string(),
                mtu: 65536,
                mac: MacAddress::ZERO,
                kind: None,
                vxlan: None,
            },
        );
        state
            .addrs
            .insert(1, BTreeSet::from([Ipv4Net::from(Ipv4Addr::LOCALHOST)]));

        Self {
            inner: Mutex::new(Inner {
                state,
                next_index: 2,
                direct: HashSet::new(),
                gateway: None,
                failures: HashMap::new(),
                journal: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a physical link carrying `addr`; returns its index.
    pub fn add_link(&self, name: &str, mtu: u32, addr: Option<Ipv4Net>) -> u32 {
        let mut inner = self.lock();
        let index = inner.next_index;
        inner.next_index += 1;
        inner.state.links.insert(
            index,
            LinkInfo {
                index,
                name: name.to_string(),
                mtu,
                mac: MacAddress([0x52, 0x54, 0x00, 0x00, 0x00, index as u8]),
                kind: None,
                vxlan: None,
            },
        );
        if let Some(addr) = addr {
            inner.state.addrs.entry(index).or_default().insert(addr);
            let connected = Route {
                dst: Some(addr.trunc()),
                gw: None,
                link_index: Some(index),
                onlink: false,
            };
            inner.state.routes.insert(connected.dst, connected);
        }
        index
    }

    /// Install a default route via `gw` on link `index`.
    pub fn set_default_gateway(&self, gw: Ipv4Addr, index: u32) {
        let mut inner = self.lock();
        inner.gateway = Some((gw, index));
        let route = Route {
            dst: None,
            gw: Some(gw),
            link_index: Some(index),
            onlink: false,
        };
        inner.state.routes.insert(None, route);
    }

    /// Make `ip` resolve as directly connected in `route_get`.
    pub fn add_direct_peer(&self, ip: Ipv4Addr) {
        self.lock().direct.insert(ip);
    }

    pub fn remove_direct_peer(&self, ip: Ipv4Addr) {
        self.lock().direct.remove(&ip);
    }

    /// Fail every call of `point` until cleared.
    pub fn fail_on(&self, point: FailPoint) {
        self.lock().failures.insert(point, usize::MAX);
    }

    /// Fail only the next call of `point`.
    pub fn fail_once(&self, point: FailPoint) {
        self.lock().failures.insert(point, 1);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn state(&self) -> KernelState {
        self.lock().state.clone()
    }

    /// Mutations applied so far, in order.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Insert an address behind the daemon's back.
    pub fn inject_addr(&self, index: u32, addr: Ipv4Net) {
        self.lock().state.addrs.entry(index).or_default().insert(addr);
    }

    /// Insert a link behind the daemon's back; returns its index.
    pub fn inject_link(&self, mut link: LinkInfo) -> u32 {
        let mut inner = self.lock();
        let index = inner.next_index;
        inner.next_index += 1;
        link.index = index;
        inner.state.links.insert(index, link);
        index
    }
}

impl Inner {
    fn check(&mut self, point: FailPoint) -> OverlayResult<()> {
        if let Some(remaining) = self.failures.get_mut(&point) {
            if *remaining > 0 {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(OverlayError::kernel(
                    format!("{:?}", point),
                    "injected failure",
                ));
            }
        }
        Ok(())
    }

    fn link(&self, index: u32) -> OverlayResult<&LinkInfo> {
        self.state
            .links
            .get(&index)
            .ok_or_else(|| OverlayError::link_not_found(format!("#{}", index)))
    }

    fn record(&mut self, entry: String) {
        self.journal.push(entry);
    }
}

#[async_trait]
impl LinkLayer for FakeKernel {
    async fn link_by_name(&self, name: &str) -> OverlayResult<Option<LinkInfo>> {
        Ok(self.lock().state.link_named(name).cloned())
    }

    async fn link_by_index(&self, index: u32) -> OverlayResult<LinkInfo> {
        self.lock().link(index).cloned()
    }

    async fn link_list(&self) -> OverlayResult<Vec<LinkInfo>> {
        Ok(self.lock().state.links.values().cloned().collect())
    }

    async fn vxlan_add(&self, attrs: &VxlanLinkAttrs) -> OverlayResult<LinkInfo> {
        let mut inner = self.lock();
        inner.check(FailPoint::VxlanAdd)?;
        if inner.state.link_named(&attrs.name).is_some() {
            return Err(OverlayError::kernel("link add", "File exists"));
        }
        let mtu = inner.link(attrs.vtep_index)?.mtu.saturating_sub(50);

        let index = inner.next_index;
        inner.next_index += 1;
        let link = LinkInfo {
            index,
            name: attrs.name.clone(),
            mtu,
            mac: MacAddress([0x0e, 0x00, 0x00, 0x00, 0x00, index as u8]),
            kind: Some("vxlan".to_string()),
            vxlan: Some(VxlanLinkInfo {
                vni: attrs.vni,
                vtep_index: Some(attrs.vtep_index),
                vtep_addr: Some(attrs.vtep_addr),
                port: if attrs.port == 0 { 8472 } else { attrs.port },
                gbp: attrs.gbp,
                learning: attrs.learning,
            }),
        };
        inner.state.links.insert(index, link.clone());
        inner.record(format!("link add {} vni {}", attrs.name, attrs.vni));
        Ok(link)
    }

    async fn link_del(&self, index: u32) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::LinkDel)?;
        let name = inner.link(index)?.name.clone();
        let state = &mut inner.state;
        state.links.remove(&index);
        state.addrs.remove(&index);
        state.neighbors.retain(|(link, _), _| *link != index);
        state.fdb.retain(|(link, _), _| *link != index);
        state.routes.retain(|_, r| r.link_index != Some(index));
        inner.record(format!("link del {}", name));
        Ok(())
    }

    async fn link_set_up(&self, index: u32) -> OverlayResult<()> {
        let mut inner = self.lock();
        let name = inner.link(index)?.name.clone();
        inner.record(format!("link up {}", name));
        Ok(())
    }

    async fn addr_list(&self, index: u32) -> OverlayResult<Vec<Ipv4Net>> {
        let inner = self.lock();
        inner.link(index)?;
        Ok(inner
            .state
            .addrs
            .get(&index)
            .map(|a| a.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn addr_add(&self, index: u32, addr: Ipv4Net) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::AddrAdd)?;
        inner.link(index)?;
        if !inner.state.addrs.entry(index).or_default().insert(addr) {
            return Err(OverlayError::kernel("addr add", "File exists"));
        }
        inner.record(format!("addr add {} #{}", addr, index));
        Ok(())
    }

    async fn addr_del(&self, index: u32, addr: Ipv4Net) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::AddrDel)?;
        let removed = inner
            .state
            .addrs
            .get_mut(&index)
            .is_some_and(|a| a.remove(&addr));
        if !removed {
            return Err(OverlayError::kernel("addr del", "Cannot assign requested address"));
        }
        inner.record(format!("addr del {} #{}", addr, index));
        Ok(())
    }

    async fn neigh_add(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::NeighAdd)?;
        inner.link(index)?;
        inner.state.neighbors.insert((index, neigh.ip), neigh.mac);
        inner.record(format!("neigh add {}", neigh));
        Ok(())
    }

    async fn neigh_del(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::NeighDel)?;
        if inner.state.neighbors.remove(&(index, neigh.ip)).is_none() {
            return Err(OverlayError::kernel("neigh del", "No such file or directory"));
        }
        inner.record(format!("neigh del {}", neigh));
        Ok(())
    }

    async fn fdb_add(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::FdbAdd)?;
        inner.link(index)?;
        inner.state.fdb.insert((index, neigh.mac), neigh.ip);
        inner.record(format!("fdb add {}", neigh));
        Ok(())
    }

    async fn fdb_del(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::FdbDel)?;
        if inner.state.fdb.remove(&(index, neigh.mac)).is_none() {
            return Err(OverlayError::kernel("fdb del", "No such file or directory"));
        }
        inner.record(format!("fdb del {}", neigh));
        Ok(())
    }

    async fn route_replace(&self, route: &Route) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::RouteReplace)?;
        if let Some(index) = route.link_index {
            inner.link(index)?;
        }
        inner.state.routes.insert(route.dst, route.clone());
        inner.record(format!("route replace {}", route));
        Ok(())
    }

    async fn route_del(&self, route: &Route) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::RouteDel)?;
        let matches = inner
            .state
            .routes
            .get(&route.dst)
            .is_some_and(|r| route.gw.is_none() || r.gw == route.gw);
        if !matches {
            return Err(OverlayError::kernel("route del", "No such process"));
        }
        inner.state.routes.remove(&route.dst);
        inner.record(format!("route del {}", route));
        Ok(())
    }

    async fn route_list(&self) -> OverlayResult<Vec<Route>> {
        Ok(self.lock().state.routes.values().cloned().collect())
    }

    async fn route_get(&self, dst: Ipv4Addr) -> OverlayResult<Vec<Route>> {
        let mut inner = self.lock();
        inner.check(FailPoint::RouteGet)?;
        let host = Some(Ipv4Net::from(dst));
        if inner.direct.contains(&dst) {
            let link_index = inner.gateway.map(|(_, idx)| idx);
            return Ok(vec![Route {
                dst: host,
                gw: None,
                link_index,
                onlink: false,
            }]);
        }
        match inner.gateway {
            Some((gw, idx)) => Ok(vec![Route {
                dst: host,
                gw: Some(gw),
                link_index: Some(idx),
                onlink: false,
            }]),
            None => Err(OverlayError::kernel("route get", "Network is unreachable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        MacAddress::parse("aa:bb:cc:dd:ee:ff").unwrap()
    }

    #[tokio::test]
    async fn test_fail_once_then_succeed() {
        let kernel = FakeKernel::new();
        let eth0 = kernel.add_link("eth0", 1500, None);
        let neigh = Neighbor::new(Ipv4Addr::new(10, 1, 15, 0), mac());

        kernel.fail_once(FailPoint::NeighAdd);
        assert!(kernel.neigh_add(eth0, &neigh).await.is_err());
        assert!(kernel.neigh_add(eth0, &neigh).await.is_ok());
        assert_eq!(kernel.state().neighbor(neigh.ip), Some(mac()));
        assert_eq!(kernel.journal().len(), 1);
    }

    #[tokio::test]
    async fn test_route_replace_is_upsert() {
        let kernel = FakeKernel::new();
        let eth0 = kernel.add_link("eth0", 1500, None);
        let dst: Ipv4Net = "10.1.15.0/24".parse().unwrap();

        let route = Route::via(dst, Ipv4Addr::new(192, 168, 1, 5));
        kernel.route_replace(&route).await.unwrap();
        kernel.route_replace(&route).await.unwrap();
        let onlink = Route::via(dst, dst.addr()).with_link(eth0).with_onlink();
        kernel.route_replace(&onlink).await.unwrap();

        let state = kernel.state();
        assert_eq!(state.route_to(dst), Some(&onlink));
        assert_eq!(state.routes.len(), 1);
    }

    #[tokio::test]
    async fn test_route_get_direct_vs_gateway() {
        let kernel = FakeKernel::new();
        let eth0 = kernel.add_link("eth0", 1500, None);
        kernel.set_default_gateway(Ipv4Addr::new(192, 168, 1, 1), eth0);
        kernel.add_direct_peer(Ipv4Addr::new(192, 168, 1, 5));

        let direct = kernel.route_get(Ipv4Addr::new(192, 168, 1, 5)).await.unwrap();
        assert_eq!(direct[0].gw, None);

        let remote = kernel.route_get(Ipv4Addr::new(10, 9, 9, 9)).await.unwrap();
        assert_eq!(remote[0].gw, Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[tokio::test]
    async fn test_deletes_of_missing_entries_fail() {
        let kernel = FakeKernel::new();
        let eth0 = kernel.add_link("eth0", 1500, None);
        let neigh = Neighbor::new(Ipv4Addr::new(10, 1, 15, 0), mac());
        assert!(kernel.neigh_del(eth0, &neigh).await.is_err());
        assert!(kernel.fdb_del(eth0, &neigh).await.is_err());
        let route = Route::via("10.1.15.0/24".parse().unwrap(), neigh.ip);
        assert!(kernel.route_del(&route).await.is_err());
    }
}
