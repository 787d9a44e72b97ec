//! [`LinkLayer`] backed by the iproute2 tools.
//!
//! Queries use the JSON output mode (`ip -j`) and are decoded with serde;
//! mutations are plain `ip`/`bridge` invocations built in [`crate::commands`].
//! Link names are resolved to indices through `if_nametoindex(3)` and cached.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tracing::{debug, instrument};

use crate::commands::*;
use crate::error::{OverlayError, OverlayResult};
use crate::link::LinkLayer;
use crate::shell;
use crate::types::{LinkInfo, MacAddress, Neighbor, Route, VxlanLinkAttrs, VxlanLinkInfo};

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct IpVxlanData {
    #[serde(default)]
    id: u32,
    #[serde(default)]
    local: Option<Ipv4Addr>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    learning: bool,
    #[serde(default)]
    gbp: bool,
}

#[derive(Debug, Deserialize)]
struct IpAddrLink {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    family: String,
    local: Option<Ipv4Addr>,
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
}

/// Decode `ip -j -d link show` output.
///
/// `resolve` maps the VXLAN underlay device name to its index.
pub fn parse_links(
    json: &str,
    resolve: impl Fn(&str) -> Option<u32>,
) -> OverlayResult<Vec<LinkInfo>> {
    let links: Vec<IpLink> = shell::decode_json("link list", json)?;
    links
        .into_iter()
        .map(|link| {
            let mac = match link.address.as_deref() {
                Some(addr) => MacAddress::parse(addr).unwrap_or(MacAddress::ZERO),
                None => MacAddress::ZERO,
            };
            let (kind, data) = match link.linkinfo {
                Some(info) => (info.info_kind, info.info_data),
                None => (None, None),
            };
            let vxlan = match (kind.as_deref(), data) {
                (Some("vxlan"), Some(data)) => {
                    let data: IpVxlanData = serde_json::from_value(data)
                        .map_err(|e| OverlayError::parse("vxlan link data", e.to_string()))?;
                    Some(VxlanLinkInfo {
                        vni: data.id,
                        vtep_index: data.link.as_deref().and_then(&resolve),
                        vtep_addr: data.local,
                        port: data.port,
                        gbp: data.gbp,
                        learning: data.learning,
                    })
                }
                _ => None,
            };
            Ok(LinkInfo {
                index: link.ifindex,
                name: link.ifname,
                mtu: link.mtu,
                mac,
                kind,
                vxlan,
            })
        })
        .collect()
}

/// Decode `ip -j -4 addr show` output into the IPv4 prefixes it lists.
pub fn parse_addrs(json: &str) -> OverlayResult<Vec<Ipv4Net>> {
    let links: Vec<IpAddrLink> = shell::decode_json("address list", json)?;
    let mut addrs = Vec::new();
    for info in links.into_iter().flat_map(|l| l.addr_info) {
        if info.family != "inet" {
            continue;
        }
        if let Some(local) = info.local {
            let net = Ipv4Net::new(local, info.prefixlen)
                .map_err(|e| OverlayError::parse("address prefix", e.to_string()))?;
            addrs.push(net);
        }
    }
    Ok(addrs)
}

/// Decode `ip -j -4 route show` or `ip -j -4 route get` output.
///
/// `resolve` maps device names to link indices.
pub fn parse_routes(
    json: &str,
    resolve: impl Fn(&str) -> Option<u32>,
) -> OverlayResult<Vec<Route>> {
    let routes: Vec<IpRoute> = shell::decode_json("route list", json)?;
    routes
        .into_iter()
        .map(|r| {
            let dst = match r.dst.as_str() {
                "default" => None,
                dst if dst.contains('/') => Some(
                    dst.parse::<Ipv4Net>()
                        .map_err(|e| OverlayError::parse("route destination", e.to_string()))?,
                ),
                dst => {
                    let ip: Ipv4Addr = dst
                        .parse()
                        .map_err(|e: std::net::AddrParseError| {
                            OverlayError::parse("route destination", e.to_string())
                        })?;
                    Some(Ipv4Net::from(ip))
                }
            };
            Ok(Route {
                dst,
                gw: r.gateway,
                link_index: r.dev.as_deref().and_then(&resolve),
                onlink: r.flags.iter().any(|f| f == "onlink"),
            })
        })
        .collect()
}

/// Host link layer driven through `ip` and `bridge`.
#[derive(Debug, Default)]
pub struct ShellLinkLayer {
    names: Mutex<HashMap<u32, String>>,
}

impl ShellLinkLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve_index(name: &str) -> Option<u32> {
        nix::net::if_::if_nametoindex(name).ok()
    }

    /// Resolve a link index to its name, querying the system if not cached.
    fn name_of(&self, index: u32) -> OverlayResult<String> {
        let mut names = self
            .names
            .lock()
            .map_err(|_| OverlayError::internal("link name cache poisoned"))?;
        if let Some(name) = names.get(&index) {
            return Ok(name.clone());
        }
        let name = nix::net::if_::if_indextoname(index)
            .map_err(|_| OverlayError::link_not_found(format!("#{}", index)))?
            .to_string_lossy()
            .into_owned();
        names.insert(index, name.clone());
        Ok(name)
    }

    fn forget(&self, index: u32) {
        if let Ok(mut names) = self.names.lock() {
            names.remove(&index);
        }
    }

    async fn mutate(&self, operation: &str, cmd: String) -> OverlayResult<()> {
        shell::exec_mutation(operation, &cmd).await
    }

    async fn route_dev(&self, route: &Route) -> OverlayResult<Option<String>> {
        route.link_index.map(|idx| self.name_of(idx)).transpose()
    }
}

#[async_trait]
impl LinkLayer for ShellLinkLayer {
    async fn link_by_name(&self, name: &str) -> OverlayResult<Option<LinkInfo>> {
        let result = shell::exec(&build_link_show_cmd(Some(name))).await?;
        if !result.success() {
            // ip exits non-zero with "does not exist" for unknown devices
            return Ok(None);
        }
        let link = parse_links(&result.stdout, Self::resolve_index)?.into_iter().next();
        Ok(link)
    }

    async fn link_by_index(&self, index: u32) -> OverlayResult<LinkInfo> {
        let name = self.name_of(index)?;
        match self.link_by_name(&name).await? {
            Some(link) if link.index == index => Ok(link),
            _ => {
                self.forget(index);
                Err(OverlayError::link_not_found(format!("#{}", index)))
            }
        }
    }

    async fn link_list(&self) -> OverlayResult<Vec<LinkInfo>> {
        let out = shell::exec_or_throw(&build_link_show_cmd(None)).await?;
        parse_links(&out, Self::resolve_index)
    }

    #[instrument(skip(self), fields(name = %attrs.name, vni = attrs.vni))]
    async fn vxlan_add(&self, attrs: &VxlanLinkAttrs) -> OverlayResult<LinkInfo> {
        let vtep_dev = self.name_of(attrs.vtep_index)?;
        self.mutate("link add", build_vxlan_add_cmd(attrs, &vtep_dev))
            .await?;
        self.link_by_name(&attrs.name)
            .await?
            .ok_or_else(|| OverlayError::link_not_found(&attrs.name))
    }

    async fn link_del(&self, index: u32) -> OverlayResult<()> {
        let name = self.name_of(index)?;
        self.mutate("link del", build_link_del_cmd(&name)).await?;
        self.forget(index);
        debug!(name = %name, "Deleted link");
        Ok(())
    }

    async fn link_set_up(&self, index: u32) -> OverlayResult<()> {
        let name = self.name_of(index)?;
        self.mutate("link set up", build_link_set_up_cmd(&name)).await
    }

    async fn addr_list(&self, index: u32) -> OverlayResult<Vec<Ipv4Net>> {
        let name = self.name_of(index)?;
        let out = shell::exec_or_throw(&build_addr_show_cmd(&name)).await?;
        parse_addrs(&out)
    }

    async fn addr_add(&self, index: u32, addr: Ipv4Net) -> OverlayResult<()> {
        let name = self.name_of(index)?;
        self.mutate("addr add", build_addr_add_cmd(&name, &addr)).await
    }

    async fn addr_del(&self, index: u32, addr: Ipv4Net) -> OverlayResult<()> {
        let name = self.name_of(index)?;
        self.mutate("addr del", build_addr_del_cmd(&name, &addr)).await
    }

    async fn neigh_add(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()> {
        let name = self.name_of(index)?;
        self.mutate("neigh add", build_neigh_replace_cmd(&name, neigh))
            .await
    }

    async fn neigh_del(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()> {
        let name = self.name_of(index)?;
        self.mutate("neigh del", build_neigh_del_cmd(&name, neigh)).await
    }

    async fn fdb_add(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()> {
        let name = self.name_of(index)?;
        self.mutate("fdb add", build_fdb_replace_cmd(&name, neigh)).await
    }

    async fn fdb_del(&self, index: u32, neigh: &Neighbor) -> OverlayResult<()> {
        let name = self.name_of(index)?;
        self.mutate("fdb del", build_fdb_del_cmd(&name, neigh)).await
    }

    async fn route_replace(&self, route: &Route) -> OverlayResult<()> {
        let dev = self.route_dev(route).await?;
        self.mutate("route replace", build_route_replace_cmd(route, dev.as_deref()))
            .await
    }

    async fn route_del(&self, route: &Route) -> OverlayResult<()> {
        let dev = self.route_dev(route).await?;
        self.mutate("route del", build_route_del_cmd(route, dev.as_deref()))
            .await
    }

    async fn route_list(&self) -> OverlayResult<Vec<Route>> {
        let out = shell::exec_or_throw(&build_route_show_cmd()).await?;
        parse_routes(&out, Self::resolve_index)
    }

    async fn route_get(&self, dst: Ipv4Addr) -> OverlayResult<Vec<Route>> {
        let out = shell::exec_or_throw(&build_route_get_cmd(dst)).await?;
        parse_routes(&out, Self::resolve_index)
    }
}
