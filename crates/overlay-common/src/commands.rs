//! Shell command builders for link, neighbor, FDB and route operations

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::shell::{self, shellquote};
use crate::types::{Neighbor, Route, VxlanLinkAttrs};

/// Build link query command (JSON, with details)
pub fn build_link_show_cmd(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{} -j -d link show dev {}", shell::IP_CMD, shellquote(name)),
        None => format!("{} -j -d link show", shell::IP_CMD),
    }
}

/// Build VXLAN link creation command
///
/// `vtep_dev` is the name of the link at `attrs.vtep_index`.
pub fn build_vxlan_add_cmd(attrs: &VxlanLinkAttrs, vtep_dev: &str) -> String {
    let mut cmd = format!(
        "{} link add {} type vxlan id {} local {} dev {}",
        shell::IP_CMD,
        shellquote(&attrs.name),
        attrs.vni,
        shellquote(&attrs.vtep_addr.to_string()),
        shellquote(vtep_dev)
    );
    if attrs.port > 0 {
        cmd.push_str(&format!(" dstport {}", attrs.port));
    }
    cmd.push_str(if attrs.learning { " learning" } else { " nolearning" });
    if attrs.gbp {
        cmd.push_str(" gbp");
    }
    cmd
}

/// Build link deletion command
pub fn build_link_del_cmd(name: &str) -> String {
    format!("{} link del dev {}", shell::IP_CMD, shellquote(name))
}

/// Build link bring-up command
pub fn build_link_set_up_cmd(name: &str) -> String {
    format!("{} link set dev {} up", shell::IP_CMD, shellquote(name))
}

/// Build IPv4 address query command
pub fn build_addr_show_cmd(name: &str) -> String {
    format!("{} -j -4 addr show dev {}", shell::IP_CMD, shellquote(name))
}

/// Build address assignment command
pub fn build_addr_add_cmd(name: &str, addr: &Ipv4Net) -> String {
    format!(
        "{} addr add {} dev {}",
        shell::IP_CMD,
        shellquote(&addr.to_string()),
        shellquote(name)
    )
}

/// Build address removal command
pub fn build_addr_del_cmd(name: &str, addr: &Ipv4Net) -> String {
    format!(
        "{} addr del {} dev {}",
        shell::IP_CMD,
        shellquote(&addr.to_string()),
        shellquote(name)
    )
}

/// Build permanent ARP entry command
///
/// Uses 'replace' so an identical entry is a no-op.
pub fn build_neigh_replace_cmd(name: &str, neigh: &Neighbor) -> String {
    format!(
        "{} neigh replace {} lladdr {} dev {} nud permanent",
        shell::IP_CMD,
        shellquote(&neigh.ip.to_string()),
        shellquote(&neigh.mac.to_string()),
        shellquote(name)
    )
}

/// Build ARP entry deletion command
pub fn build_neigh_del_cmd(name: &str, neigh: &Neighbor) -> String {
    format!(
        "{} neigh del {} lladdr {} dev {}",
        shell::IP_CMD,
        shellquote(&neigh.ip.to_string()),
        shellquote(&neigh.mac.to_string()),
        shellquote(name)
    )
}

/// Build forwarding-database entry command
///
/// Maps the remote VTEP MAC to the remote public IP on the tunnel device.
pub fn build_fdb_replace_cmd(name: &str, neigh: &Neighbor) -> String {
    format!(
        "{} fdb replace {} dev {} dst {} self permanent",
        shell::BRIDGE_CMD,
        shellquote(&neigh.mac.to_string()),
        shellquote(name),
        shellquote(&neigh.ip.to_string())
    )
}

/// Build forwarding-database entry deletion command
pub fn build_fdb_del_cmd(name: &str, neigh: &Neighbor) -> String {
    format!(
        "{} fdb del {} dev {} dst {} self",
        shell::BRIDGE_CMD,
        shellquote(&neigh.mac.to_string()),
        shellquote(name),
        shellquote(&neigh.ip.to_string())
    )
}

fn route_spec(route: &Route, dev: Option<&str>) -> String {
    let mut spec = match route.dst {
        Some(dst) => shellquote(&dst.to_string()),
        None => "default".to_string(),
    };
    if let Some(gw) = route.gw {
        spec.push_str(&format!(" via {}", shellquote(&gw.to_string())));
    }
    if let Some(dev) = dev {
        spec.push_str(&format!(" dev {}", shellquote(dev)));
    }
    spec
}

/// Build route add/replace command
///
/// `dev` is the name of the link at `route.link_index`, if any.
pub fn build_route_replace_cmd(route: &Route, dev: Option<&str>) -> String {
    let mut cmd = format!(
        "{} route replace {}",
        shell::IP_CMD,
        route_spec(route, dev)
    );
    if route.onlink {
        cmd.push_str(" onlink");
    }
    cmd
}

/// Build route deletion command
pub fn build_route_del_cmd(route: &Route, dev: Option<&str>) -> String {
    format!("{} route del {}", shell::IP_CMD, route_spec(route, dev))
}

/// Build main-table route listing command
pub fn build_route_show_cmd() -> String {
    format!("{} -j -4 route show table main", shell::IP_CMD)
}

/// Build route lookup command
pub fn build_route_get_cmd(dst: Ipv4Addr) -> String {
    format!(
        "{} -j -4 route get {}",
        shell::IP_CMD,
        shellquote(&dst.to_string())
    )
}
