use pnet::{datalink, ipnetwork::IpNetwork};
use std::net::Ipv4Addr;

/// All the IPv4 addresses bound to a local interface, loopback included
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let extract_addr = |iface: datalink::NetworkInterface| {
        iface.ips.into_iter().filter_map(|i| match i {
            IpNetwork::V4(data) => Some(data.ip()),
            IpNetwork::V6(_) => None,
        })
    };
    let addrs: Vec<Ipv4Addr> = datalink::interfaces()
        .into_iter()
        .flat_map(extract_addr)
        .collect();
    log::debug!("IPv4 interfaces: {:?}", &addrs);
    addrs
}

/// The host name of this machine, or "localhost" if it cannot be read
pub fn hostname() -> String {
    match ::hostname::get() {
        Ok(name) => Some(name.to_string_lossy().into_owned())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string()),
        Err(e) => {
            log::warn!("Cannot read the host name ({e}), using \"localhost\"");
            "localhost".to_string()
        }
    }
}
