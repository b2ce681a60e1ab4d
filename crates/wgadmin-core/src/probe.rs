//! Queries about interfaces that exist on the host, whoever created them.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use tracing::debug;

/// Read-only view of the host's network interfaces.
pub trait InterfaceProbe: Send + Sync + 'static {
    /// True if an interface named `name` exists.
    fn exists(&self, name: &str) -> bool;

    /// First IPv4 address assigned to `name`.
    fn ipv4_address(&self, name: &str) -> Option<Ipv4Addr>;
}

/// Probe backed by the OS interface list.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl SystemProbe {
    fn addresses(name: &str) -> Vec<IpAddr> {
        match get_if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces
                .into_iter()
                .filter(|iface| iface.name == name)
                .map(|iface| iface.ip())
                .collect(),
            Err(e) => {
                debug!(error = %e, "cannot list interfaces");
                Vec::new()
            }
        }
    }
}

impl InterfaceProbe for SystemProbe {
    fn exists(&self, name: &str) -> bool {
        // Interfaces without addresses only show up in sysfs.
        Path::new("/sys/class/net").join(name).exists() || !Self::addresses(name).is_empty()
    }

    fn ipv4_address(&self, name: &str) -> Option<Ipv4Addr> {
        Self::addresses(name).into_iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
    }
}
