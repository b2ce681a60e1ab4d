//! Linux implementations: `ip(8)` for links and routes, `systemd-resolved`
//! over D-Bus for DNS.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

use ipnet::IpNet;
use tokio::process::Command;
use tracing::debug;

use super::{AddOutcome, DeleteOutcome, LinkOps, ResolverDaemon, RouteSpec};
use crate::error::NetworkError;

const RESOLVED_DESTINATION: &str = "org.freedesktop.resolve1";
const RESOLVED_PATH: &str = "/org/freedesktop/resolve1";
const RESOLVED_MANAGER: &str = "org.freedesktop.resolve1.Manager";

const AF_INET: i32 = 2;
const AF_INET6: i32 = 10;

/// Failed `ip` invocation.
#[derive(Debug)]
struct IpFailure {
    stderr: String,
}

impl IpFailure {
    fn exists(&self) -> bool {
        self.stderr.contains("File exists") || self.stderr.contains("already assigned")
    }

    fn missing(&self) -> bool {
        self.stderr.contains("No such process") || self.stderr.contains("Cannot find")
    }
}

/// Link and route operations through the `ip` command.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    program: String,
    sysfs: PathBuf,
}

impl IpRoute2 {
    /// Uses `ip` from `PATH` and `/sys/class/net` for link indexes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "ip".to_string(),
            sysfs: PathBuf::from("/sys/class/net"),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Result<(), IpFailure>, NetworkError> {
        debug!(command = %format!("{} {}", self.program, args.join(" ")), "running");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(Ok(()))
        } else {
            Ok(Err(IpFailure {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }))
        }
    }

    fn route_args(verb: &str, route: &RouteSpec) -> Vec<String> {
        let family = if route.destination.addr().is_ipv6() { "-6" } else { "-4" };
        let mut args: Vec<String> = [family, "route", verb]
            .iter()
            .map(ToString::to_string)
            .chain([route.destination.to_string(), "dev".into(), route.interface.clone()])
            .collect();
        if let Some(table) = route.table {
            args.extend(["table".into(), table.to_string()]);
        }
        if let Some(metric) = route.metric {
            args.extend(["metric".into(), metric.to_string()]);
        }
        if verb == "add" {
            args.extend(["proto".into(), "static".into()]);
        }
        args
    }
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new()
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

impl LinkOps for IpRoute2 {
    async fn link_index(&self, interface: &str) -> Result<u32, NetworkError> {
        let path = self.sysfs.join(interface).join("ifindex");
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| NetworkError::link(interface, format!("cannot read {}: {e}", path.display())))?;
        text.trim()
            .parse()
            .map_err(|e| NetworkError::link(interface, format!("bad ifindex {:?}: {e}", text.trim())))
    }

    async fn set_mtu(&self, interface: &str, mtu: u32) -> Result<(), NetworkError> {
        self.run(&strings(&["link", "set", "dev", interface, "mtu", &mtu.to_string()]))
            .await?
            .map_err(|f| NetworkError::link(interface, format!("set mtu {mtu}: {}", f.stderr)))
    }

    async fn add_address(&self, interface: &str, address: &IpNet) -> Result<AddOutcome, NetworkError> {
        match self
            .run(&strings(&["address", "add", &address.to_string(), "dev", interface]))
            .await?
        {
            Ok(()) => Ok(AddOutcome::Added),
            Err(f) if f.exists() => Ok(AddOutcome::AlreadyExists),
            Err(f) => Err(NetworkError::address(address, f.stderr)),
        }
    }

    async fn set_up(&self, interface: &str) -> Result<(), NetworkError> {
        self.run(&strings(&["link", "set", "dev", interface, "up"]))
            .await?
            .map_err(|f| NetworkError::link(interface, format!("set up: {}", f.stderr)))
    }

    async fn add_route(&self, route: &RouteSpec) -> Result<AddOutcome, NetworkError> {
        match self.run(&Self::route_args("add", route)).await? {
            Ok(()) => Ok(AddOutcome::Added),
            Err(f) if f.exists() => Ok(AddOutcome::AlreadyExists),
            Err(f) => Err(NetworkError::route(&route.destination, f.stderr)),
        }
    }

    async fn delete_route(&self, route: &RouteSpec) -> Result<DeleteOutcome, NetworkError> {
        match self.run(&Self::route_args("del", route)).await? {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(f) if f.missing() => Ok(DeleteOutcome::NotFound),
            Err(f) => Err(NetworkError::route(&route.destination, f.stderr)),
        }
    }
}

/// `systemd-resolved` over the system D-Bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvedBus;

impl ResolvedBus {
    async fn call<B>(method: &str, body: &B) -> Result<(), NetworkError>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType + Sync,
    {
        let connection = zbus::Connection::system()
            .await
            .map_err(|e| NetworkError::Dns(format!("system bus unavailable: {e}")))?;
        connection
            .call_method(Some(RESOLVED_DESTINATION), RESOLVED_PATH, Some(RESOLVED_MANAGER), method, body)
            .await
            .map_err(|e| NetworkError::Dns(format!("{method}: {e}")))?;
        Ok(())
    }
}

fn link_arg(ifindex: u32) -> Result<i32, NetworkError> {
    i32::try_from(ifindex).map_err(|_| NetworkError::Dns(format!("ifindex {ifindex} out of range")))
}

/// Address family and raw bytes, as `SetLinkDNS` expects them.
fn dns_entries(servers: &[IpAddr]) -> Vec<(i32, Vec<u8>)> {
    servers
        .iter()
        .map(|server| match server {
            IpAddr::V4(v4) => (AF_INET, v4.octets().to_vec()),
            IpAddr::V6(v6) => (AF_INET6, v6.octets().to_vec()),
        })
        .collect()
}

impl ResolverDaemon for ResolvedBus {
    async fn set_link_dns(&self, ifindex: u32, servers: &[IpAddr]) -> Result<(), NetworkError> {
        let body = (link_arg(ifindex)?, dns_entries(servers));
        Self::call("SetLinkDNS", &body).await
    }

    async fn set_link_default_route(&self, ifindex: u32, enable: bool) -> Result<(), NetworkError> {
        Self::call("SetLinkDefaultRoute", &(link_arg(ifindex)?, enable)).await
    }

    async fn revert_link(&self, ifindex: u32) -> Result<(), NetworkError> {
        Self::call("RevertLink", &(link_arg(ifindex)?,)).await
    }
}
