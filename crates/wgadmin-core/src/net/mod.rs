//! OS network state for one running tunnel: MTU, addresses, routes and DNS.
//!
//! [`NetworkConfigurator`] is the seam the tunnel client drives.
//! [`SystemNetwork`] implements it on top of two smaller seams:
//! [`LinkOps`] for link, address and route changes, and [`ResolverDaemon`]
//! for live DNS registration. Platforms without support get
//! [`UnsupportedNetwork`], which fails fast.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::NetworkError;

pub mod dns;
#[cfg(target_os = "linux")]
pub mod linux;
mod system;
pub mod table;

pub use dns::render_resolv_conf;
pub use system::{NetworkPaths, SystemNetwork};
pub use table::resolve_table;

/// Applies and reverts the OS network state of one tunnel.
pub trait NetworkConfigurator: Send + 'static {
    /// Brings OS state in line with the tunnel's config.
    ///
    /// On failure, partial state is still recorded so that
    /// [`NetworkConfigurator::remove`] can undo it.
    fn apply(&mut self) -> impl Future<Output = Result<(), NetworkError>> + Send;

    /// Reverts everything `apply` changed. Safe to call after a failed or
    /// repeated apply; errors from every step are reported together.
    fn remove(&mut self) -> impl Future<Output = Result<(), NetworkError>> + Send;
}

/// Configurator for platforms without automatic network setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedNetwork;

impl NetworkConfigurator for UnsupportedNetwork {
    async fn apply(&mut self) -> Result<(), NetworkError> {
        Err(NetworkError::unsupported())
    }

    async fn remove(&mut self) -> Result<(), NetworkError> {
        Ok(())
    }
}

/// Result of an add that tolerates existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The entry was created.
    Added,
    /// The entry was already present.
    AlreadyExists,
}

/// Result of a delete that tolerates missing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The entry was removed.
    Deleted,
    /// The entry was already gone.
    NotFound,
}

/// One route through the tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteSpec {
    /// Destination range, host bits cleared.
    pub destination: IpNet,
    /// Outgoing interface.
    pub interface: String,
    /// Table id; `None` is the main table.
    pub table: Option<u32>,
    /// Route priority; lower wins.
    pub metric: Option<u32>,
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dev {}", self.destination, self.interface)?;
        if let Some(table) = self.table {
            write!(f, " table {table}")?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {metric}")?;
        }
        Ok(())
    }
}

/// Link, address and route operations.
pub trait LinkOps: Send + Sync + 'static {
    /// Kernel index of `interface`.
    fn link_index(&self, interface: &str) -> impl Future<Output = Result<u32, NetworkError>> + Send;

    /// Sets the link MTU.
    fn set_mtu(&self, interface: &str, mtu: u32) -> impl Future<Output = Result<(), NetworkError>> + Send;

    /// Adds a local address.
    fn add_address(
        &self,
        interface: &str,
        address: &IpNet,
    ) -> impl Future<Output = Result<AddOutcome, NetworkError>> + Send;

    /// Brings the link up.
    fn set_up(&self, interface: &str) -> impl Future<Output = Result<(), NetworkError>> + Send;

    /// Adds a route.
    fn add_route(&self, route: &RouteSpec) -> impl Future<Output = Result<AddOutcome, NetworkError>> + Send;

    /// Deletes a route.
    fn delete_route(&self, route: &RouteSpec) -> impl Future<Output = Result<DeleteOutcome, NetworkError>> + Send;
}

/// A live resolver daemon that accepts per-link DNS settings.
pub trait ResolverDaemon: Send + Sync + 'static {
    /// Binds `servers` to the link.
    fn set_link_dns(
        &self,
        ifindex: u32,
        servers: &[IpAddr],
    ) -> impl Future<Output = Result<(), NetworkError>> + Send;

    /// Marks the link as the default route for DNS queries.
    fn set_link_default_route(
        &self,
        ifindex: u32,
        enable: bool,
    ) -> impl Future<Output = Result<(), NetworkError>> + Send;

    /// Drops every setting made for the link.
    fn revert_link(&self, ifindex: u32) -> impl Future<Output = Result<(), NetworkError>> + Send;
}

/// Resolver stand-in for hosts without a resolver daemon; DNS always falls
/// back to rewriting the resolver file.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolverDaemon;

impl ResolverDaemon for NoResolverDaemon {
    async fn set_link_dns(&self, _ifindex: u32, _servers: &[IpAddr]) -> Result<(), NetworkError> {
        Err(NetworkError::Dns("no resolver daemon".to_string()))
    }

    async fn set_link_default_route(&self, _ifindex: u32, _enable: bool) -> Result<(), NetworkError> {
        Err(NetworkError::Dns("no resolver daemon".to_string()))
    }

    async fn revert_link(&self, _ifindex: u32) -> Result<(), NetworkError> {
        Ok(())
    }
}
