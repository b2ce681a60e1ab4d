//! Network configuration through the host's own link and resolver services.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    dns::render_resolv_conf, table::resolve_table, AddOutcome, DeleteOutcome, LinkOps, NetworkConfigurator,
    ResolverDaemon, RouteSpec,
};
use crate::config::Config;
use crate::error::NetworkError;

/// Priority given to default routes so they sit beside an existing default
/// route instead of replacing it.
pub const DEFAULT_ROUTE_METRIC: u32 = 1;

/// System files touched by DNS and table resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPaths {
    /// Resolver file rewritten when no resolver daemon answers.
    pub resolv_conf: PathBuf,
    /// Routing-table name registry.
    pub rt_tables: PathBuf,
}

impl Default for NetworkPaths {
    fn default() -> Self {
        Self {
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            rt_tables: PathBuf::from("/etc/iproute2/rt_tables"),
        }
    }
}

#[derive(Debug)]
enum ResolvBackup {
    Existed(Vec<u8>),
    Absent,
}

/// Network configurator for platforms with native support.
///
/// Records every change it makes so that [`NetworkConfigurator::remove`]
/// can undo exactly that, even after a failed apply.
#[derive(Debug)]
pub struct SystemNetwork<L, R> {
    interface: String,
    config: Arc<Config>,
    links: L,
    resolver: R,
    paths: NetworkPaths,
    added_routes: Vec<RouteSpec>,
    resolver_link: Option<u32>,
    resolv_backup: Option<ResolvBackup>,
}

impl<L: LinkOps, R: ResolverDaemon> SystemNetwork<L, R> {
    /// Creates a configurator for `interface` using the default system paths.
    #[must_use]
    pub fn new(interface: impl Into<String>, config: Arc<Config>, links: L, resolver: R) -> Self {
        Self {
            interface: interface.into(),
            config,
            links,
            resolver,
            paths: NetworkPaths::default(),
            added_routes: Vec::new(),
            resolver_link: None,
            resolv_backup: None,
        }
    }

    /// Overrides the system file locations.
    #[must_use]
    pub fn with_paths(mut self, paths: NetworkPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Routes added by this configurator and not yet removed, oldest first.
    #[must_use]
    pub fn added_routes(&self) -> &[RouteSpec] {
        &self.added_routes
    }

    /// One route per distinct allowed range across all peers, in first-seen order.
    fn planned_routes(&self, table: Option<u32>) -> Vec<RouteSpec> {
        let mut seen = HashSet::new();
        self.config
            .peers
            .iter()
            .flat_map(|peer| &peer.allowed_ips)
            .map(ipnet::IpNet::trunc)
            .filter(|destination| seen.insert(destination.to_string()))
            .map(|destination| RouteSpec {
                destination,
                interface: self.interface.clone(),
                table,
                metric: (destination.prefix_len() == 0).then_some(DEFAULT_ROUTE_METRIC),
            })
            .collect()
    }

    async fn configure_routes(&mut self) -> Result<(), NetworkError> {
        let table = resolve_table(&self.config.interface.table, &self.paths.rt_tables)?;
        for route in self.planned_routes(table) {
            match self.links.add_route(&route).await? {
                AddOutcome::Added => {
                    debug!(route = %route, "added route");
                    self.added_routes.push(route);
                }
                AddOutcome::AlreadyExists => debug!(route = %route, "route already present"),
            }
        }
        Ok(())
    }

    async fn configure_dns(&mut self, ifindex: u32) {
        let servers = self.config.interface.dns.clone();
        match self.resolver.set_link_dns(ifindex, &servers).await {
            Ok(()) => {
                self.resolver_link = Some(ifindex);
                if self.config.has_default_route() {
                    if let Err(e) = self.resolver.set_link_default_route(ifindex, true).await {
                        warn!(interface = %self.interface, error = %e, "could not make link the default DNS route");
                    }
                }
                info!(interface = %self.interface, servers = servers.len(), "registered DNS with resolver daemon");
                return;
            }
            Err(e) => debug!(error = %e, "resolver daemon unavailable, rewriting resolver file"),
        }

        match self.rewrite_resolv_conf(&servers).await {
            Ok(()) => info!(interface = %self.interface, path = %self.paths.resolv_conf.display(), "rewrote resolver file"),
            Err(e) => warn!(interface = %self.interface, error = %e, "DNS configuration failed"),
        }
    }

    async fn rewrite_resolv_conf(&mut self, servers: &[std::net::IpAddr]) -> Result<(), NetworkError> {
        let path = self.paths.resolv_conf.clone();
        let original = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(NetworkError::Dns(format!("cannot read {}: {e}", path.display()))),
        };

        let text = original.as_deref().map(String::from_utf8_lossy).unwrap_or_default();
        let rendered = render_resolv_conf(&text, servers, &self.interface, self.config.has_default_route());

        if self.resolv_backup.is_none() {
            self.resolv_backup = Some(original.map_or(ResolvBackup::Absent, ResolvBackup::Existed));
        }
        tokio::fs::write(&path, rendered)
            .await
            .map_err(|e| NetworkError::Dns(format!("cannot write {}: {e}", path.display())))
    }
}

async fn restore_resolv_conf(path: &Path, backup: &ResolvBackup) -> Result<(), NetworkError> {
    let result = match backup {
        ResolvBackup::Existed(bytes) => tokio::fs::write(path, bytes).await,
        ResolvBackup::Absent => match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        },
    };
    result.map_err(|e| NetworkError::Dns(format!("cannot restore {}: {e}", path.display())))
}

impl<L: LinkOps, R: ResolverDaemon> NetworkConfigurator for SystemNetwork<L, R> {
    async fn apply(&mut self) -> Result<(), NetworkError> {
        let interface = self.interface.clone();
        let index = self.links.link_index(&interface).await?;

        self.links.set_mtu(&interface, self.config.interface.mtu).await?;
        for address in &self.config.interface.addresses {
            if self.links.add_address(&interface, address).await? == AddOutcome::AlreadyExists {
                debug!(interface = %interface, address = %address, "address already assigned");
            }
        }
        self.links.set_up(&interface).await?;

        if self.config.interface.table.adds_routes() {
            self.configure_routes().await?;
        }
        if !self.config.interface.dns.is_empty() {
            self.configure_dns(index).await;
        }

        info!(
            interface = %interface,
            addresses = self.config.interface.addresses.len(),
            routes = self.added_routes.len(),
            "network configured"
        );
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), NetworkError> {
        let mut errors = Vec::new();

        if let Some(index) = self.resolver_link {
            match self.resolver.revert_link(index).await {
                Ok(()) => self.resolver_link = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(ref backup) = self.resolv_backup {
            match restore_resolv_conf(&self.paths.resolv_conf, backup).await {
                Ok(()) => self.resolv_backup = None,
                Err(e) => errors.push(e),
            }
        }

        let mut kept = Vec::new();
        while let Some(route) = self.added_routes.pop() {
            match self.links.delete_route(&route).await {
                Ok(DeleteOutcome::Deleted) => debug!(route = %route, "deleted route"),
                Ok(DeleteOutcome::NotFound) => debug!(route = %route, "route already gone"),
                Err(e) => {
                    errors.push(e);
                    kept.push(route);
                }
            }
        }
        kept.reverse();
        self.added_routes = kept;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetworkError::Cleanup(errors))
        }
    }
}
