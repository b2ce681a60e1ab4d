//! Tunnel configuration model and the on-disk `.conf` format.
//!
//! A [`Config`] is one named tunnel: an [`InterfaceConfig`] plus an ordered
//! list of [`PeerConfig`]s. Peer order is the order in the file and is kept
//! when the file is rewritten.

mod parse;
mod store;
mod validate;
mod write;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::hook::HookStage;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};

pub use parse::{parse, parse_file};
pub use store::{ConfigStore, BACKUP_SUFFIX, CONFIG_EXTENSION};
pub use validate::{
    is_valid_address, is_valid_allowed_ips, is_valid_endpoint, is_valid_key,
    is_valid_tunnel_name, validate, validate_tunnel_name,
};
pub use write::serialize;

/// MTU used when the file does not set one.
pub const DEFAULT_MTU: u32 = 1420;

/// Largest value accepted for MTU and port fields.
pub const MAX_PORT_OR_MTU: u32 = 65_535;

/// Which routing table receives the tunnel's routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTable {
    /// The main table.
    #[default]
    Auto,
    /// Add no routes at all.
    Off,
    /// A numeric table id.
    Id(u32),
    /// A table name to look up in the system's table-name registry.
    Named(String),
}

impl RouteTable {
    /// Returns true if routes should be installed.
    #[must_use]
    pub const fn adds_routes(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl FromStr for RouteTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("table selector is empty".to_string());
        }
        if s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else if s.eq_ignore_ascii_case("off") {
            Ok(Self::Off)
        } else if let Ok(id) = s.parse::<u32>() {
            Ok(Self::Id(id))
        } else {
            Ok(Self::Named(s.to_string()))
        }
    }
}

impl fmt::Display for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Off => f.write_str("off"),
            Self::Id(id) => write!(f, "{id}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Settings for the local end of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// The interface's private key. Required; optional here so that
    /// validation can report it missing alongside other problems.
    pub private_key: Option<PrivateKey>,
    /// Local addresses with prefix length.
    pub addresses: Vec<IpNet>,
    /// UDP listen port. `None` lets the engine pick one.
    pub listen_port: Option<u16>,
    /// DNS resolvers to use while the tunnel is up.
    pub dns: Vec<IpAddr>,
    /// Interface MTU.
    pub mtu: u32,
    /// Routing-table selector.
    pub table: RouteTable,
    /// Firewall mark applied to outgoing tunnel packets.
    pub fwmark: Option<u32>,
    /// Shell command run before the device is created.
    pub pre_up: Option<String>,
    /// Shell command run once the tunnel is configured.
    pub post_up: Option<String>,
    /// Shell command run before teardown.
    pub pre_down: Option<String>,
    /// Shell command run after teardown.
    pub post_down: Option<String>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            addresses: Vec::new(),
            listen_port: None,
            dns: Vec::new(),
            mtu: DEFAULT_MTU,
            table: RouteTable::Auto,
            fwmark: None,
            pre_up: None,
            post_up: None,
            pre_down: None,
            post_down: None,
        }
    }
}

impl InterfaceConfig {
    /// Creates an interface configuration with the given private key and defaults.
    #[must_use]
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            private_key: Some(private_key),
            ..Self::default()
        }
    }

    /// Adds a local address.
    #[must_use]
    pub fn with_address(mut self, address: IpNet) -> Self {
        self.addresses.push(address);
        self
    }

    /// Sets the listen port.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Adds a DNS server.
    #[must_use]
    pub fn with_dns(mut self, server: IpAddr) -> Self {
        self.dns.push(server);
        self
    }

    /// Sets the MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Sets the routing-table selector.
    #[must_use]
    pub fn with_table(mut self, table: RouteTable) -> Self {
        self.table = table;
        self
    }

    /// Sets the firewall mark.
    #[must_use]
    pub fn with_fwmark(mut self, mark: u32) -> Self {
        self.fwmark = Some(mark);
        self
    }

    /// Sets the hook script for a lifecycle stage.
    #[must_use]
    pub fn with_hook(mut self, stage: HookStage, script: impl Into<String>) -> Self {
        *self.hook_slot(stage) = Some(script.into());
        self
    }

    /// Returns the hook script for a lifecycle stage, if any.
    #[must_use]
    pub fn hook(&self, stage: HookStage) -> Option<&str> {
        match stage {
            HookStage::PreUp => self.pre_up.as_deref(),
            HookStage::PostUp => self.post_up.as_deref(),
            HookStage::PreDown => self.pre_down.as_deref(),
            HookStage::PostDown => self.post_down.as_deref(),
        }
    }

    fn hook_slot(&mut self, stage: HookStage) -> &mut Option<String> {
        match stage {
            HookStage::PreUp => &mut self.pre_up,
            HookStage::PostUp => &mut self.post_up,
            HookStage::PreDown => &mut self.pre_down,
            HookStage::PostDown => &mut self.post_down,
        }
    }

    /// Public key derived from the private key.
    #[must_use]
    pub fn public_key(&self) -> Option<PublicKey> {
        self.private_key.as_ref().map(PrivateKey::public_key)
    }
}

/// One remote endpoint reachable through the tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    /// Display label taken from the comment line above `[Peer]`.
    pub name: String,
    /// The peer's public key. Required.
    pub public_key: Option<PublicKey>,
    /// Optional preshared key.
    pub preshared_key: Option<PresharedKey>,
    /// Resolved remote address.
    pub endpoint: Option<SocketAddr>,
    /// Ranges routed to (and accepted from) this peer.
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds. `None` disables keepalives.
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// Creates a peer with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key: Some(public_key),
            ..Self::default()
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the preshared key.
    #[must_use]
    pub fn with_preshared_key(mut self, key: PresharedKey) -> Self {
        self.preshared_key = Some(key);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Adds an allowed-IP range.
    #[must_use]
    pub fn with_allowed_ip(mut self, range: IpNet) -> Self {
        self.allowed_ips.push(range);
        self
    }

    /// Sets the persistent keepalive interval in seconds. `0` disables it.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = (seconds > 0).then_some(seconds);
        self
    }

    /// Keepalive as a duration.
    #[must_use]
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.persistent_keepalive
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(u64::from(s)))
    }

    /// True if any allowed range is a zero-prefix default route.
    #[must_use]
    pub fn has_default_route(&self) -> bool {
        self.allowed_ips.iter().any(|net| net.prefix_len() == 0)
    }
}

/// A named tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Display name taken from the comment line above `[Interface]`.
    pub name: String,
    /// Local settings.
    pub interface: InterfaceConfig,
    /// Peers in file order.
    pub peers: Vec<PeerConfig>,
}

impl Config {
    /// Creates a config with no peers.
    #[must_use]
    pub fn new(interface: InterfaceConfig) -> Self {
        Self {
            name: String::new(),
            interface,
            peers: Vec::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Appends a peer.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// True iff some peer routes `0.0.0.0/0` or `::/0`.
    ///
    /// A full-tunnel config takes over the default DNS route and comments
    /// out the previous resolvers instead of keeping them.
    #[must_use]
    pub fn has_default_route(&self) -> bool {
        self.peers.iter().any(PeerConfig::has_default_route)
    }

    /// Looks up a peer by public key.
    #[must_use]
    pub fn peer_by_key(&self, key: &PublicKey) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.public_key.as_ref() == Some(key))
    }

    /// First IPv4 interface address, for display.
    #[must_use]
    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.interface.addresses.iter().find_map(|net| match net.addr() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
    }
}

impl FromStr for Config {
    type Err = crate::error::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid cidr")
    }

    #[test]
    fn defaults_are_seeded() {
        let iface = InterfaceConfig::default();
        assert_eq!(iface.mtu, DEFAULT_MTU);
        assert_eq!(iface.table, RouteTable::Auto);
        assert!(iface.private_key.is_none());
    }

    #[test_case(&["0.0.0.0/0"], true ; "ipv4 default")]
    #[test_case(&["::/0"], true ; "ipv6 default")]
    #[test_case(&["10.0.0.0/24", "0.0.0.0/0"], true ; "mixed")]
    #[test_case(&["10.0.0.0/24"], false ; "split tunnel")]
    #[test_case(&[], false ; "no ranges")]
    fn has_default_route(ranges: &[&str], expected: bool) {
        let mut peer = PeerConfig::new(PrivateKey::generate().public_key());
        for r in ranges {
            peer = peer.with_allowed_ip(net(r));
        }
        let config = Config::new(InterfaceConfig::new(PrivateKey::generate())).with_peer(peer);
        assert_eq!(config.has_default_route(), expected);
    }

    #[test_case("auto", RouteTable::Auto)]
    #[test_case("Off", RouteTable::Off)]
    #[test_case("51820", RouteTable::Id(51820))]
    #[test_case("vpn", RouteTable::Named("vpn".into()))]
    fn route_table_from_str(input: &str, expected: RouteTable) {
        assert_eq!(input.parse::<RouteTable>(), Ok(expected));
    }

    #[test]
    fn route_table_display_roundtrips() {
        for table in [
            RouteTable::Auto,
            RouteTable::Off,
            RouteTable::Id(7),
            RouteTable::Named("vpn".into()),
        ] {
            assert_eq!(table.to_string().parse::<RouteTable>(), Ok(table));
        }
    }

    #[test]
    fn hook_accessors() {
        let iface = InterfaceConfig::default()
            .with_hook(HookStage::PostUp, "echo up %i")
            .with_hook(HookStage::PreDown, "echo down");
        assert_eq!(iface.hook(HookStage::PostUp), Some("echo up %i"));
        assert_eq!(iface.hook(HookStage::PreDown), Some("echo down"));
        assert_eq!(iface.hook(HookStage::PreUp), None);
    }

    #[test]
    fn first_ipv4_skips_v6() {
        let iface = InterfaceConfig::default()
            .with_address(net("fd00::2/64"))
            .with_address(net("10.0.0.2/24"));
        let config = Config::new(iface);
        assert_eq!(config.first_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn peer_lookup_by_key() {
        let key = PrivateKey::generate().public_key();
        let config = Config::default()
            .with_peer(PeerConfig::new(PrivateKey::generate().public_key()))
            .with_peer(PeerConfig::new(key).with_name("laptop"));
        assert_eq!(config.peer_by_key(&key).map(|p| p.name.as_str()), Some("laptop"));
    }

    #[test]
    fn keepalive_zero_is_disabled() {
        let peer = PeerConfig::default().with_persistent_keepalive(0);
        assert_eq!(peer.persistent_keepalive, None);
        assert_eq!(peer.keepalive_interval(), None);
        let peer = PeerConfig::default().with_persistent_keepalive(25);
        assert_eq!(peer.keepalive_interval(), Some(Duration::from_secs(25)));
    }
}
