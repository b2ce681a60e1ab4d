//! Serializer for the tunnel file format.

use std::fmt::Write as FmtWrite;

use super::{Config, PeerConfig, RouteTable, DEFAULT_MTU};
use crate::hook::HookStage;

/// A display name as one comment line. Control characters become spaces
/// so a name can never start a new line of the file.
fn comment_line(name: &str) -> String {
    let flat: String = name.chars().map(|c| if c.is_control() { ' ' } else { c }).collect();
    format!("# {}", flat.trim())
}

fn join<T: ToString>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Renders a config in the on-disk format.
///
/// Fields are written in a fixed order and omitted when unset, so that
/// parsing the output reproduces the config.
#[must_use]
pub fn serialize(config: &Config) -> String {
    let mut output = String::new();
    let iface = &config.interface;

    if !config.name.is_empty() {
        let _ = writeln!(output, "{}", comment_line(&config.name));
    }
    output.push_str("[Interface]\n");

    if let Some(ref key) = iface.private_key {
        let _ = writeln!(output, "PrivateKey = {}", key.to_base64());
    }
    if !iface.addresses.is_empty() {
        let _ = writeln!(output, "Address = {}", join(&iface.addresses));
    }
    if !iface.dns.is_empty() {
        let _ = writeln!(output, "DNS = {}", join(&iface.dns));
    }
    if let Some(port) = iface.listen_port {
        let _ = writeln!(output, "ListenPort = {port}");
    }
    if iface.mtu != DEFAULT_MTU {
        let _ = writeln!(output, "MTU = {}", iface.mtu);
    }
    if iface.table != RouteTable::Auto {
        let _ = writeln!(output, "Table = {}", iface.table);
    }
    if let Some(mark) = iface.fwmark {
        let _ = writeln!(output, "FwMark = {mark}");
    }
    for stage in HookStage::ALL {
        if let Some(script) = iface.hook(stage) {
            let _ = writeln!(output, "{stage} = {script}");
        }
    }

    for peer in &config.peers {
        write_peer(&mut output, peer);
    }

    output
}

fn write_peer(output: &mut String, peer: &PeerConfig) {
    output.push('\n');
    if !peer.name.is_empty() {
        let _ = writeln!(output, "{}", comment_line(&peer.name));
    }
    output.push_str("[Peer]\n");

    if let Some(ref key) = peer.public_key {
        let _ = writeln!(output, "PublicKey = {}", key.to_base64());
    }
    if !peer.allowed_ips.is_empty() {
        let _ = writeln!(output, "AllowedIPs = {}", join(&peer.allowed_ips));
    }
    if let Some(endpoint) = peer.endpoint {
        let _ = writeln!(output, "Endpoint = {endpoint}");
    }
    if let Some(interval) = peer.keepalive_interval() {
        let _ = writeln!(output, "PersistentKeepalive = {}", interval.as_secs());
    }
    if let Some(ref psk) = peer.preshared_key {
        let _ = writeln!(output, "PresharedKey = {}", psk.to_base64());
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, SocketAddr};

    use ipnet::IpNet;
    use proptest::prelude::*;

    use super::*;
    use crate::config::{parse, InterfaceConfig};
    use crate::keys::{PresharedKey, PrivateKey, PublicKey};

    fn sample() -> Config {
        let peer = PeerConfig::new(PrivateKey::generate().public_key())
            .with_name("gateway")
            .with_allowed_ip("0.0.0.0/0".parse().expect("cidr"))
            .with_allowed_ip("::/0".parse().expect("cidr"))
            .with_endpoint("203.0.113.5:51820".parse().expect("addr"))
            .with_persistent_keepalive(25)
            .with_preshared_key(PresharedKey::generate());
        Config::new(
            InterfaceConfig::new(PrivateKey::generate())
                .with_address("10.0.0.2/24".parse().expect("cidr"))
                .with_dns("1.1.1.1".parse().expect("ip"))
                .with_listen_port(51820)
                .with_mtu(1380)
                .with_table(RouteTable::Off)
                .with_fwmark(0x1234)
                .with_hook(HookStage::PreUp, "echo %i"),
        )
        .with_name("home")
        .with_peer(peer)
    }

    #[test]
    fn field_order_is_fixed() {
        let text = serialize(&sample());
        let keys: Vec<&str> = text
            .lines()
            .filter_map(|l| l.split_once(" = ").map(|(k, _)| k))
            .collect();
        assert_eq!(
            keys,
            [
                "PrivateKey", "Address", "DNS", "ListenPort", "MTU", "Table", "FwMark", "PreUp",
                "PublicKey", "AllowedIPs", "Endpoint", "PersistentKeepalive", "PresharedKey",
            ]
        );
    }

    #[test]
    fn defaults_are_omitted() {
        let config = Config::new(InterfaceConfig::new(PrivateKey::generate()));
        let text = serialize(&config);
        assert!(!text.contains("MTU"));
        assert!(!text.contains("Table"));
        assert!(!text.contains("ListenPort"));
    }

    #[test]
    fn fwmark_written_in_decimal() {
        let text = serialize(&sample());
        assert!(text.contains("FwMark = 4660\n"));
    }

    #[test]
    fn names_written_as_comments() {
        let text = serialize(&sample());
        assert!(text.starts_with("# home\n[Interface]\n"));
        assert!(text.contains("\n\n# gateway\n[Peer]\n"));
    }

    #[test]
    fn line_breaks_in_names_stay_inside_the_comment() {
        let mut config = sample().with_name("home\nPreDown = rm -rf /");
        config.peers[0].name = "laptop\r\nPostUp = touch /tmp/owned".into();
        let text = serialize(&config);
        assert!(text.starts_with("# home PreDown = rm -rf /\n[Interface]\n"));
        assert!(text.contains("\n# laptop  PostUp = touch /tmp/owned\n[Peer]\n"));

        let parsed = parse(&text).expect("parse");
        assert_eq!(parsed.interface.post_up, None);
        assert_eq!(parsed.interface.pre_down, None);
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].name, "laptop  PostUp = touch /tmp/owned");
    }

    #[test]
    fn zero_keepalive_roundtrips_as_unset() {
        let mut config = sample();
        config.peers[0] = config.peers[0].clone().with_persistent_keepalive(0);
        let text = serialize(&config);
        assert!(!text.contains("PersistentKeepalive"));
        assert_eq!(parse(&text), Ok(config));
    }

    #[test]
    fn sample_roundtrips() {
        let config = sample();
        assert_eq!(parse(&serialize(&config)), Ok(config));
    }

    fn arb_key() -> impl Strategy<Value = [u8; 32]> {
        prop::array::uniform32(any::<u8>())
    }

    fn arb_ip() -> impl Strategy<Value = IpAddr> {
        prop_oneof![
            any::<[u8; 4]>().prop_map(IpAddr::from),
            any::<[u8; 16]>().prop_map(IpAddr::from),
        ]
    }

    fn arb_net() -> impl Strategy<Value = IpNet> {
        arb_ip().prop_flat_map(|ip| {
            let max: u8 = if ip.is_ipv4() { 32 } else { 128 };
            (Just(ip), 0..=max).prop_map(|(ip, len)| IpNet::new(ip, len).expect("prefix in range"))
        })
    }

    fn arb_name() -> impl Strategy<Value = String> {
        prop_oneof![Just(String::new()), "[A-Za-z0-9][A-Za-z0-9 _-]{0,12}[A-Za-z0-9]"]
    }

    fn arb_table() -> impl Strategy<Value = RouteTable> {
        prop_oneof![
            Just(RouteTable::Auto),
            Just(RouteTable::Off),
            any::<u32>().prop_map(RouteTable::Id),
            "[a-z][a-z_]{0,8}"
                .prop_filter("reserved words", |s| s != "auto" && s != "off")
                .prop_map(RouteTable::Named),
        ]
    }

    fn arb_peer() -> impl Strategy<Value = PeerConfig> {
        (
            arb_name(),
            arb_key(),
            proptest::option::of(arb_key()),
            proptest::option::of((arb_ip(), any::<u16>()).prop_map(|(ip, p)| SocketAddr::new(ip, p))),
            prop::collection::vec(arb_net(), 1..4),
            proptest::option::of(1..=u16::MAX),
        )
            .prop_map(|(name, pk, psk, endpoint, allowed_ips, keepalive)| PeerConfig {
                name,
                public_key: Some(PublicKey::from_bytes_array(pk)),
                preshared_key: psk.map(|b| PresharedKey::from_bytes(&b).expect("32 bytes")),
                endpoint,
                allowed_ips,
                persistent_keepalive: keepalive,
            })
    }

    fn arb_config() -> impl Strategy<Value = Config> {
        (
            arb_name(),
            arb_key(),
            prop::collection::vec(arb_net(), 0..3),
            prop::collection::vec(arb_ip(), 0..3),
            proptest::option::of(any::<u16>()),
            0..=65_535u32,
            arb_table(),
            proptest::option::of(any::<u32>()),
            proptest::option::of("[a-z][a-z %/-]{0,15}[a-z]"),
            prop::collection::vec(arb_peer(), 0..3),
        )
            .prop_map(
                |(name, key, addresses, dns, listen_port, mtu, table, fwmark, post_up, peers)| Config {
                    name,
                    interface: InterfaceConfig {
                        private_key: Some(PrivateKey::from_bytes_array(key)),
                        addresses,
                        listen_port,
                        dns,
                        mtu,
                        table,
                        fwmark,
                        post_up,
                        ..InterfaceConfig::default()
                    },
                    peers,
                },
            )
    }

    proptest! {
        #[test]
        fn parse_inverts_serialize(config in arb_config()) {
            let text = serialize(&config);
            prop_assert_eq!(parse(&text), Ok(config));
        }
    }
}
