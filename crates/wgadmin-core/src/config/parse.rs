//! Parser for the INI-like tunnel file format.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use ipnet::IpNet;
use tracing::debug;

use super::{Config, InterfaceConfig, PeerConfig, RouteTable, MAX_PORT_OR_MTU};
use crate::error::{ParseError, Result, TunnelError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
    Unknown,
}

/// A `[Peer]` section being filled in.
struct PeerDraft {
    index: usize,
    line: usize,
    peer: PeerConfig,
}

impl PeerDraft {
    fn field(&self, key: &str) -> String {
        format!("Peer[{}].{key}", self.index)
    }

    fn parse_key(&mut self, key: &str, value: &str, line: usize) -> Result<(), ParseError> {
        match key.to_ascii_lowercase().as_str() {
            "publickey" => {
                let parsed = PublicKey::from_base64(value)
                    .map_err(|e| ParseError::new(line, self.field("PublicKey"), e.to_string()))?;
                self.peer.public_key = Some(parsed);
            }
            "presharedkey" => {
                let parsed = PresharedKey::from_base64(value)
                    .map_err(|e| ParseError::new(line, self.field("PresharedKey"), e.to_string()))?;
                self.peer.preshared_key = Some(parsed);
            }
            "endpoint" => {
                let addr = resolve_endpoint(value)
                    .map_err(|reason| ParseError::new(line, self.field("Endpoint"), reason))?;
                self.peer.endpoint = Some(addr);
            }
            "allowedips" => {
                for entry in split_list(value) {
                    let range = entry.parse::<IpNet>().map_err(|e| {
                        ParseError::new(line, self.field("AllowedIPs"), format!("{entry}: {e}"))
                    })?;
                    self.peer.allowed_ips.push(range);
                }
            }
            "persistentkeepalive" => {
                self.peer.persistent_keepalive = if value.eq_ignore_ascii_case("off") {
                    None
                } else {
                    let secs = parse_bounded(value, u32::from(u16::MAX)).map_err(|reason| {
                        ParseError::new(line, self.field("PersistentKeepalive"), reason)
                    })?;
                    u16::try_from(secs).ok().filter(|s| *s > 0)
                };
            }
            _ => debug!(key, line, "ignoring unknown peer key"),
        }
        Ok(())
    }

    fn finish(self) -> Result<PeerConfig, ParseError> {
        if self.peer.public_key.is_none() {
            return Err(ParseError::new(self.line, self.field("PublicKey"), "required field is missing"));
        }
        if self.peer.allowed_ips.is_empty() {
            return Err(ParseError::new(self.line, self.field("AllowedIPs"), "required field is missing"));
        }
        Ok(self.peer)
    }
}

/// Parses a tunnel file from text.
///
/// Omitted optional keys keep their defaults (MTU 1420, table `auto`).
/// A comment line directly above a section header becomes that section's
/// display name. Unknown keys and sections are ignored.
///
/// # Errors
///
/// Returns `ParseError` on malformed key material, malformed addresses,
/// out-of-range numbers, missing required fields, or an endpoint that
/// does not resolve.
pub fn parse(text: &str) -> Result<Config, ParseError> {
    let mut config = Config::default();
    let mut section = Section::None;
    let mut saw_interface = false;
    let mut draft: Option<PeerDraft> = None;
    let mut peer_count = 0usize;
    let mut previous: Option<&str> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_number = idx + 1;
        let line = raw.trim();
        let prior = previous.replace(line);

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(header) = section_header(line) {
            let name = prior.and_then(comment_name).unwrap_or_default();
            if let Some(done) = draft.take() {
                config.peers.push(done.finish()?);
            }
            section = match header.to_ascii_lowercase().as_str() {
                "interface" => {
                    if saw_interface {
                        return Err(ParseError::new(line_number, "Interface", "duplicate [Interface] section"));
                    }
                    saw_interface = true;
                    config.name = name;
                    Section::Interface
                }
                "peer" => {
                    draft = Some(PeerDraft {
                        index: peer_count,
                        line: line_number,
                        peer: PeerConfig {
                            name,
                            ..PeerConfig::default()
                        },
                    });
                    peer_count += 1;
                    Section::Peer
                }
                other => {
                    debug!(section = other, line = line_number, "ignoring unknown section");
                    Section::Unknown
                }
            };
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ParseError::new(line_number, line, "expected `key = value`"));
        };
        let key = key.trim();
        let value = value.trim();

        match section {
            Section::None => {
                return Err(ParseError::new(line_number, key, "key outside of any section"));
            }
            Section::Interface => parse_interface_key(&mut config.interface, key, value, line_number)?,
            Section::Peer => {
                if let Some(ref mut d) = draft {
                    d.parse_key(key, value, line_number)?;
                }
            }
            Section::Unknown => {}
        }
    }

    if let Some(done) = draft.take() {
        config.peers.push(done.finish()?);
    }

    if !saw_interface {
        return Err(ParseError::missing("Interface"));
    }
    if config.interface.private_key.is_none() {
        return Err(ParseError::missing("Interface.PrivateKey"));
    }

    Ok(config)
}

/// Reads and parses a tunnel file.
///
/// # Errors
///
/// Returns `TunnelError::Io` if the file cannot be read and
/// `TunnelError::Parse` if its contents are malformed.
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let text = std::fs::read_to_string(path.as_ref())?;
    parse(&text).map_err(TunnelError::from)
}

fn parse_interface_key(
    iface: &mut InterfaceConfig,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ParseError> {
    let err = |field: &str, reason: String| ParseError::new(line, format!("Interface.{field}"), reason);

    match key.to_ascii_lowercase().as_str() {
        "privatekey" => {
            let parsed = PrivateKey::from_base64(value).map_err(|e| err("PrivateKey", e.to_string()))?;
            iface.private_key = Some(parsed);
        }
        "address" => {
            for entry in split_list(value) {
                let cidr = normalize_cidr(entry);
                let addr = cidr
                    .parse::<IpNet>()
                    .map_err(|e| err("Address", format!("{entry}: {e}")))?;
                iface.addresses.push(addr);
            }
        }
        "dns" => {
            for entry in split_list(value) {
                let ip = entry
                    .parse::<IpAddr>()
                    .map_err(|e| err("DNS", format!("{entry}: {e}")))?;
                iface.dns.push(ip);
            }
        }
        "listenport" => {
            let port = parse_bounded(value, MAX_PORT_OR_MTU).map_err(|r| err("ListenPort", r))?;
            iface.listen_port = u16::try_from(port).ok();
        }
        "mtu" => {
            iface.mtu = parse_bounded(value, MAX_PORT_OR_MTU).map_err(|r| err("MTU", r))?;
        }
        "table" => {
            iface.table = value.parse::<RouteTable>().map_err(|r| err("Table", r))?;
        }
        "fwmark" => {
            iface.fwmark = parse_fwmark(value).map_err(|r| err("FwMark", r))?;
        }
        "preup" => iface.pre_up = Some(value.to_string()),
        "postup" => iface.post_up = Some(value.to_string()),
        "predown" => iface.pre_down = Some(value.to_string()),
        "postdown" => iface.post_down = Some(value.to_string()),
        _ => debug!(key, line, "ignoring unknown interface key"),
    }
    Ok(())
}

fn section_header(line: &str) -> Option<&str> {
    line.strip_prefix('[')?.strip_suffix(']').map(str::trim)
}

fn comment_name(line: &str) -> Option<String> {
    let rest = line.strip_prefix("# ").or_else(|| line.strip_prefix('#'))?;
    Some(rest.trim().to_string())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Appends `/32` or `/128` to a bare address.
fn normalize_cidr(entry: &str) -> String {
    if entry.contains('/') {
        entry.to_string()
    } else if entry.contains(':') {
        format!("{entry}/128")
    } else {
        format!("{entry}/32")
    }
}

fn parse_bounded(value: &str, max: u32) -> Result<u32, String> {
    let n = value
        .parse::<u64>()
        .map_err(|e| format!("{value:?} is not a number: {e}"))?;
    u32::try_from(n)
        .ok()
        .filter(|n| *n <= max)
        .ok_or_else(|| format!("{n} is out of range 0-{max}"))
}

fn parse_fwmark(value: &str) -> Result<Option<u32>, String> {
    if value.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed
        .map(Some)
        .map_err(|e| format!("{value:?} is not a valid mark: {e}"))
}

/// Resolves `host:port` or `[v6]:port` to a socket address.
fn resolve_endpoint(value: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("{value:?} is missing a port"))?;
    if host.is_empty() {
        return Err(format!("{value:?} is missing a host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|e| format!("invalid port in {value:?}: {e}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {value:?}: {e}"))?
        .next()
        .ok_or_else(|| format!("{value:?} resolved to no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MTU;
    use test_case::test_case;

    const PRIV: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const PUB: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

    fn minimal(extra_interface: &str, peers: &str) -> String {
        format!("[Interface]\nPrivateKey = {PRIV}\n{extra_interface}\n{peers}")
    }

    #[test]
    fn defaults_applied_when_omitted() {
        let config = parse(&minimal("Address = 10.0.0.2/24", "")).expect("valid");
        assert_eq!(config.interface.mtu, DEFAULT_MTU);
        assert_eq!(config.interface.table, RouteTable::Auto);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn full_tunnel_scenario() {
        let text = minimal(
            "Address = 10.0.0.2/24",
            &format!("[Peer]\nPublicKey = {PUB}\nAllowedIPs = 0.0.0.0/0\n"),
        );
        let config = parse(&text).expect("valid");
        assert!(config.has_default_route());
        assert!(crate::config::validate(&config).is_empty());
        assert_eq!(config.peers[0].endpoint, None);
    }

    #[test]
    fn peers_without_comments_have_empty_names_in_order() {
        let other = PrivateKey::generate().public_key().to_base64();
        let text = minimal(
            "Address = 10.0.0.2/24",
            &format!(
                "[Peer]\nPublicKey = {PUB}\nAllowedIPs = 10.0.0.1/32\n\n[Peer]\nPublicKey = {other}\nAllowedIPs = 10.0.0.3/32\n"
            ),
        );
        let config = parse(&text).expect("valid");
        assert_eq!(config.peers.len(), 2);
        assert!(config.peers.iter().all(|p| p.name.is_empty()));
        assert_eq!(config.peers[0].public_key.map(|k| k.to_base64()).as_deref(), Some(PUB));
        assert_eq!(config.peers[1].public_key.map(|k| k.to_base64()), Some(other));
    }

    #[test]
    fn comment_names_are_captured() {
        let text = format!(
            "# office\n[Interface]\nPrivateKey = {PRIV}\n\n#laptop\n[Peer]\nPublicKey = {PUB}\nAllowedIPs = 10.0.0.1/32\n"
        );
        let config = parse(&text).expect("valid");
        assert_eq!(config.name, "office");
        assert_eq!(config.peers[0].name, "laptop");
    }

    #[test]
    fn comment_separated_by_blank_line_is_not_a_name() {
        let text = format!("# just a note\n\n[Interface]\nPrivateKey = {PRIV}\n");
        let config = parse(&text).expect("valid");
        assert!(config.name.is_empty());
    }

    #[test]
    fn bare_addresses_get_host_prefix() {
        let config = parse(&minimal("Address = 10.0.0.2, fd00::2, 10.1.0.1/16", "")).expect("valid");
        let addrs: Vec<String> = config.interface.addresses.iter().map(ToString::to_string).collect();
        assert_eq!(addrs, ["10.0.0.2/32", "fd00::2/128", "10.1.0.1/16"]);
    }

    #[test]
    fn allowed_ips_are_not_normalized() {
        let text = minimal("", &format!("[Peer]\nPublicKey = {PUB}\nAllowedIPs = 10.0.0.1\n"));
        let err = parse(&text).expect_err("bare allowed ip");
        assert_eq!(err.field, "Peer[0].AllowedIPs");
    }

    #[test]
    fn empty_list_entries_are_skipped() {
        let config = parse(&minimal("DNS = 1.1.1.1, , 9.9.9.9,", "")).expect("valid");
        assert_eq!(config.interface.dns.len(), 2);
    }

    #[test_case("FwMark = 0x1f", Some(31) ; "hex")]
    #[test_case("FwMark = 51820", Some(51820) ; "decimal")]
    #[test_case("FwMark = off", None ; "off")]
    fn fwmark_forms(line: &str, expected: Option<u32>) {
        let config = parse(&minimal(line, "")).expect("valid");
        assert_eq!(config.interface.fwmark, expected);
    }

    #[test_case("MTU = 70000", "Interface.MTU" ; "mtu too large")]
    #[test_case("ListenPort = 65536", "Interface.ListenPort" ; "port too large")]
    #[test_case("ListenPort = -1", "Interface.ListenPort" ; "negative port")]
    #[test_case("DNS = one.one.one.one", "Interface.DNS" ; "dns hostname")]
    #[test_case("Address = 10.0.0.300/24", "Interface.Address" ; "bad address")]
    #[test_case("FwMark = 0xzz", "Interface.FwMark" ; "bad fwmark")]
    fn interface_field_errors(line: &str, field: &str) {
        let err = parse(&minimal(line, "")).expect_err("should fail");
        assert_eq!(err.field, field);
        assert_eq!(err.line, 3);
    }

    #[test]
    fn short_private_key_rejected() {
        let err = parse("[Interface]\nPrivateKey = AAAA\n").expect_err("short key");
        assert_eq!(err.field, "Interface.PrivateKey");
    }

    #[test]
    fn missing_private_key_rejected() {
        let err = parse("[Interface]\nAddress = 10.0.0.2/24\n").expect_err("missing key");
        assert_eq!(err.field, "Interface.PrivateKey");
    }

    #[test]
    fn peer_missing_public_key_rejected() {
        let err = parse(&minimal("", "[Peer]\nAllowedIPs = 10.0.0.0/24\n")).expect_err("missing");
        assert_eq!(err.field, "Peer[0].PublicKey");
    }

    #[test]
    fn peer_missing_allowed_ips_rejected() {
        let err = parse(&minimal("", &format!("[Peer]\nPublicKey = {PUB}\n"))).expect_err("missing");
        assert_eq!(err.field, "Peer[0].AllowedIPs");
    }

    #[test]
    fn unresolvable_endpoint_is_an_error() {
        let text = minimal(
            "",
            &format!("[Peer]\nPublicKey = {PUB}\nAllowedIPs = 10.0.0.0/24\nEndpoint = vpn.invalid\n"),
        );
        let err = parse(&text).expect_err("no port");
        assert_eq!(err.field, "Peer[0].Endpoint");
    }

    #[test]
    fn literal_endpoints_resolve() {
        let text = minimal(
            "",
            &format!(
                "[Peer]\nPublicKey = {PUB}\nAllowedIPs = ::/0\nEndpoint = [2001:db8::1]:51820\nPersistentKeepalive = 25\n"
            ),
        );
        let config = parse(&text).expect("valid");
        let peer = &config.peers[0];
        assert_eq!(peer.endpoint, Some("[2001:db8::1]:51820".parse().expect("addr")));
        assert_eq!(peer.persistent_keepalive, Some(25));
    }

    #[test]
    fn unknown_keys_and_sections_ignored() {
        let text = minimal("SaveConfig = true", "[Extra]\nFoo = bar\n");
        assert!(parse(&text).is_ok());
    }

    #[test]
    fn key_outside_section_rejected() {
        let err = parse("Foo = bar\n[Interface]\n").expect_err("outside");
        assert_eq!(err.line, 1);
    }

    #[test]
    fn keys_are_case_insensitive() {
        let config = parse(&format!("[interface]\nprivatekey = {PRIV}\nmtu = 1280\n")).expect("valid");
        assert_eq!(config.interface.mtu, 1280);
    }

    #[test]
    fn hooks_are_kept_verbatim() {
        let config = parse(&minimal("PostUp = iptables -A FORWARD -i %i -j ACCEPT", "")).expect("valid");
        assert_eq!(
            config.interface.post_up.as_deref(),
            Some("iptables -A FORWARD -i %i -j ACCEPT")
        );
    }

    #[test]
    fn parse_file_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = parse_file(dir.path().join("nope.conf")).expect_err("missing");
        assert!(matches!(err, TunnelError::Io(_)));
    }
}
