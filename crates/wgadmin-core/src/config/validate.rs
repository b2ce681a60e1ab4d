//! Config validation and field-level input checks.

use std::collections::HashSet;

use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{Config, RouteTable, MAX_PORT_OR_MTU};
use crate::error::{Result, TunnelError, ValidationError};
use crate::keys::{PrivateKey, KEY_BASE64_LEN};

/// Longest interface name the kernel accepts (`IFNAMSIZ - 1`).
pub const MAX_TUNNEL_NAME_LENGTH: usize = 15;

static TUNNEL_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_=+.-]+$").unwrap_or_else(|_| unreachable!()));

static ENDPOINT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-zA-Z0-9.-]+|\[[0-9a-fA-F:.]+\]):(\d{1,5})$").unwrap_or_else(|_| unreachable!())
});

/// Checks a config against every field invariant.
///
/// Returns all violations at once, each tagged with its field path.
/// An empty list means the config is usable.
#[must_use]
pub fn validate(config: &Config) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let iface = &config.interface;

    if has_control_chars(&config.name) {
        errors.push(ValidationError::new("Name", "must be a single line of printable text"));
    }
    if iface.private_key.is_none() {
        errors.push(ValidationError::new("Interface.PrivateKey", "required"));
    }
    if iface.addresses.is_empty() {
        errors.push(ValidationError::new("Interface.Address", "at least one address is required"));
    }
    if iface.mtu > MAX_PORT_OR_MTU {
        errors.push(ValidationError::new(
            "Interface.MTU",
            format!("{} is out of range 0-{MAX_PORT_OR_MTU}", iface.mtu),
        ));
    }
    if let RouteTable::Named(ref name) = iface.table {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            errors.push(ValidationError::new("Interface.Table", format!("invalid table name {name:?}")));
        }
    }

    let own_key = iface.public_key();
    let mut seen = HashSet::new();
    for (i, peer) in config.peers.iter().enumerate() {
        let field = |name: &str| format!("Peer[{i}].{name}");
        if has_control_chars(&peer.name) {
            errors.push(ValidationError::new(field("Name"), "must be a single line of printable text"));
        }
        match peer.public_key {
            None => errors.push(ValidationError::new(field("PublicKey"), "required")),
            Some(key) => {
                if !seen.insert(key) {
                    errors.push(ValidationError::new(field("PublicKey"), "duplicate peer public key"));
                } else if own_key == Some(key) {
                    errors.push(ValidationError::new(field("PublicKey"), "peer key matches the interface's own key"));
                }
            }
        }
        if peer.allowed_ips.is_empty() {
            errors.push(ValidationError::new(field("AllowedIPs"), "at least one range is required"));
        }
        if peer.endpoint.is_some_and(|e| e.port() == 0) {
            errors.push(ValidationError::new(field("Endpoint"), "port must be 1-65535"));
        }
    }

    errors
}

fn has_control_chars(text: &str) -> bool {
    text.chars().any(char::is_control)
}

/// True for a 44-character base64 string that decodes to 32 bytes.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    key.len() == KEY_BASE64_LEN && PrivateKey::from_base64(key).is_ok()
}

/// True for a single CIDR such as `10.0.0.2/24`.
#[must_use]
pub fn is_valid_address(cidr: &str) -> bool {
    cidr.trim().parse::<IpNet>().is_ok()
}

/// True for a non-empty comma-separated list of CIDRs.
#[must_use]
pub fn is_valid_allowed_ips(list: &str) -> bool {
    let entries: Vec<&str> = list.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    !entries.is_empty() && entries.iter().all(|e| is_valid_address(e))
}

/// True for `host:port` or `[v6]:port` with a port in 1-65535.
#[must_use]
pub fn is_valid_endpoint(endpoint: &str) -> bool {
    ENDPOINT_REGEX
        .captures(endpoint.trim())
        .and_then(|c| c.get(1))
        .and_then(|port| port.as_str().parse::<u32>().ok())
        .is_some_and(|port| (1..=MAX_PORT_OR_MTU).contains(&port))
}

/// True if `name` can be used as a tunnel file name and interface name.
#[must_use]
pub fn is_valid_tunnel_name(name: &str) -> bool {
    validate_tunnel_name(name).is_ok()
}

/// Checks a tunnel name: 1-15 characters of `[A-Za-z0-9_=+.-]`.
///
/// # Errors
///
/// Returns `TunnelError::InvalidName` describing the broken rule.
pub fn validate_tunnel_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TunnelError::invalid_name(name, "name is empty"));
    }
    if name.len() > MAX_TUNNEL_NAME_LENGTH {
        return Err(TunnelError::invalid_name(
            name,
            format!("longer than {MAX_TUNNEL_NAME_LENGTH} characters"),
        ));
    }
    if !TUNNEL_NAME_REGEX.is_match(name) {
        return Err(TunnelError::invalid_name(name, "only letters, digits and _=+.- are allowed"));
    }
    if name == "." || name == ".." {
        return Err(TunnelError::invalid_name(name, "reserved path component"));
    }
    Ok(())
}
