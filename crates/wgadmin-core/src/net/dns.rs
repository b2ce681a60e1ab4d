//! `resolv.conf` rewriting used when no resolver daemon is available.

use std::fmt::Write as FmtWrite;
use std::net::IpAddr;

/// Prefix of the header line written at the top of a rewritten file.
pub const GENERATED_HEADER: &str = "# Generated by wgadmin for";

/// Renders a resolver file that puts `servers` first.
///
/// The original content is kept below the new servers. For a full tunnel
/// its `nameserver` lines are commented out so queries cannot leak to the
/// previous resolvers; other directives (`search`, `options`) stay active.
#[must_use]
pub fn render_resolv_conf(original: &str, servers: &[IpAddr], interface: &str, full_tunnel: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{GENERATED_HEADER} {interface}");
    for server in servers {
        let _ = writeln!(out, "nameserver {server}");
    }

    for line in original.lines() {
        let active_nameserver = line.trim_start().starts_with("nameserver");
        if full_tunnel && active_nameserver {
            let _ = writeln!(out, "# {line}");
        } else {
            let _ = writeln!(out, "{line}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> Vec<IpAddr> {
        vec!["10.0.0.1".parse().expect("ip"), "fd00::1".parse().expect("ip")]
    }

    const ORIGINAL: &str = "# managed by dhcp\nnameserver 192.168.1.1\nsearch lan\n";

    #[test]
    fn split_tunnel_keeps_existing_servers() {
        let out = render_resolv_conf(ORIGINAL, &servers(), "wg0", false);
        assert_eq!(
            out,
            "# Generated by wgadmin for wg0\nnameserver 10.0.0.1\nnameserver fd00::1\n\
             # managed by dhcp\nnameserver 192.168.1.1\nsearch lan\n"
        );
    }

    #[test]
    fn full_tunnel_comments_out_old_servers() {
        let out = render_resolv_conf(ORIGINAL, &servers(), "wg0", true);
        assert!(out.contains("\n# nameserver 192.168.1.1\n"));
        assert!(out.contains("\nsearch lan\n"));
        assert!(out.starts_with("# Generated by wgadmin for wg0\nnameserver 10.0.0.1\n"));
    }

    #[test]
    fn empty_original() {
        let out = render_resolv_conf("", &servers()[..1], "wg1", true);
        assert_eq!(out, "# Generated by wgadmin for wg1\nnameserver 10.0.0.1\n");
    }
}
