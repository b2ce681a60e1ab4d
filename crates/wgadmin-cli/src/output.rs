//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;
use std::time::SystemTime;

use serde::Serialize;
use wgadmin_core::{TunnelStatus, TunnelSummary};

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => value.write_table(writer)?,
        }
        Ok(())
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

/// Tunnel files for `list`.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelList {
    /// One entry per tunnel file.
    pub tunnels: Vec<TunnelSummary>,
}

impl TableDisplay for TunnelList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.tunnels.is_empty() {
            writeln!(writer, "No tunnels configured")?;
            return Ok(());
        }

        writeln!(writer, "{:<16}  {:<8}  {:<15}", "NAME", "STATE", "LOCAL IP")?;
        writeln!(writer, "{}", "─".repeat(43))?;
        for tunnel in &self.tunnels {
            let ip = tunnel.local_ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
            let state = if tunnel.active { "active" } else { "inactive" };
            writeln!(writer, "{:<16}  {:<8}  {:<15}", tunnel.name, state, ip)?;
        }
        Ok(())
    }
}

impl TableDisplay for TunnelStatus {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        let now = SystemTime::now();
        writeln!(writer, "interface: {} ({})", self.interface, self.state)?;
        if !self.name.is_empty() {
            writeln!(writer, "  name: {}", self.name)?;
        }
        if let Some(key) = self.public_key {
            writeln!(writer, "  public key: {key}")?;
        }
        writeln!(writer, "  listening port: {}", self.listen_port)?;
        if self.fwmark != 0 {
            writeln!(writer, "  fwmark: {:#x}", self.fwmark)?;
        }

        for peer in &self.peers {
            writeln!(writer)?;
            writeln!(writer, "peer: {}", peer.public_key)?;
            if !peer.name.is_empty() {
                writeln!(writer, "  name: {}", peer.name)?;
            }
            if let Some(endpoint) = peer.endpoint {
                writeln!(writer, "  endpoint: {endpoint}")?;
            }
            let ranges: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();
            writeln!(writer, "  allowed ips: {}", ranges.join(", "))?;
            match peer.since_handshake(now) {
                Some(age) => writeln!(writer, "  latest handshake: {}s ago", age.as_secs())?,
                None => writeln!(writer, "  latest handshake: never")?,
            }
            writeln!(writer, "  transfer: {} B received, {} B sent", peer.rx_bytes, peer.tx_bytes)?;
            writeln!(writer, "  health: {}", peer.health)?;
        }
        Ok(())
    }
}

/// A normalized tunnel file for `show`.
#[derive(Debug, Clone, Serialize)]
pub struct ShownConfig {
    /// Display name from the file.
    pub name: String,
    /// Number of peers.
    pub peer_count: usize,
    /// Serialized text.
    pub text: String,
}

impl TableDisplay for ShownConfig {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        write!(writer, "{}", self.text)?;
        Ok(())
    }
}

/// Result of `validate`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// File checked.
    pub path: String,
    /// True if no problems were found.
    pub valid: bool,
    /// One entry per problem.
    pub errors: Vec<String>,
}

impl TableDisplay for ValidationReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.valid {
            writeln!(writer, "{}: ok", self.path)?;
            return Ok(());
        }
        writeln!(writer, "{}: {} problem(s)", self.path, self.errors.len())?;
        for error in &self.errors {
            writeln!(writer, "  - {error}")?;
        }
        Ok(())
    }
}

/// A single key for `genkey`, `pubkey` and `genpsk`.
#[derive(Debug, Clone, Serialize)]
pub struct KeyOutput {
    /// Base64 key.
    pub key: String,
}

impl TableDisplay for KeyOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "{}", self.key)?;
        Ok(())
    }
}

/// Result of `delete`.
#[derive(Debug, Clone, Serialize)]
pub struct Deleted {
    /// Tunnel name.
    pub name: String,
    /// Where the backup was written.
    pub backup: Option<String>,
}

impl TableDisplay for Deleted {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        match self.backup {
            Some(ref path) => writeln!(writer, "Deleted {} (backup at {path})", self.name)?,
            None => writeln!(writer, "Deleted {}", self.name)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn render<T: Serialize + TableDisplay>(format: Format, value: &T) -> String {
        let mut buf = Vec::new();
        OutputFormat::new(format).write(&mut buf, value).expect("write");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn tunnel_list_table() {
        let list = TunnelList {
            tunnels: vec![
                TunnelSummary {
                    name: "home".into(),
                    local_ip: None,
                    active: false,
                },
                TunnelSummary {
                    name: "office".into(),
                    local_ip: Some(Ipv4Addr::new(10, 8, 0, 2)),
                    active: true,
                },
            ],
        };
        let out = render(Format::Table, &list);
        assert!(out.contains("home"));
        assert!(out.contains("unknown"));
        assert!(out.contains("10.8.0.2"));
        assert!(out.contains("active"));
    }

    #[test]
    fn empty_list() {
        let out = render(Format::Table, &TunnelList { tunnels: Vec::new() });
        assert_eq!(out, "No tunnels configured\n");
    }

    #[test]
    fn tunnel_list_json() {
        let list = TunnelList {
            tunnels: vec![TunnelSummary {
                name: "office".into(),
                local_ip: Some(Ipv4Addr::new(10, 8, 0, 2)),
                active: true,
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&render(Format::Json, &list)).expect("json");
        assert_eq!(value["tunnels"][0]["local_ip"], "10.8.0.2");
        assert_eq!(value["tunnels"][0]["active"], true);
    }

    #[test]
    fn validation_report_lists_problems() {
        let report = ValidationReport {
            path: "wg0.conf".into(),
            valid: false,
            errors: vec!["Interface.Address: required".into(), "Peer[0].AllowedIPs: required".into()],
        };
        let out = render(Format::Table, &report);
        assert!(out.starts_with("wg0.conf: 2 problem(s)"));
        assert!(out.contains("  - Peer[0].AllowedIPs: required"));
    }

    #[test]
    fn key_is_bare_in_table_mode() {
        let out = render(Format::Table, &KeyOutput { key: "abc=".into() });
        assert_eq!(out, "abc=\n");
    }
}
