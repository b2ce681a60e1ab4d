//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// wgadmin - manage `WireGuard` tunnel files and bring tunnels up.
#[derive(Parser, Debug, Clone)]
#[command(name = "wgadmin")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Settings file. Defaults to `$WGADMIN_SETTINGS`, then the per-user
    /// config directory.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Directory of tunnel files, overriding the settings file and
    /// `$WGADMIN_CONFIG_DIR`.
    #[arg(short, long)]
    pub config_dir: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Log line format on stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Log progress, not just failures.
    #[arg(short, long)]
    pub verbose: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "wgadmin_core=debug,wgadmin_cli=debug"
        } else {
            "info"
        }
    }
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Plain text.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List tunnel files and whether each is active.
    List,

    /// Bring a tunnel up and keep it up until interrupted.
    Up {
        /// Tunnel name.
        name: String,
    },

    /// Parse a tunnel file and print it normalized.
    Show {
        /// Path to the tunnel file.
        path: PathBuf,
    },

    /// Check a tunnel file and report every problem.
    Validate {
        /// Path to the tunnel file.
        path: PathBuf,
    },

    /// Print a new private key.
    Genkey,

    /// Read a private key on stdin and print its public key.
    Pubkey,

    /// Print a new preshared key.
    Genpsk,

    /// Delete a tunnel file.
    ///
    /// The file is copied to the backup directory first unless
    /// `--no-backup` is given.
    Delete {
        /// Tunnel name.
        name: String,

        /// Skip the backup copy.
        #[arg(long)]
        no_backup: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delete_flags() {
        let cli = Cli::try_parse_from(["wgadmin", "delete", "office", "--no-backup"]).expect("parse");
        assert!(matches!(cli.command, Commands::Delete { ref name, no_backup: true } if name == "office"));
    }

    #[test]
    fn json_format_flag() {
        let cli = Cli::try_parse_from(["wgadmin", "--format", "json", "list"]).expect("parse");
        assert_eq!(cli.format, Format::Json);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn logs_at_info_unless_verbose() {
        let quiet = Cli::try_parse_from(["wgadmin", "list"]).expect("parse");
        assert_eq!(quiet.default_log_filter(), "info");
        let verbose = Cli::try_parse_from(["wgadmin", "-v", "list"]).expect("parse");
        assert!(verbose.default_log_filter().contains("wgadmin_core=debug"));
    }

    #[test]
    fn up_requires_a_name() {
        assert!(Cli::try_parse_from(["wgadmin", "up"]).is_err());
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
