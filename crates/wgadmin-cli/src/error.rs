//! CLI error types.

use thiserror::Error;
use wgadmin_core::{InvalidKeyError, TunnelError};

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// A core operation failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// Key input was malformed.
    #[error("invalid key: {0}")]
    Key(#[from] InvalidKeyError),

    /// The command is not available in this build.
    #[error("{0} is not supported in this build")]
    Unsupported(String),

    /// A tunnel file has problems.
    #[error("{count} problem(s) found")]
    Invalid {
        /// Number of problems.
        count: usize,
    },

    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// The line printed to stderr when a command fails.
    #[must_use]
    pub fn report_line(&self) -> String {
        format!("error: {self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_errors_display_unchanged() {
        let err = CliError::from(TunnelError::not_found("office"));
        assert_eq!(err.to_string(), TunnelError::not_found("office").to_string());
    }

    #[test]
    fn unsupported_names_the_command() {
        let err = CliError::Unsupported("up".into());
        assert_eq!(err.to_string(), "up is not supported in this build");
    }

    #[test]
    fn report_line_is_lowercase_prefixed() {
        let err = CliError::Invalid { count: 2 };
        assert_eq!(err.report_line(), "error: 2 problem(s) found");
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        assert!(matches!(CliError::from(io_err), CliError::Io(_)));
    }
}
