//! Delete command implementation.

use std::io::Write;

use tracing::info;
use wgadmin_core::{Backend, TunnelManager};

use crate::error::CliError;
use crate::output::{Deleted, OutputFormat};

/// Delete command executor.
#[derive(Debug)]
pub struct DeleteCommand {
    name: String,
    backup: bool,
}

impl DeleteCommand {
    /// Create a new delete command.
    #[must_use]
    pub fn new(name: impl Into<String>, backup: bool) -> Self {
        Self {
            name: name.into(),
            backup,
        }
    }

    /// Execute the delete command.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel is running, missing, or the file
    /// cannot be copied or removed.
    pub fn execute<B: Backend, W: Write>(
        &self,
        manager: &TunnelManager<B>,
        writer: &mut W,
        format: &OutputFormat,
    ) -> Result<(), CliError> {
        let backup = manager.delete_tunnel(&self.name, self.backup)?;
        if let Some(ref path) = backup {
            info!(tunnel = %self.name, backup = %path.display(), "backup written");
        }
        format.write(
            writer,
            &Deleted {
                name: self.name.clone(),
                backup: backup.map(|p| p.display().to_string()),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{env, sample_config};
    use wgadmin_core::TunnelError;

    #[test]
    fn deletes_with_backup() {
        let env = env();
        env.manager.write_config("lab", &sample_config()).expect("write");

        let mut out = Vec::new();
        DeleteCommand::new("lab", true)
            .execute(&env.manager, &mut out, &OutputFormat::default())
            .expect("delete");

        assert!(!env.manager.config_exists("lab"));
        assert!(env.dir.path().join("backups").join("lab.conf.bak").is_file());
        assert!(String::from_utf8(out).expect("utf8").contains("backup at"));
    }

    #[test]
    fn missing_tunnel_is_an_error() {
        let env = env();
        let err = DeleteCommand::new("ghost", false)
            .execute(&env.manager, &mut Vec::new(), &OutputFormat::default())
            .expect_err("missing");
        assert!(matches!(err, CliError::Tunnel(TunnelError::NotFound { .. })));
    }
}
