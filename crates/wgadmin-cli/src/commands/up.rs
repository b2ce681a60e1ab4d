//! Up command: run one tunnel in the foreground.

use std::io::Write;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wgadmin_core::{Backend, TunnelManager};

use crate::error::CliError;
use crate::output::OutputFormat;

/// Up command executor.
#[derive(Debug)]
pub struct UpCommand {
    name: String,
}

impl UpCommand {
    /// Create a new up command.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Starts the tunnel, prints its status and blocks until `shutdown`
    /// fires or the tunnel stops on its own, then tears everything down.
    ///
    /// `shutdown` also aborts a start that is still in progress.
    ///
    /// # Errors
    ///
    /// Returns the start error, or cleanup errors from the final stop.
    pub async fn execute<B: Backend, W: Write>(
        &self,
        manager: &TunnelManager<B>,
        writer: &mut W,
        format: &OutputFormat,
        shutdown: &CancellationToken,
    ) -> Result<(), CliError> {
        manager.toggle_tunnel(&self.name, true, shutdown).await?;
        let Some(client) = manager.registry().get(&self.name) else {
            return Ok(());
        };

        match client.status().await {
            Ok(status) => format.write(writer, &status)?,
            Err(e) => warn!(tunnel = %self.name, error = %e, "cannot read tunnel status"),
        }
        writer.flush()?;

        tokio::select! {
            () = shutdown.cancelled() => info!(tunnel = %self.name, "shutting down"),
            () = client.wait() => info!(tunnel = %self.name, "tunnel stopped"),
        }

        manager.shutdown().await?;
        Ok(())
    }
}
