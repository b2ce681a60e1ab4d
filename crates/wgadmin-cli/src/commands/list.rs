//! List command implementation.

use std::io::Write;

use wgadmin_core::{Backend, TunnelManager};

use crate::error::CliError;
use crate::output::{OutputFormat, TunnelList};

/// List command executor.
#[derive(Debug, Default)]
pub struct ListCommand;

impl ListCommand {
    /// Execute the list command.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel directory cannot be read or output fails.
    pub fn execute<B: Backend, W: Write>(
        &self,
        manager: &TunnelManager<B>,
        writer: &mut W,
        format: &OutputFormat,
    ) -> Result<(), CliError> {
        let tunnels = manager.list_tunnels()?;
        format.write(writer, &TunnelList { tunnels })
    }
}
