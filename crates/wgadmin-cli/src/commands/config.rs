//! Show and validate commands for tunnel files.

use std::io::Write;
use std::path::PathBuf;

use wgadmin_core::config;

use crate::error::CliError;
use crate::output::{OutputFormat, ShownConfig, ValidationReport};

/// Show command executor: parse, then print the normalized file.
#[derive(Debug)]
pub struct ShowCommand {
    path: PathBuf,
}

impl ShowCommand {
    /// Create a new show command.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Execute the show command.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let parsed = config::parse_file(&self.path)?;
        format.write(
            writer,
            &ShownConfig {
                name: parsed.name.clone(),
                peer_count: parsed.peers.len(),
                text: config::serialize(&parsed),
            },
        )
    }
}

/// Validate command executor.
#[derive(Debug)]
pub struct ValidateCommand {
    path: PathBuf,
}

impl ValidateCommand {
    /// Create a new validate command.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Execute the validate command. The report is written either way.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Invalid` if any problem was found, or the parse
    /// error if the file is malformed.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let parsed = config::parse_file(&self.path)?;
        let errors: Vec<String> = config::validate(&parsed).iter().map(ToString::to_string).collect();
        let count = errors.len();
        format.write(
            writer,
            &ValidationReport {
                path: self.path.display().to_string(),
                valid: errors.is_empty(),
                errors,
            },
        )?;
        if count == 0 {
            Ok(())
        } else {
            Err(CliError::Invalid { count })
        }
    }
}
