//! # wgadmin-cli
//!
//! Command-line front end for `wgadmin-core`.
//!
//! Provides commands for:
//! - Listing tunnel files and their state
//! - Running a tunnel in the foreground
//! - Showing and validating tunnel files
//! - Generating and deriving keys
//! - Deleting tunnel files with a backup copy
//!
//! Commands are generic over the core [`wgadmin_core::Backend`] so they run
//! against the in-memory backend in tests and the kernel backend in
//! production builds (feature `kernel`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod context;
pub mod error;
pub mod output;

pub use cli::{Cli, Commands, Format, LogFormat};
pub use error::CliError;
pub use output::OutputFormat;
