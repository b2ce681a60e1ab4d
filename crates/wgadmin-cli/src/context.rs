//! Settings resolution and manager construction.

use std::sync::Arc;

use wgadmin_core::{InterfaceProbe, LogLevel, ManagerSettings, SystemProbe, TunnelManager};

use crate::cli::Cli;
use crate::error::CliError;

/// Backend used for starting tunnels in this build.
#[cfg(all(feature = "kernel", target_os = "linux"))]
pub type PlatformBackend = wgadmin_core::KernelBackend;

/// Backend used for starting tunnels in this build.
#[cfg(not(all(feature = "kernel", target_os = "linux")))]
pub type PlatformBackend = wgadmin_core::UnsupportedBackend;

/// True if this build can bring tunnels up.
pub const CAN_START_TUNNELS: bool = cfg!(all(feature = "kernel", target_os = "linux"));

/// Settings from the file, then the environment, then flags.
///
/// # Errors
///
/// Returns an error if the settings file exists but is invalid.
pub fn load_settings(cli: &Cli) -> Result<ManagerSettings, CliError> {
    let path = cli.settings.clone().unwrap_or_else(ManagerSettings::default_path);
    let mut settings = ManagerSettings::from_file(&path)?.with_env_overrides();
    if let Some(ref dir) = cli.config_dir {
        settings.config_dir.clone_from(dir);
    }
    if cli.verbose {
        settings.log_level = LogLevel::Verbose;
    }
    Ok(settings)
}

#[cfg(all(feature = "kernel", target_os = "linux"))]
fn platform_backend(settings: &ManagerSettings) -> PlatformBackend {
    wgadmin_core::KernelBackend::new().with_paths(settings.network_paths())
}

#[cfg(not(all(feature = "kernel", target_os = "linux")))]
fn platform_backend(_settings: &ManagerSettings) -> PlatformBackend {
    wgadmin_core::UnsupportedBackend
}

/// Manager over the platform backend and the OS interface list.
///
/// # Errors
///
/// Returns an error if `settings` fail validation.
pub fn platform_manager(settings: ManagerSettings) -> Result<TunnelManager<PlatformBackend>, CliError> {
    let backend = Arc::new(platform_backend(&settings));
    let probe: Arc<dyn InterfaceProbe> = Arc::new(SystemProbe);
    Ok(TunnelManager::new(settings, backend, probe)?)
}
