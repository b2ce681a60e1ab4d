//! Front door for callers that manage tunnels by name.
//!
//! [`ManagerSettings`] describes where things live on disk; [`TunnelManager`]
//! ties the tunnel-file store, the registry and the interface probe
//! together.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::client::{ClientOptions, LogLevel, DEFAULT_SOCKET_DIR};
use crate::config::{self, Config, ConfigStore};
use crate::error::{InvalidKeyError, Result, TunnelError, ValidationError};
use crate::keys::{self, KeyPair};
use crate::net::NetworkPaths;
use crate::probe::InterfaceProbe;
use crate::registry::TunnelRegistry;

/// Environment variable naming the settings file.
pub const SETTINGS_ENV: &str = "WGADMIN_SETTINGS";

/// Environment variable overriding the tunnel-file directory.
pub const CONFIG_DIR_ENV: &str = "WGADMIN_CONFIG_DIR";

/// Default tunnel-file directory.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/wireguard";

/// Name of the backup directory under the user's home.
pub const BACKUP_DIR_NAME: &str = ".wgadmin-backups";

/// Where the tool keeps its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Directory of `<name>.conf` tunnel files.
    pub config_dir: PathBuf,
    /// Where deleted tunnel files are copied.
    pub backup_dir: PathBuf,
    /// Directory of control sockets.
    pub socket_dir: PathBuf,
    /// System resolver file.
    pub resolv_conf: PathBuf,
    /// Routing-table name registry.
    pub rt_tables: PathBuf,
    /// Reporting level for tunnels.
    pub log_level: LogLevel,
    /// Shell for hook scripts.
    pub hook_shell: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        let paths = NetworkPaths::default();
        Self {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            backup_dir: dirs::home_dir().map_or_else(|| PathBuf::from(BACKUP_DIR_NAME), |home| home.join(BACKUP_DIR_NAME)),
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            resolv_conf: paths.resolv_conf,
            rt_tables: paths.rt_tables,
            log_level: LogLevel::default(),
            hook_shell: "sh".to_string(),
        }
    }
}

impl ManagerSettings {
    /// Loads settings from a TOML file. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Settings` if the file cannot be read, is not
    /// valid TOML or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(TunnelError::settings(path, format!("failed to read: {e}"))),
        };
        Self::parse(&content).map_err(|reason| TunnelError::settings(path, reason))
    }

    /// Parses settings from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Settings` if the TOML is invalid or fails
    /// validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        Self::parse(content).map_err(|reason| TunnelError::settings("<inline>", reason))
    }

    fn parse(content: &str) -> std::result::Result<Self, String> {
        let settings: Self = toml::from_str(content).map_err(|e| format!("invalid TOML: {e}"))?;
        settings.check()?;
        Ok(settings)
    }

    /// Checks that every path is set.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Settings` naming the first empty field.
    pub fn validate(&self) -> Result<()> {
        self.check().map_err(|reason| TunnelError::settings("<settings>", reason))
    }

    fn check(&self) -> std::result::Result<(), String> {
        let paths = [
            ("config_dir", &self.config_dir),
            ("backup_dir", &self.backup_dir),
            ("socket_dir", &self.socket_dir),
            ("resolv_conf", &self.resolv_conf),
            ("rt_tables", &self.rt_tables),
        ];
        for (field, path) in paths {
            if path.as_os_str().is_empty() {
                return Err(format!("{field} cannot be empty"));
            }
        }
        if self.hook_shell.trim().is_empty() {
            return Err("hook_shell cannot be empty".to_string());
        }
        Ok(())
    }

    /// Applies `WGADMIN_CONFIG_DIR` if set.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
            self.config_dir = PathBuf::from(dir);
        }
        self
    }

    /// Settings file named by `WGADMIN_SETTINGS`, else the per-user default.
    #[must_use]
    pub fn default_path() -> PathBuf {
        std::env::var_os(SETTINGS_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|dir| dir.join("wgadmin").join("settings.toml")))
            .unwrap_or_else(|| PathBuf::from("wgadmin.toml"))
    }

    /// System paths the network configurator touches.
    #[must_use]
    pub fn network_paths(&self) -> NetworkPaths {
        NetworkPaths {
            resolv_conf: self.resolv_conf.clone(),
            rt_tables: self.rt_tables.clone(),
        }
    }

    /// Client template derived from these settings.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::default()
            .with_socket_dir(self.socket_dir.clone())
            .with_log_level(self.log_level)
            .with_hook_shell(self.hook_shell.clone())
    }
}

/// One row of [`TunnelManager::list_tunnels`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelSummary {
    /// Tunnel name (file stem).
    pub name: String,
    /// First IPv4 address on the interface while active.
    pub local_ip: Option<Ipv4Addr>,
    /// True if running here or the interface exists.
    pub active: bool,
}

/// Manages tunnels stored as files in one directory.
pub struct TunnelManager<B: Backend> {
    settings: ManagerSettings,
    registry: TunnelRegistry<B>,
    probe: Arc<dyn InterfaceProbe>,
}

impl<B: Backend> std::fmt::Debug for TunnelManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> TunnelManager<B> {
    /// Creates a manager over `settings.config_dir`.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Settings` if `settings` fails validation.
    pub fn new(settings: ManagerSettings, backend: Arc<B>, probe: Arc<dyn InterfaceProbe>) -> Result<Self> {
        settings.validate()?;
        let store = ConfigStore::new(settings.config_dir.clone());
        let registry = TunnelRegistry::new(backend, store, settings.client_options(), Arc::clone(&probe));
        Ok(Self {
            settings,
            registry,
            probe,
        })
    }

    /// Settings in effect.
    #[must_use]
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Tunnels started by this manager.
    #[must_use]
    pub fn registry(&self) -> &TunnelRegistry<B> {
        &self.registry
    }

    /// Every tunnel file with its activity and local address.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read.
    pub fn list_tunnels(&self) -> Result<Vec<TunnelSummary>> {
        let names = self.registry.store().list_names()?;
        Ok(names
            .into_iter()
            .map(|name| {
                let active = self.registry.is_active(&name);
                let interface = self
                    .registry
                    .get(&name)
                    .map_or_else(|| name.clone(), |client| client.interface_name());
                let local_ip = if active { self.probe.ipv4_address(&interface) } else { None };
                TunnelSummary { name, local_ip, active }
            })
            .collect())
    }

    /// Starts (`activate = true`) or stops the tunnel `name`.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` / `NotRunning` when already in the requested
    /// state; otherwise the start or stop error.
    pub async fn toggle_tunnel(&self, name: &str, activate: bool, cancel: &CancellationToken) -> Result<()> {
        if activate {
            self.registry.start(name, cancel).await.map(|_| ())
        } else {
            self.registry.stop(name).await
        }
    }

    /// Parses the tunnel file at `path`.
    ///
    /// # Errors
    ///
    /// Read or parse failures.
    pub fn parse_config(&self, path: impl AsRef<Path>) -> Result<Config> {
        config::parse_file(path)
    }

    /// Writes `config` as the tunnel file for `name`.
    ///
    /// The config is written as given; call [`Self::validate_config`]
    /// first to reject unusable input.
    ///
    /// # Errors
    ///
    /// `InvalidName` or I/O failures.
    pub fn write_config(&self, name: &str, config: &Config) -> Result<()> {
        self.registry.store().save(name, config)
    }

    /// Every violation in `config`; empty if usable.
    #[must_use]
    pub fn validate_config(&self, config: &Config) -> Vec<ValidationError> {
        config::validate(config)
    }

    /// Deletes the tunnel file for `name`, copying it to the backup
    /// directory first if `backup` is set. Returns the backup path.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if the tunnel is running here, `NotFound` if there
    /// is no file, or I/O failures.
    pub fn delete_tunnel(&self, name: &str, backup: bool) -> Result<Option<PathBuf>> {
        if self.registry.get(name).is_some() {
            return Err(TunnelError::already_running(name));
        }
        let backup_dir = backup.then_some(self.settings.backup_dir.as_path());
        let saved = self.registry.store().delete(name, backup_dir)?;
        info!(tunnel = %name, backed_up = saved.is_some(), "tunnel deleted");
        Ok(saved)
    }

    /// Path of the tunnel file for `name`.
    #[must_use]
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.registry.store().path(name)
    }

    /// True if a tunnel file exists for `name`.
    #[must_use]
    pub fn config_exists(&self, name: &str) -> bool {
        self.registry.store().exists(name)
    }

    /// New private/public pair.
    #[must_use]
    pub fn generate_key_pair(&self) -> KeyPair {
        keys::generate_key_pair()
    }

    /// Public key for a base64 private key.
    ///
    /// # Errors
    ///
    /// `InvalidKeyError` for malformed input.
    pub fn derive_public_key(&self, private_key: &str) -> std::result::Result<String, InvalidKeyError> {
        keys::derive_public_key(private_key)
    }

    /// New preshared key.
    #[must_use]
    pub fn generate_preshared_key(&self) -> String {
        keys::generate_preshared_key()
    }

    /// Stops everything this manager started.
    ///
    /// # Errors
    ///
    /// `Cleanup` with every tunnel that failed to stop cleanly.
    pub async fn shutdown(&self) -> Result<()> {
        self.registry.stop_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings = ManagerSettings::from_toml(r#"config_dir = "/srv/tunnels""#).expect("parse");
        assert_eq!(settings.config_dir, PathBuf::from("/srv/tunnels"));
        assert_eq!(settings.socket_dir, PathBuf::from(DEFAULT_SOCKET_DIR));
        assert_eq!(settings.resolv_conf, PathBuf::from("/etc/resolv.conf"));
        assert_eq!(settings.log_level, LogLevel::Error);
        assert!(settings.backup_dir.ends_with(BACKUP_DIR_NAME));
    }

    #[test]
    fn log_level_is_snake_case() {
        let settings = ManagerSettings::from_toml(r#"log_level = "verbose""#).expect("parse");
        assert_eq!(settings.log_level, LogLevel::Verbose);
        assert!(ManagerSettings::from_toml(r#"log_level = "chatty""#).is_err());
    }

    #[test]
    fn empty_path_rejected() {
        let err = ManagerSettings::from_toml(r#"socket_dir = """#).expect_err("empty");
        assert!(err.to_string().contains("socket_dir"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = ManagerSettings::from_file(dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(settings, ManagerSettings::default());
    }

    #[test]
    fn file_errors_name_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "config_dir = [").expect("write");
        let err = ManagerSettings::from_file(&path).expect_err("bad toml");
        assert!(matches!(err, TunnelError::Settings { path: ref p, .. } if p == &path));
    }

    #[test]
    fn options_follow_settings() {
        let settings = ManagerSettings {
            socket_dir: PathBuf::from("/tmp/s"),
            log_level: LogLevel::Verbose,
            ..ManagerSettings::default()
        };
        let options = settings.client_options();
        assert_eq!(options.socket_dir, PathBuf::from("/tmp/s"));
        assert_eq!(options.log_level, LogLevel::Verbose);
        assert_eq!(options.interface_name, "wg0");
    }
}
