//! CLI command implementations.
//!
//! - [`list`] - Tunnel files and their state
//! - [`up`] - Foreground tunnel
//! - [`config`] - Show and validate tunnel files
//! - [`keys`] - Key generation and derivation
//! - [`delete`] - Tunnel file removal

pub mod config;
pub mod delete;
pub mod keys;
pub mod list;
pub mod up;

pub use config::{ShowCommand, ValidateCommand};
pub use delete::DeleteCommand;
pub use keys::{KeyCommand, KeyKind};
pub use list::ListCommand;
pub use up::UpCommand;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use wgadmin_core::net::NetworkPaths;
    use wgadmin_core::{
        Config, FakeBackend, InterfaceConfig, InterfaceProbe, LogLevel, ManagerSettings, PeerConfig, PrivateKey,
        TunnelManager,
    };

    pub struct Env {
        pub dir: tempfile::TempDir,
        pub backend: Arc<FakeBackend>,
        pub manager: TunnelManager<FakeBackend>,
    }

    pub fn env() -> Env {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::new().with_paths(NetworkPaths {
            resolv_conf: dir.path().join("resolv.conf"),
            rt_tables: dir.path().join("rt_tables"),
        }));
        let settings = ManagerSettings {
            config_dir: dir.path().join("tunnels"),
            backup_dir: dir.path().join("backups"),
            socket_dir: dir.path().join("run"),
            log_level: LogLevel::Silent,
            ..ManagerSettings::default()
        };
        let probe: Arc<dyn InterfaceProbe> = Arc::clone(&backend) as Arc<dyn InterfaceProbe>;
        let manager = TunnelManager::new(settings, Arc::clone(&backend), probe).expect("manager");
        Env { dir, backend, manager }
    }

    pub fn sample_config() -> Config {
        Config::new(InterfaceConfig::new(PrivateKey::generate()).with_address("10.3.0.2/24".parse().expect("cidr")))
            .with_name("lab")
            .with_peer(
                PeerConfig::new(PrivateKey::generate().public_key())
                    .with_allowed_ip("10.3.0.0/24".parse().expect("cidr")),
            )
    }
}
