//! End-to-end tunnel management through the in-memory backend.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wgadmin_core::net::NetworkPaths;
use wgadmin_core::{
    Config, FakeBackend, InterfaceConfig, InterfaceProbe, LogLevel, ManagerSettings, PeerConfig, PrivateKey,
    TunnelError, TunnelManager, TunnelState,
};

struct Harness {
    dir: tempfile::TempDir,
    backend: Arc<FakeBackend>,
    manager: TunnelManager<FakeBackend>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = NetworkPaths {
            resolv_conf: dir.path().join("resolv.conf"),
            rt_tables: dir.path().join("rt_tables"),
        };
        let backend = Arc::new(FakeBackend::new().with_paths(paths.clone()));
        let settings = ManagerSettings {
            config_dir: dir.path().join("tunnels"),
            backup_dir: dir.path().join("backups"),
            socket_dir: dir.path().join("run"),
            resolv_conf: paths.resolv_conf,
            rt_tables: paths.rt_tables,
            log_level: LogLevel::Silent,
            ..ManagerSettings::default()
        };
        let probe: Arc<dyn InterfaceProbe> = Arc::clone(&backend) as Arc<dyn InterfaceProbe>;
        let manager = TunnelManager::new(settings, Arc::clone(&backend), probe).expect("manager");
        Self { dir, backend, manager }
    }
}

fn full_tunnel() -> Config {
    Config::new(
        InterfaceConfig::new(PrivateKey::generate())
            .with_address("10.8.0.2/24".parse().expect("cidr"))
            .with_dns("10.8.0.1".parse().expect("ip")),
    )
    .with_name("office")
    .with_peer(
        PeerConfig::new(PrivateKey::generate().public_key())
            .with_name("gateway")
            .with_endpoint("192.0.2.1:51820".parse().expect("endpoint"))
            .with_allowed_ip("0.0.0.0/0".parse().expect("cidr")),
    )
}

#[tokio::test]
async fn toggle_up_and_down() {
    let h = Harness::new();
    h.manager.write_config("office", &full_tunnel()).expect("write");

    let before = h.manager.list_tunnels().expect("list");
    assert_eq!(before.len(), 1);
    assert!(!before[0].active);
    assert_eq!(before[0].local_ip, None);

    let cancel = CancellationToken::new();
    h.manager.toggle_tunnel("office", true, &cancel).await.expect("up");

    let during = h.manager.list_tunnels().expect("list");
    assert!(during[0].active);
    assert_eq!(during[0].local_ip, Some(Ipv4Addr::new(10, 8, 0, 2)));

    let client = h.manager.registry().get("office").expect("registered");
    assert_eq!(client.state(), TunnelState::Running);
    let status = client.status().await.expect("status");
    assert_eq!(status.name, "office");
    assert_eq!(status.peers[0].name, "gateway");

    h.manager.toggle_tunnel("office", false, &cancel).await.expect("down");
    assert!(!h.manager.list_tunnels().expect("list")[0].active);
    assert!(h.backend.live_devices().is_empty());
    assert!(h.backend.links().routes().is_empty());
}

#[tokio::test]
async fn toggle_into_current_state_fails() {
    let h = Harness::new();
    h.manager.write_config("office", &full_tunnel()).expect("write");
    let cancel = CancellationToken::new();

    let err = h.manager.toggle_tunnel("office", false, &cancel).await.expect_err("not running");
    assert!(err.is_not_running());

    h.manager.toggle_tunnel("office", true, &cancel).await.expect("up");
    let err = h.manager.toggle_tunnel("office", true, &cancel).await.expect_err("running");
    assert!(err.is_already_running());

    h.manager.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn resolver_file_restored_exactly_when_daemon_is_absent() {
    let h = Harness::new();
    let resolv = h.dir.path().join("resolv.conf");
    let original = "# managed by hand\nnameserver 192.168.1.1\nsearch lan\n";
    std::fs::write(&resolv, original).expect("seed resolv.conf");
    h.backend.resolver().set_available(false);

    h.manager.write_config("office", &full_tunnel()).expect("write");
    let cancel = CancellationToken::new();
    h.manager.toggle_tunnel("office", true, &cancel).await.expect("up");

    let rewritten = std::fs::read_to_string(&resolv).expect("read");
    assert!(rewritten.contains("nameserver 10.8.0.1"));
    assert!(rewritten.contains("# nameserver 192.168.1.1"));

    h.manager.toggle_tunnel("office", false, &cancel).await.expect("down");
    assert_eq!(std::fs::read_to_string(&resolv).expect("read"), original);
}

#[tokio::test]
async fn resolver_daemon_preferred_over_file() {
    let h = Harness::new();
    h.manager.write_config("office", &full_tunnel()).expect("write");
    let cancel = CancellationToken::new();
    h.manager.toggle_tunnel("office", true, &cancel).await.expect("up");

    let index = h.backend.links().index_of("office").expect("indexed");
    assert_eq!(h.backend.resolver().servers(index), ["10.8.0.1".parse::<std::net::IpAddr>().expect("ip")]);
    assert!(h.backend.resolver().is_default_route(index));
    assert!(!h.dir.path().join("resolv.conf").exists());

    h.manager.toggle_tunnel("office", false, &cancel).await.expect("down");
    assert!(h.backend.resolver().servers(index).is_empty());
}

#[tokio::test]
async fn delete_refuses_running_tunnel_and_backs_up() {
    let h = Harness::new();
    h.manager.write_config("office", &full_tunnel()).expect("write");
    let cancel = CancellationToken::new();
    h.manager.toggle_tunnel("office", true, &cancel).await.expect("up");

    let err = h.manager.delete_tunnel("office", true).expect_err("running");
    assert!(err.is_already_running());
    assert!(h.manager.config_exists("office"));

    h.manager.toggle_tunnel("office", false, &cancel).await.expect("down");
    let original = std::fs::read(h.manager.config_path("office")).expect("read");
    let backup = h.manager.delete_tunnel("office", true).expect("delete").expect("backup path");

    assert!(!h.manager.config_exists("office"));
    assert_eq!(backup, h.dir.path().join("backups").join("office.conf.bak"));
    assert_eq!(std::fs::read(&backup).expect("read backup"), original);
}

#[tokio::test]
async fn delete_without_backup() {
    let h = Harness::new();
    h.manager.write_config("home", &full_tunnel()).expect("write");
    assert_eq!(h.manager.delete_tunnel("home", false).expect("delete"), None);
    assert!(!h.dir.path().join("backups").exists());
    assert!(matches!(
        h.manager.delete_tunnel("home", false),
        Err(TunnelError::NotFound { .. })
    ));
}

#[test]
fn parse_write_round_trip_through_store() {
    let h = Harness::new();
    let config = full_tunnel();
    h.manager.write_config("office", &config).expect("write");
    let parsed = h.manager.parse_config(h.manager.config_path("office")).expect("parse");
    assert_eq!(parsed, config);
    assert!(h.manager.validate_config(&parsed).is_empty());
}

#[test]
fn validate_reports_every_problem() {
    let h = Harness::new();
    let mut config = Config::new(InterfaceConfig::default());
    config.peers.push(PeerConfig::new(PrivateKey::generate().public_key()));
    let errors = h.manager.validate_config(&config);
    assert!(errors.len() >= 3, "{errors:?}");
}

#[test]
fn key_helpers() {
    let h = Harness::new();
    let pair = h.manager.generate_key_pair();
    assert_eq!(h.manager.derive_public_key(&pair.private_key).expect("derive"), pair.public_key);
    assert_eq!(h.manager.generate_preshared_key().len(), 44);
    assert!(h.manager.derive_public_key("short").is_err());
}
