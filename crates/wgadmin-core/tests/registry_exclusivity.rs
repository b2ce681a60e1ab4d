//! Concurrent starts and stops through one registry.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wgadmin_core::{
    ClientOptions, Config, ConfigStore, FakeBackend, InterfaceConfig, InterfaceProbe, LogLevel, PeerConfig,
    PrivateKey, TunnelRegistry,
};

fn config(octet: u8) -> Config {
    Config::new(InterfaceConfig::new(PrivateKey::generate()).with_address(
        format!("10.{octet}.0.2/24").parse().expect("cidr"),
    ))
    .with_peer(
        PeerConfig::new(PrivateKey::generate().public_key())
            .with_allowed_ip(format!("10.{octet}.0.0/24").parse().expect("cidr")),
    )
}

fn setup(dir: &tempfile::TempDir, names: &[&str]) -> (Arc<FakeBackend>, Arc<TunnelRegistry<FakeBackend>>) {
    let backend = Arc::new(FakeBackend::new());
    let store = ConfigStore::new(dir.path().join("tunnels"));
    for (i, name) in names.iter().enumerate() {
        let octet = u8::try_from(i + 1).expect("few tunnels");
        store.save(name, &config(octet)).expect("save");
    }
    let options = ClientOptions::default()
        .with_socket_dir(dir.path().join("run"))
        .with_log_level(LogLevel::Silent);
    let probe: Arc<dyn InterfaceProbe> = Arc::clone(&backend) as Arc<dyn InterfaceProbe>;
    let registry = Arc::new(TunnelRegistry::new(Arc::clone(&backend), store, options, probe));
    (backend, registry)
}

#[tokio::test]
async fn concurrent_starts_of_one_name_have_one_winner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (backend, registry) = setup(&dir, &["wg0"]);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(registry.start("wg0", &cancel), registry.start("wg0", &cancel));

    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(loser.expect_err("one loses").is_already_running());

    assert_eq!(registry.running(), ["wg0"]);
    assert_eq!(backend.live_devices(), ["wg0"]);
    registry.stop_all().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_tasks_never_register_twice() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (backend, registry) = setup(&dir, &["wg0"]);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.start("wg0", &CancellationToken::new()).await.is_ok()
        }));
    }
    let mut wins = 0;
    for task in tasks {
        if task.await.expect("task") {
            wins += 1;
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(backend.live_devices().len(), 1);
    registry.stop("wg0").await.expect("stop");
    assert!(backend.live_devices().is_empty());
}

#[tokio::test]
async fn different_names_run_side_by_side() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (backend, registry) = setup(&dir, &["home", "office"]);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(registry.start("home", &cancel), registry.start("office", &cancel));
    a.expect("home");
    b.expect("office");
    assert_eq!(registry.running(), ["home", "office"]);
    assert_eq!(backend.links().routes().len(), 2);

    registry.stop_all().await.expect("stop all");
    assert!(registry.running().is_empty());
    assert!(backend.links().routes().is_empty());
}

#[tokio::test]
async fn restart_after_stop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_backend, registry) = setup(&dir, &["wg0"]);
    let cancel = CancellationToken::new();

    let first = registry.start("wg0", &cancel).await.expect("first");
    registry.stop("wg0").await.expect("stop");
    let second = registry.start("wg0", &cancel).await.expect("second");

    assert!(!first.is_running());
    assert!(second.is_running());
    assert!(!Arc::ptr_eq(&first, &second));
    registry.stop_all().await.expect("stop all");
}
