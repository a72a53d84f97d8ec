//! Exclusion set persistence and reconnect arbitration.

mod common;

use brume_client::exclusions::ExclusionSetCoordinator;
use brume_client::session::TunnelSessionState;
use brume_ipc::client::DaemonConnection;
use brume_ipc::types::TunnelState;
use common::{relay_location, FakeDaemon, FakeDaemonState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::tempdir;

async fn coordinator_with(
    data_dir: &std::path::Path,
    daemon: &Arc<FakeDaemon>,
    session: &Arc<TunnelSessionState>,
) -> ExclusionSetCoordinator {
    ExclusionSetCoordinator::load(
        data_dir,
        Arc::clone(daemon) as Arc<dyn DaemonConnection>,
        Arc::clone(session),
    )
    .await
}

#[tokio::test]
async fn enabling_while_connected_replaces_the_tunnel_device_exactly_once() {
    let dir = tempdir().unwrap();
    let daemon = FakeDaemon::new(FakeDaemonState::default());
    let session = Arc::new(TunnelSessionState::new());

    let exclusions = coordinator_with(dir.path(), &daemon, &session).await;
    exclusions.exclude("org.example.game").await;

    session.handle_daemon_state(TunnelState::Connected {
        location: relay_location("se-got-001"),
    });

    exclusions.set_enabled(true).await;
    assert_eq!(daemon.calls.replace_device.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn enabling_while_disconnected_does_not_touch_the_tunnel() {
    let dir = tempdir().unwrap();
    let daemon = FakeDaemon::new(FakeDaemonState::default());
    let session = Arc::new(TunnelSessionState::new());

    let exclusions = coordinator_with(dir.path(), &daemon, &session).await;
    exclusions.exclude("org.example.game").await;
    exclusions.set_enabled(true).await;

    assert_eq!(daemon.calls.replace_device.load(Ordering::SeqCst), 0);
    // The daemon still learned the new effective list.
    assert!(daemon.calls.set_excluded_apps.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn the_effective_list_is_empty_while_disabled() {
    let dir = tempdir().unwrap();
    let daemon = FakeDaemon::new(FakeDaemonState::default());
    let session = Arc::new(TunnelSessionState::new());

    let exclusions = coordinator_with(dir.path(), &daemon, &session).await;
    exclusions.exclude("org.example.one").await;
    exclusions.exclude("org.example.two").await;

    assert!(exclusions.effective_list().is_empty());
    assert!(exclusions.is_excluded("org.example.one"));

    exclusions.set_enabled(true).await;
    assert_eq!(
        exclusions.effective_list(),
        vec![
            "org.example.one".to_string(),
            "org.example.two".to_string()
        ]
    );
    assert_eq!(
        *daemon.calls.last_excluded_apps.lock().unwrap(),
        exclusions.effective_list()
    );

    exclusions.set_enabled(false).await;
    assert!(exclusions.effective_list().is_empty());
    assert!(daemon.calls.last_excluded_apps.lock().unwrap().is_empty());
}

#[tokio::test]
async fn the_persisted_set_survives_a_coordinator_restart() {
    let dir = tempdir().unwrap();
    let daemon = FakeDaemon::new(FakeDaemonState::default());
    let session = Arc::new(TunnelSessionState::new());

    let before = {
        let exclusions = coordinator_with(dir.path(), &daemon, &session).await;
        exclusions.exclude("org.example.one").await;
        exclusions.exclude("org.example.two").await;
        exclusions.include("org.example.one").await;
        exclusions.set_enabled(true).await;
        exclusions.effective_list()
    };

    let reloaded = coordinator_with(dir.path(), &daemon, &session).await;
    assert_eq!(reloaded.effective_list(), before);
    assert!(reloaded.enabled());
    assert!(reloaded.is_excluded("org.example.two"));
    assert!(!reloaded.is_excluded("org.example.one"));
}
