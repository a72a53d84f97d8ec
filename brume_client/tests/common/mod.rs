//! In-process fake daemon and launcher shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use brume_client::error::{Error, Result};
use brume_client::lifecycle::{DaemonLauncher, LaunchedDaemon};
use brume_ipc::client::DaemonConnection;
use brume_ipc::messages::DaemonEvent;
use brume_ipc::transport::{RpcError, RpcResult};
use brume_ipc::types::{
    DaemonKeyEvent, GeoLocation, PublicKey, Settings, TunnelState,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::Duration;

/// Scripted behavior of the fake daemon.
pub struct FakeDaemonState {
    /// `None` makes `get_settings` fail, emulating an unusable daemon.
    pub settings: Option<Settings>,
    pub key: Option<PublicKey>,
    pub tunnel_state: TunnelState,
    pub generate_results: VecDeque<DaemonKeyEvent>,
    pub verify_results: VecDeque<bool>,
    pub locations: VecDeque<Option<GeoLocation>>,
}

impl Default for FakeDaemonState {
    fn default() -> Self {
        FakeDaemonState {
            settings: Some(default_settings()),
            key: None,
            tunnel_state: TunnelState::Disconnected,
            generate_results: VecDeque::new(),
            verify_results: VecDeque::new(),
            locations: VecDeque::new(),
        }
    }
}

/// Call counters, for exactly-once assertions.
#[derive(Default)]
pub struct Calls {
    pub connect_tunnel: AtomicUsize,
    pub disconnect_tunnel: AtomicUsize,
    pub replace_device: AtomicUsize,
    pub set_excluded_apps: AtomicUsize,
    pub get_location: AtomicUsize,
    pub shutdown: AtomicUsize,
    pub last_excluded_apps: Mutex<Vec<String>>,
}

pub struct FakeDaemon {
    pub state: Mutex<FakeDaemonState>,
    pub calls: Calls,
    event_tx: broadcast::Sender<DaemonEvent>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,

    /// When present, `get_key` waits for a permit before answering, letting a
    /// test hold the key bootstrap open.
    pub key_gate: Option<Arc<Semaphore>>,

    /// When present, `verify_key` waits for a permit before answering.
    pub verify_gate: Option<Arc<Semaphore>>,

    /// When present, `get_location` waits for a permit before answering.
    pub location_gate: Option<Arc<Semaphore>>,
}

impl FakeDaemon {
    pub fn new(state: FakeDaemonState) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        let (closed_tx, closed_rx) = watch::channel(false);

        Arc::new(FakeDaemon {
            state: Mutex::new(state),
            calls: Calls::default(),
            event_tx,
            closed_tx,
            closed_rx,
            key_gate: None,
            verify_gate: None,
            location_gate: None,
        })
    }

    pub fn with_gates(
        state: FakeDaemonState,
        key_gate: Option<Arc<Semaphore>>,
        verify_gate: Option<Arc<Semaphore>>,
        location_gate: Option<Arc<Semaphore>>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        let (closed_tx, closed_rx) = watch::channel(false);

        Arc::new(FakeDaemon {
            state: Mutex::new(state),
            calls: Calls::default(),
            event_tx,
            closed_tx,
            closed_rx,
            key_gate,
            verify_gate,
            location_gate,
        })
    }

    /// Emit a push event to whoever is dispatching.
    pub fn push_event(&self, event: DaemonEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Emulate unsolicited daemon termination.
    pub fn kill(&self) {
        let _ = self.closed_tx.send(true);
    }

    async fn pass_gate(gate: &Option<Arc<Semaphore>>) {
        if let Some(gate) = gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
    }
}

#[async_trait]
impl DaemonConnection for FakeDaemon {
    async fn get_settings(&self) -> RpcResult<Settings> {
        self.state
            .lock()
            .unwrap()
            .settings
            .clone()
            .ok_or_else(|| RpcError::Connection("settings unavailable".to_string()))
    }

    async fn set_allow_lan(&self, _allow: bool) -> RpcResult<()> {
        Ok(())
    }

    async fn get_key(&self) -> RpcResult<Option<PublicKey>> {
        Self::pass_gate(&self.key_gate).await;
        Ok(self.state.lock().unwrap().key.clone())
    }

    async fn generate_key(&self) -> RpcResult<DaemonKeyEvent> {
        let result = self.state.lock().unwrap().generate_results.pop_front();
        Ok(result.unwrap_or(DaemonKeyEvent::GenerationFailure))
    }

    async fn verify_key(&self) -> RpcResult<bool> {
        Self::pass_gate(&self.verify_gate).await;
        let result = self.state.lock().unwrap().verify_results.pop_front();
        Ok(result.unwrap_or(true))
    }

    async fn get_location(&self) -> RpcResult<Option<GeoLocation>> {
        self.calls.get_location.fetch_add(1, Ordering::SeqCst);
        Self::pass_gate(&self.location_gate).await;
        let result = self.state.lock().unwrap().locations.pop_front();
        Ok(result.unwrap_or(None))
    }

    async fn get_state(&self) -> RpcResult<TunnelState> {
        Ok(self.state.lock().unwrap().tunnel_state.clone())
    }

    async fn set_excluded_apps(&self, apps: Vec<String>) -> RpcResult<()> {
        self.calls.set_excluded_apps.fetch_add(1, Ordering::SeqCst);
        *self.calls.last_excluded_apps.lock().unwrap() = apps;
        Ok(())
    }

    async fn replace_tunnel_device(&self) -> RpcResult<()> {
        self.calls.replace_device.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect_tunnel(&self) -> RpcResult<()> {
        self.calls.connect_tunnel.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect_tunnel(&self) -> RpcResult<()> {
        self.calls.disconnect_tunnel.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> RpcResult<()> {
        self.calls.shutdown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher handing out pre-built fake daemons in order.
pub struct FakeLauncher {
    daemons: Mutex<VecDeque<Arc<FakeDaemon>>>,
    pub launches: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(daemons: Vec<Arc<FakeDaemon>>) -> Arc<Self> {
        Arc::new(FakeLauncher {
            daemons: Mutex::new(daemons.into_iter().collect()),
            launches: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DaemonLauncher for FakeLauncher {
    async fn launch(&self) -> Result<LaunchedDaemon> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let daemon = self
            .daemons
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Launch("no more fake daemons".to_string()))?;

        let events = daemon.subscribe_events();
        let closed = daemon.closed();

        Ok(LaunchedDaemon {
            connection: daemon as Arc<dyn DaemonConnection>,
            events,
            closed,
        })
    }

    async fn stop(&self, _connection: &Arc<dyn DaemonConnection>) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn default_settings() -> Settings {
    Settings {
        allow_lan: false,
        selected_relay: None,
    }
}

pub fn measured_location(country: &str) -> GeoLocation {
    GeoLocation {
        latitude: Some(57.7),
        longitude: Some(11.97),
        country: country.to_string(),
        city: Some("Gothenburg".to_string()),
        hostname: None,
    }
}

pub fn relay_location(hostname: &str) -> GeoLocation {
    GeoLocation {
        latitude: None,
        longitude: None,
        country: "Sweden".to_string(),
        city: Some("Gothenburg".to_string()),
        hostname: Some(hostname.to_string()),
    }
}

/// Let spawned reactions run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
