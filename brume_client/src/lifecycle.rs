//! Daemon lifecycle management and coordinator wiring.
//!
//! [`ServiceLifecycleManager`] owns the daemon process: it prepares the data
//! directory, launches the daemon, wires a fresh set of coordinators to the
//! new connection, and tears everything down again on stop or on unsolicited
//! daemon termination (which triggers an immediate restart). State that must
//! survive restarts (the session container, the last known real location,
//! the persisted exclusion set) is owned here, not by the per-connection
//! [`ServiceInstance`].

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::exclusions::ExclusionSetCoordinator;
use crate::key_rotation::{KeyRotationCoordinator, KeygenEvent};
use crate::location::{LocationCache, SharedLocation};
use crate::migration::FileMigrator;
use crate::notifier::{StateNotifier, SubscriptionId};
use crate::resources::ResourceExtractor;
use crate::session::{Dispatch, PendingAction, TunnelSessionState};
use brume_ipc::client::{DaemonConnection, DaemonRpcClient};
use brume_ipc::messages::DaemonEvent;
use brume_ipc::transport::RpcResult;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::process::{Child, Command};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

const RELAYS_FILE: &str = "relays.json";
const LEGACY_FILES: [&str; 2] = ["exclusions.json", RELAYS_FILE];

/// Pacing between failed startup attempts.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// How long a freshly spawned daemon gets to bind its socket.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Grace period for the daemon to exit after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle phase of the managed daemon service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Everything a launched daemon exposes to the coordination layer.
pub struct LaunchedDaemon {
    pub connection: Arc<dyn DaemonConnection>,
    pub events: broadcast::Receiver<DaemonEvent>,

    /// Flips to `true` once the connection is lost
    pub closed: watch::Receiver<bool>,
}

/// Starts and stops daemon processes. The production implementation spawns
/// the daemon binary and connects to its socket; tests substitute an
/// in-process fake.
#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    async fn launch(&self) -> Result<LaunchedDaemon>;

    /// Best-effort daemon stop once the client is done with it.
    async fn stop(&self, connection: &Arc<dyn DaemonConnection>);
}

/// Launches the daemon executable configured in [`ClientConfig`].
pub struct ProcessDaemonLauncher {
    config: ClientConfig,
    child: Mutex<Option<Child>>,
}

impl ProcessDaemonLauncher {
    pub fn new(config: ClientConfig) -> Self {
        ProcessDaemonLauncher {
            config,
            child: Mutex::new(None),
        }
    }

    async fn connect_with_retry(socket: &Path) -> Result<DaemonRpcClient> {
        let mut last_error = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match DaemonRpcClient::connect(socket).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    last_error = Some(e);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }

        Err(Error::Launch(format!(
            "Could not reach the daemon socket {}: {}",
            socket.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[async_trait]
impl DaemonLauncher for ProcessDaemonLauncher {
    async fn launch(&self) -> Result<LaunchedDaemon> {
        let child = Command::new(&self.config.daemon_binary)
            .arg("--socket")
            .arg(&self.config.daemon_socket)
            .spawn()
            .map_err(|e| {
                Error::Launch(format!(
                    "Failed to spawn {}: {}",
                    self.config.daemon_binary.display(),
                    e
                ))
            })?;
        *self.child.lock().await = Some(child);

        let client = Self::connect_with_retry(&self.config.daemon_socket).await?;
        let events = client.subscribe_events();
        let closed = client.closed();

        Ok(LaunchedDaemon {
            connection: Arc::new(client),
            events,
            closed,
        })
    }

    async fn stop(&self, connection: &Arc<dyn DaemonConnection>) {
        if let Err(e) = connection.shutdown().await {
            warn!("Daemon shutdown request failed: {}", e);
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("Daemon exited with {}", status),
                Ok(Err(e)) => warn!("Failed to reap the daemon: {}", e),
                Err(_) => {
                    warn!("Daemon did not exit in time, killing it");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

/// Live handles bound to one daemon connection. Destroyed, with every owned
/// task aborted, before any restart attempt.
pub struct ServiceInstance {
    pub connection: Arc<dyn DaemonConnection>,
    pub keys: Arc<KeyRotationCoordinator>,
    pub location: Arc<LocationCache>,
    pub exclusions: Arc<ExclusionSetCoordinator>,
    dispatch_task: JoinHandle<()>,
    location_subscription: SubscriptionId,
}

impl ServiceInstance {
    fn tear_down(&self, session: &TunnelSessionState) {
        self.dispatch_task.abort();
        self.keys.shutdown();
        session.unsubscribe(self.location_subscription);
    }
}

struct ManagerInner {
    instance: Option<Arc<ServiceInstance>>,
    start_task: Option<JoinHandle<()>>,
    intent_to_stop: bool,

    /// A stop was requested while client connections were still bound
    should_stop: bool,
    bound_clients: usize,
}

pub struct ServiceLifecycleManager {
    config: ClientConfig,
    launcher: Arc<dyn DaemonLauncher>,
    session: Arc<TunnelSessionState>,
    last_known_real_location: SharedLocation,
    phase: StateNotifier<ServicePhase>,
    inner: Mutex<ManagerInner>,
    // Handed to the startup and dispatch tasks the manager spawns.
    weak_self: Weak<ServiceLifecycleManager>,
}

impl ServiceLifecycleManager {
    pub fn new(config: ClientConfig, launcher: Arc<dyn DaemonLauncher>) -> Arc<Self> {
        Arc::new_cyclic(|weak| ServiceLifecycleManager {
            config,
            launcher,
            session: Arc::new(TunnelSessionState::new()),
            last_known_real_location: SharedLocation::default(),
            phase: StateNotifier::new(ServicePhase::NotStarted),
            inner: Mutex::new(ManagerInner {
                instance: None,
                start_task: None,
                intent_to_stop: false,
                should_stop: false,
                bound_clients: 0,
            }),
            weak_self: weak.clone(),
        })
    }

    fn strong_self(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    /// The session container; long-lived, shared across daemon restarts.
    pub fn session(&self) -> &Arc<TunnelSessionState> {
        &self.session
    }

    pub fn current_phase(&self) -> ServicePhase {
        self.phase.get()
    }

    pub fn subscribe_phase(
        &self,
        callback: impl Fn(&ServicePhase) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.phase.subscribe(callback)
    }

    pub fn unsubscribe_phase(&self, id: SubscriptionId) {
        self.phase.unsubscribe(id)
    }

    /// Begin the startup sequence. Any earlier startup task is cancelled
    /// first; a previously requested stop is rescinded.
    pub async fn start(&self) {
        let manager = match self.strong_self() {
            Some(manager) => manager,
            None => return,
        };

        {
            let mut inner = self.inner.lock().await;
            inner.intent_to_stop = false;
            inner.should_stop = false;
            if let Some(task) = inner.start_task.take() {
                task.abort();
            }
            inner.start_task = Some(spawn_startup(manager));
        }
        self.phase.set_and_notify(ServicePhase::Starting);
    }

    async fn run_startup(self: Arc<Self>) {
        loop {
            if self.inner.lock().await.intent_to_stop {
                return;
            }

            match self.try_start_instance().await {
                Ok(_) => return,
                Err(e) => {
                    warn!("Daemon startup failed: {}", e);
                    tokio::time::sleep(RESTART_DELAY).await;
                }
            }
        }
    }

    /// One startup attempt. Returns `Ok(false)` when a concurrent stop
    /// request made the new instance unwanted.
    async fn try_start_instance(&self) -> Result<bool> {
        info!("Starting the daemon");
        self.prepare_files().await;

        let launched = self.launcher.launch().await?;
        let connection = Arc::clone(&launched.connection);

        // A daemon that cannot produce its settings is unusable; tear it
        // down and let the caller retry the whole sequence.
        let settings = match connection.get_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                self.launcher.stop(&connection).await;
                return Err(Error::Rpc(e));
            }
        };

        let keys = KeyRotationCoordinator::new(Arc::clone(&connection));
        let location = LocationCache::new(
            Arc::clone(&connection),
            Arc::clone(&self.last_known_real_location),
        );
        location.set_selected_relay(settings.selected_relay.clone());

        let exclusions = Arc::new(
            ExclusionSetCoordinator::load(
                &self.config.data_dir,
                Arc::clone(&connection),
                Arc::clone(&self.session),
            )
            .await,
        );
        exclusions.push_to_daemon().await;

        let location_subscription = {
            let location = Arc::clone(&location);
            self.session
                .subscribe(move |state| location.handle_tunnel_state(state.clone()))
        };

        // Seed the mirror before events start flowing.
        match connection.get_state().await {
            Ok(state) => self.session.handle_daemon_state(state),
            Err(e) => warn!("Failed to fetch the initial tunnel state: {}", e),
        }

        let manager = self.strong_self().ok_or(Error::NotRunning)?;
        let dispatch_task = tokio::spawn(dispatch_events(
            manager,
            launched.events,
            launched.closed,
            Arc::clone(&keys),
            Arc::clone(&location),
        ));

        let instance = Arc::new(ServiceInstance {
            connection: Arc::clone(&connection),
            keys,
            location,
            exclusions,
            dispatch_task,
            location_subscription,
        });

        let published = {
            let mut inner = self.inner.lock().await;
            if inner.intent_to_stop {
                false
            } else {
                inner.instance = Some(Arc::clone(&instance));
                true
            }
        };

        if !published {
            debug!("Stop requested during startup, discarding the new instance");
            instance.tear_down(&self.session);
            self.launcher.stop(&connection).await;
            return Ok(false);
        }

        self.phase.set_and_notify(ServicePhase::Running);
        info!("Daemon is running");

        // Attach last: this applies any parked connect/disconnect intent.
        self.session.attach_daemon(connection).await;

        Ok(true)
    }

    async fn prepare_files(&self) {
        if let Some(legacy_dir) = &self.config.legacy_data_dir {
            let migrator =
                FileMigrator::new(legacy_dir.clone(), self.config.data_dir.clone());
            for file in LEGACY_FILES {
                migrator.migrate(file).await;
            }
        }

        if let Some(resource_dir) = &self.config.resource_dir {
            let extractor =
                ResourceExtractor::new(resource_dir.clone(), self.config.data_dir.clone());
            if let Err(e) = extractor.extract(RELAYS_FILE).await {
                warn!("Failed to extract {}: {}", RELAYS_FILE, e);
            }
        }
    }

    /// Request a stop. While client connections are bound the teardown is
    /// deferred until the last one disconnects; new connections arriving in
    /// the meantime extend the deferral.
    pub async fn stop(&self) {
        let defer = {
            let mut inner = self.inner.lock().await;
            inner.intent_to_stop = true;
            if let Some(task) = inner.start_task.take() {
                task.abort();
            }
            if inner.bound_clients > 0 {
                inner.should_stop = true;
                true
            } else {
                false
            }
        };

        if defer {
            info!("Stop deferred until all client connections close");
            return;
        }

        self.finish_stop().await;
    }

    async fn finish_stop(&self) {
        info!("Stopping the daemon");
        self.phase.set_and_notify(ServicePhase::Stopping);

        let connection = {
            let inner = self.inner.lock().await;
            inner.instance.as_ref().map(|i| Arc::clone(&i.connection))
        };
        if let Some(connection) = &connection {
            self.launcher.stop(connection).await;
        }

        self.tear_down_instance().await;
        self.phase.set_and_notify(ServicePhase::Stopped);
    }

    async fn tear_down_instance(&self) {
        let instance = self.inner.lock().await.instance.take();
        if let Some(instance) = &instance {
            instance.tear_down(&self.session);
        }
        self.session.detach_daemon().await;
    }

    /// A UI surface connected.
    pub async fn client_connected(&self) {
        self.inner.lock().await.bound_clients += 1;
    }

    /// A UI surface disconnected; completes a deferred stop when it was the
    /// last one.
    pub async fn client_disconnected(&self) {
        let finish = {
            let mut inner = self.inner.lock().await;
            inner.bound_clients = inner.bound_clients.saturating_sub(1);
            if inner.bound_clients == 0 && inner.should_stop {
                inner.should_stop = false;
                true
            } else {
                false
            }
        };

        if finish {
            self.finish_stop().await;
        }
    }

    /// Unsolicited termination: tear the dead instance down and restart,
    /// unless a stop is in progress.
    async fn handle_daemon_termination(&self) {
        {
            let inner = self.inner.lock().await;
            if inner.intent_to_stop || inner.instance.is_none() {
                return;
            }
        }

        warn!("Daemon connection lost unexpectedly, restarting");
        self.tear_down_instance().await;

        let manager = match self.strong_self() {
            Some(manager) => manager,
            None => return,
        };

        let mut inner = self.inner.lock().await;
        if inner.intent_to_stop {
            return;
        }
        if let Some(task) = inner.start_task.take() {
            task.abort();
        }
        inner.start_task = Some(spawn_startup(manager));
        drop(inner);

        self.phase.set_and_notify(ServicePhase::Starting);
    }

    async fn instance(&self) -> Result<Arc<ServiceInstance>> {
        self.inner
            .lock()
            .await
            .instance
            .clone()
            .ok_or(Error::NotRunning)
    }

    // Command surface exposed to UI layers.

    /// Connect the tunnel, or park the intent until a daemon handle exists.
    pub async fn request_connect(&self) -> RpcResult<Dispatch> {
        self.session.request(PendingAction::Connect).await
    }

    /// Disconnect the tunnel, or park the intent until a daemon handle
    /// exists.
    pub async fn request_disconnect(&self) -> RpcResult<Dispatch> {
        self.session.request(PendingAction::Disconnect).await
    }

    pub async fn generate_key(&self) -> Result<KeygenEvent> {
        self.instance().await?.keys.generate().await
    }

    pub async fn verify_key(&self) -> Result<Option<KeygenEvent>> {
        self.instance().await?.keys.verify().await
    }

    pub async fn exclude_app(&self, id: &str) -> Result<()> {
        self.instance().await?.exclusions.exclude(id).await;
        Ok(())
    }

    pub async fn include_app(&self, id: &str) -> Result<()> {
        self.instance().await?.exclusions.include(id).await;
        Ok(())
    }

    pub async fn set_exclusion_enabled(&self, enabled: bool) -> Result<()> {
        self.instance().await?.exclusions.set_enabled(enabled).await;
        Ok(())
    }

    /// The coordinators of the current instance, for subscription wiring.
    pub async fn current_instance(&self) -> Result<Arc<ServiceInstance>> {
        self.instance().await
    }
}

/// Spawn the startup loop from outside the manager's `impl` block.
///
/// `run_startup` awaits `try_start_instance`, whose `async fn` return is an
/// opaque type; rustc will not leak its `Send`-ness to a `tokio::spawn` call
/// that sits in the same defining scope (the `impl`). Constructing the spawn
/// future here, outside that scope, lets the auto-trait analysis see through
/// the opaque type and confirm the future is `Send`.
fn spawn_startup(manager: Arc<ServiceLifecycleManager>) -> JoinHandle<()> {
    tokio::spawn(async move { manager.run_startup().await })
}

async fn dispatch_events(
    manager: Arc<ServiceLifecycleManager>,
    mut events: broadcast::Receiver<DaemonEvent>,
    mut closed: watch::Receiver<bool>,
    keys: Arc<KeyRotationCoordinator>,
    location: Arc<LocationCache>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DaemonEvent::TunnelStateChanged(state)) => {
                    manager.session.handle_daemon_state(state);
                }
                Ok(DaemonEvent::KeyEvent(event)) => keys.handle_key_event(event),
                Ok(DaemonEvent::SettingsChanged(settings)) => {
                    location.set_selected_relay(settings.selected_relay);
                }
                Err(RecvError::Lagged(dropped)) => {
                    warn!("Dropped {} daemon events", dropped);
                }
                Err(RecvError::Closed) => break,
            },
            result = closed.wait_for(|closed| *closed) => {
                let _ = result;
                break;
            }
        }
    }

    // The dispatcher ending means the daemon connection is gone; whether that
    // warrants a restart is the manager's call.
    tokio::spawn(async move { manager.handle_daemon_termination().await });
}
