//! Tunnel session state mirror and command arbitration.
//!
//! [`TunnelSessionState`] holds the tunnel state exactly as the daemon last
//! reported it and fans changes out to subscribers. It also arbitrates
//! connect/disconnect commands that arrive while no daemon handle exists:
//! such an intent is parked and applied exactly once when a handle becomes
//! available. The container is owned by the lifecycle manager and outlives
//! individual daemon connections; the handle is lent to it per instance.

use crate::notifier::{StateNotifier, SubscriptionId};
use brume_ipc::client::DaemonConnection;
use brume_ipc::transport::RpcResult;
use brume_ipc::types::{ActionAfterDisconnect, TunnelState};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

/// User intent captured before a daemon handle exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Connect,
    Disconnect,
}

/// How a connect/disconnect request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The daemon call was issued and returned successfully
    Applied,

    /// No handle exists yet; the intent is parked until one does
    Deferred,
}

struct HandleSlot {
    daemon: Option<Arc<dyn DaemonConnection>>,
    pending: Option<PendingAction>,
}

pub struct TunnelSessionState {
    state: StateNotifier<TunnelState>,
    slot: Mutex<HandleSlot>,
}

impl TunnelSessionState {
    pub fn new() -> Self {
        TunnelSessionState {
            state: StateNotifier::new(TunnelState::Disconnected),
            slot: Mutex::new(HandleSlot {
                daemon: None,
                pending: None,
            }),
        }
    }

    /// The tunnel state as last reported by the daemon.
    pub fn current_state(&self) -> TunnelState {
        self.state.get()
    }

    /// Register a callback for every accepted state change. Callbacks run
    /// synchronously, in subscription order, under the state lock.
    pub fn subscribe(
        &self,
        callback: impl Fn(&TunnelState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.state.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.state.unsubscribe(id)
    }

    /// Called by the event dispatcher for every daemon-pushed state, in the
    /// order the daemon emitted them.
    pub fn handle_daemon_state(&self, state: TunnelState) {
        debug!("Tunnel state: {:?}", state);
        self.state.set_and_notify(state);
    }

    /// Apply a connect/disconnect intent, or park it if no handle exists.
    ///
    /// A parked intent overwrites any earlier one; only the latest is applied
    /// once a handle arrives.
    pub async fn request(&self, action: PendingAction) -> RpcResult<Dispatch> {
        let daemon = {
            let mut slot = self.slot.lock().await;
            match slot.daemon.clone() {
                Some(daemon) => daemon,
                None => {
                    debug!("No daemon handle, parking {:?} intent", action);
                    slot.pending = Some(action);
                    return Ok(Dispatch::Deferred);
                }
            }
        };

        self.apply(&daemon, action).await?;
        Ok(Dispatch::Applied)
    }

    async fn apply(
        &self,
        daemon: &Arc<dyn DaemonConnection>,
        action: PendingAction,
    ) -> RpcResult<()> {
        match action {
            PendingAction::Connect => daemon.connect_tunnel().await,
            PendingAction::Disconnect => {
                daemon.disconnect_tunnel().await?;
                // The daemon confirms with its own Disconnecting push event;
                // until then the mirror reflects the accepted command.
                self.state.update_and_notify(|current| match current {
                    TunnelState::Connecting { .. } | TunnelState::Connected { .. } => {
                        Some(TunnelState::Disconnecting {
                            after_disconnect: ActionAfterDisconnect::Nothing,
                        })
                    }
                    _ => None,
                });
                Ok(())
            }
        }
    }

    /// Attach the daemon handle lent by the lifecycle manager. Any parked
    /// intent is applied exactly once and cleared, whether or not the call
    /// succeeds; it is not retried.
    pub async fn attach_daemon(&self, daemon: Arc<dyn DaemonConnection>) {
        let pending = {
            let mut slot = self.slot.lock().await;
            slot.daemon = Some(Arc::clone(&daemon));
            slot.pending.take()
        };

        if let Some(action) = pending {
            debug!("Applying parked {:?} intent", action);
            if let Err(e) = self.apply(&daemon, action).await {
                warn!("Parked {:?} intent failed: {}", action, e);
            }
        }
    }

    /// Release the lent handle and reset the mirror to `Disconnected`.
    pub async fn detach_daemon(&self) {
        let mut slot = self.slot.lock().await;
        slot.daemon = None;
        drop(slot);

        self.state.set_and_notify(TunnelState::Disconnected);
    }

    /// Whether a daemon handle is currently attached.
    pub async fn has_daemon(&self) -> bool {
        self.slot.lock().await.daemon.is_some()
    }
}

impl Default for TunnelSessionState {
    fn default() -> Self {
        Self::new()
    }
}
