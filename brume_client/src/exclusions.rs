//! Split-tunneling app exclusion set.
//!
//! [`ExclusionSetCoordinator`] maintains the set of applications excluded
//! from the tunnel and the `enabled` flag gating it. Every mutation persists
//! the set, notifies subscribers with the new effective list, pushes the list
//! to the daemon, and replaces the tunnel device in place when the current
//! tunnel state requires the exclusions to take effect immediately.

use crate::notifier::{StateNotifier, SubscriptionId};
use crate::session::TunnelSessionState;
use brume_ipc::client::DaemonConnection;
use brume_ipc::types::{ActionAfterDisconnect, TunnelState};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;

const STORE_FILE: &str = "exclusions.json";

/// On-disk form of the exclusion set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredExclusions {
    pub enabled: bool,
    pub apps: Vec<String>,
}

/// Durable storage for the exclusion set, one JSON document in the client
/// data directory.
pub struct ExclusionStore {
    path: PathBuf,
}

impl ExclusionStore {
    pub fn new(data_dir: &Path) -> Self {
        ExclusionStore {
            path: data_dir.join(STORE_FILE),
        }
    }

    /// Load the persisted set. A missing file is an empty set; a corrupt one
    /// is logged and treated as empty.
    pub async fn load(&self) -> StoredExclusions {
        let contents = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    error!(
                        "Failed to read exclusion store {}: {}",
                        self.path.display(),
                        err
                    );
                }
                return StoredExclusions::default();
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(stored) => stored,
            Err(err) => {
                error!(
                    "Failed to parse exclusion store {}: {}",
                    self.path.display(),
                    err
                );
                StoredExclusions::default()
            }
        }
    }

    async fn save(&self, stored: &StoredExclusions) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent).await {
                error!("Failed to create {}: {}", parent.display(), err);
                return;
            }
        }

        match serde_json::to_vec_pretty(stored) {
            Ok(serialized) => {
                if let Err(err) = fs::write(&self.path, serialized).await {
                    error!(
                        "Failed to write exclusion store {}: {}",
                        self.path.display(),
                        err
                    );
                }
            }
            Err(err) => error!("Failed to serialize exclusion set: {}", err),
        }
    }
}

struct ExclusionsInner {
    apps: HashSet<String>,
    enabled: bool,
}

pub struct ExclusionSetCoordinator {
    store: ExclusionStore,
    daemon: Arc<dyn DaemonConnection>,
    session: Arc<TunnelSessionState>,
    inner: Mutex<ExclusionsInner>,
    effective: StateNotifier<Vec<String>>,
}

impl ExclusionSetCoordinator {
    /// Load the persisted set and build the coordinator against the lent
    /// daemon handle.
    pub async fn load(
        data_dir: &Path,
        daemon: Arc<dyn DaemonConnection>,
        session: Arc<TunnelSessionState>,
    ) -> Self {
        let store = ExclusionStore::new(data_dir);
        let stored = store.load().await;

        let inner = ExclusionsInner {
            apps: stored.apps.into_iter().collect(),
            enabled: stored.enabled,
        };
        let effective = effective_list(&inner);

        ExclusionSetCoordinator {
            store,
            daemon,
            session,
            inner: Mutex::new(inner),
            effective: StateNotifier::new(effective),
        }
    }

    pub fn is_excluded(&self, id: &str) -> bool {
        self.inner.lock().unwrap().apps.contains(id)
    }

    pub fn enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// The list handed to the daemon: the excluded apps while enabled, empty
    /// otherwise.
    pub fn effective_list(&self) -> Vec<String> {
        self.effective.get()
    }

    /// Register a callback for every effective-list change.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Vec<String>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.effective.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.effective.unsubscribe(id)
    }

    /// Add an application to the exclusion set.
    pub async fn exclude(&self, id: &str) {
        self.mutate(|inner| {
            inner.apps.insert(id.to_string());
        })
        .await;
    }

    /// Remove an application from the exclusion set.
    pub async fn include(&self, id: &str) {
        self.mutate(|inner| {
            inner.apps.remove(id);
        })
        .await;
    }

    /// Enable or disable split tunneling as a whole. The set contents are
    /// kept either way; only the effective list changes.
    pub async fn set_enabled(&self, enabled: bool) {
        self.mutate(|inner| {
            inner.enabled = enabled;
        })
        .await;
    }

    /// Push the current effective list to a freshly wired daemon, without the
    /// reconnect evaluation; the new daemon has no tunnel to disturb yet.
    pub async fn push_to_daemon(&self) {
        let effective = self.effective_list();
        if let Err(e) = self.daemon.set_excluded_apps(effective).await {
            warn!("Failed to push exclusions to the daemon: {}", e);
        }
    }

    async fn mutate(&self, change: impl FnOnce(&mut ExclusionsInner)) {
        let (stored, effective) = {
            let mut inner = self.inner.lock().unwrap();
            change(&mut inner);

            let mut apps: Vec<String> = inner.apps.iter().cloned().collect();
            apps.sort();
            (
                StoredExclusions {
                    enabled: inner.enabled,
                    apps,
                },
                effective_list(&inner),
            )
        };

        self.store.save(&stored).await;
        self.effective.set_and_notify(effective.clone());
        self.sync_daemon(effective).await;
    }

    /// Hand the daemon the new list and, when the active session requires it,
    /// swap the tunnel device in place. Failures here are internal to the
    /// coordinator: the outcome is observable through the tunnel state, not
    /// as an error.
    async fn sync_daemon(&self, effective: Vec<String>) {
        if let Err(e) = self.daemon.set_excluded_apps(effective).await {
            warn!("Failed to push exclusions to the daemon: {}", e);
            return;
        }

        if reconnect_required(&self.session.current_state()) {
            if let Err(e) = self.daemon.replace_tunnel_device().await {
                warn!("Failed to replace the tunnel device: {}", e);
            }
        }
    }
}

fn effective_list(inner: &ExclusionsInner) -> Vec<String> {
    if inner.enabled {
        let mut apps: Vec<String> = inner.apps.iter().cloned().collect();
        apps.sort();
        apps
    } else {
        Vec::new()
    }
}

/// Whether a change to the exclusion set must be applied to a live tunnel by
/// replacing its device.
fn reconnect_required(state: &TunnelState) -> bool {
    match state {
        TunnelState::Connecting { .. } | TunnelState::Connected { .. } => true,
        TunnelState::Disconnecting { after_disconnect } => {
            *after_disconnect != ActionAfterDisconnect::Nothing
        }
        TunnelState::Disconnected | TunnelState::Error { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_required_follows_tunnel_state() {
        use brume_ipc::types::{ErrorCause, GeoLocation};

        let location = GeoLocation {
            latitude: None,
            longitude: None,
            country: "Sweden".to_string(),
            city: None,
            hostname: None,
        };

        assert!(reconnect_required(&TunnelState::Connecting {
            location: None
        }));
        assert!(reconnect_required(&TunnelState::Connected { location }));
        assert!(reconnect_required(&TunnelState::Disconnecting {
            after_disconnect: ActionAfterDisconnect::Reconnect,
        }));
        assert!(reconnect_required(&TunnelState::Disconnecting {
            after_disconnect: ActionAfterDisconnect::Block,
        }));

        assert!(!reconnect_required(&TunnelState::Disconnecting {
            after_disconnect: ActionAfterDisconnect::Nothing,
        }));
        assert!(!reconnect_required(&TunnelState::Disconnected));
        assert!(!reconnect_required(&TunnelState::Error {
            cause: ErrorCause {
                is_blocking: true,
                reason: "firewall".to_string(),
            },
        }));
    }
}
