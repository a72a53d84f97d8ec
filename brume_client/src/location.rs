//! Apparent-location cache, gated against tunnel state transitions.
//!
//! [`LocationCache`] resolves the location a UI should display for the
//! current tunnel state. Measured ("real") locations only exist while the
//! daemon is `Disconnected` or `Connected`; everywhere else the location is
//! inferred from relay metadata or absent. Every asynchronous fetch records
//! the state that triggered it and its result is discarded unless that state
//! is still current when it arrives, so a late fetch can never overwrite the
//! policy of a newer state.

use crate::notifier::{StateNotifier, SubscriptionId};
use brume_ipc::client::DaemonConnection;
use brume_ipc::types::{ActionAfterDisconnect, GeoLocation, RelaySelection, TunnelState};
use log::debug;
use std::sync::{Arc, Mutex, Weak};
use tokio::time::Duration;

/// Pacing between failed fetch attempts while retrying is still warranted.
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// The last real (daemon-measured) location. Owned by the lifecycle manager
/// so it survives daemon restarts.
pub type SharedLocation = Arc<Mutex<Option<GeoLocation>>>;

struct CacheInner {
    // `None` until the first state arrives, so the initial report always
    // counts as a transition.
    state: Option<TunnelState>,
    selected_relay: Option<RelaySelection>,
    // Invalidates in-flight fetches when a newer one is spawned.
    fetch_generation: u64,
}

pub struct LocationCache {
    daemon: Arc<dyn DaemonConnection>,
    location: StateNotifier<Option<GeoLocation>>,
    last_known_real: SharedLocation,
    inner: Mutex<CacheInner>,
    // Handed to spawned fetch tasks; a dropped cache fetches nothing.
    weak_self: Weak<LocationCache>,
}

enum FetchOutcome {
    Apply(GeoLocation),
    Retry,
    Discard,
}

impl LocationCache {
    pub fn new(daemon: Arc<dyn DaemonConnection>, last_known_real: SharedLocation) -> Arc<Self> {
        Arc::new_cyclic(|weak| LocationCache {
            daemon,
            location: StateNotifier::new(None),
            last_known_real,
            inner: Mutex::new(CacheInner {
                state: None,
                selected_relay: None,
                fetch_generation: 0,
            }),
            weak_self: weak.clone(),
        })
    }

    /// The location to display right now, if any.
    pub fn current_location(&self) -> Option<GeoLocation> {
        self.location.get()
    }

    /// Register a callback for every published location change.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Option<GeoLocation>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.location.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.location.unsubscribe(id)
    }

    /// Track the relay selection from the daemon settings; it feeds the
    /// relay-inferred location used while reconnecting.
    pub fn set_selected_relay(&self, relay: Option<RelaySelection>) {
        self.inner.lock().unwrap().selected_relay = relay;
    }

    /// React to a tunnel state transition. Repeated identical states are
    /// ignored.
    pub fn handle_tunnel_state(&self, new_state: TunnelState) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.as_ref() == Some(&new_state) {
                return;
            }
            inner.state = Some(new_state.clone());
        }

        match new_state {
            TunnelState::Disconnected => {
                // Optimistically show the last real location, then refresh it.
                let last_known = self.last_known_real.lock().unwrap().clone();
                self.location.set_and_notify(last_known);
                self.spawn_fetch(TunnelState::Disconnected);
            }
            TunnelState::Connecting { location } => {
                self.location.set_and_notify(location);
            }
            TunnelState::Connected { location } => {
                // The relay-derived location is immediately presentable; a
                // measured one refines it.
                self.location.set_and_notify(Some(location.clone()));
                self.spawn_fetch(TunnelState::Connected { location });
            }
            TunnelState::Disconnecting { after_disconnect } => {
                let location = match after_disconnect {
                    ActionAfterDisconnect::Nothing => {
                        self.last_known_real.lock().unwrap().clone()
                    }
                    ActionAfterDisconnect::Block => None,
                    ActionAfterDisconnect::Reconnect => self.relay_inferred_location(),
                };
                self.location.set_and_notify(location);
            }
            TunnelState::Error { .. } => {
                self.location.set_and_notify(None);
            }
        }
    }

    fn relay_inferred_location(&self) -> Option<GeoLocation> {
        self.inner
            .lock()
            .unwrap()
            .selected_relay
            .as_ref()
            .map(RelaySelection::to_location)
    }

    fn spawn_fetch(&self, trigger_state: TunnelState) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            inner.fetch_generation += 1;
            inner.fetch_generation
        };

        let cache = match self.weak_self.upgrade() {
            Some(cache) => cache,
            None => return,
        };
        tokio::spawn(async move {
            cache.fetch_loop(trigger_state, generation).await;
        });
    }

    async fn fetch_loop(&self, trigger_state: TunnelState, generation: u64) {
        loop {
            let fetched = match self.daemon.get_location().await {
                Ok(location) => location,
                Err(e) => {
                    debug!("Location fetch failed: {}", e);
                    None
                }
            };

            let outcome = {
                let inner = self.inner.lock().unwrap();
                if inner.fetch_generation != generation
                    || inner.state.as_ref() != Some(&trigger_state)
                {
                    // The triggering context no longer applies.
                    FetchOutcome::Discard
                } else {
                    match fetched {
                        Some(location) => FetchOutcome::Apply(location),
                        None => {
                            if matches!(
                                inner.state,
                                Some(TunnelState::Disconnected)
                                    | Some(TunnelState::Connected { .. })
                            ) {
                                FetchOutcome::Retry
                            } else {
                                FetchOutcome::Discard
                            }
                        }
                    }
                }
            };

            match outcome {
                FetchOutcome::Apply(location) => {
                    if trigger_state == TunnelState::Disconnected {
                        // The only point where a real location may be captured.
                        *self.last_known_real.lock().unwrap() = Some(location.clone());
                    }
                    self.location.set_and_notify(Some(location));
                    return;
                }
                FetchOutcome::Retry => {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                FetchOutcome::Discard => return,
            }
        }
    }
}
