//! WireGuard key lifecycle coordination.
//!
//! [`KeyRotationCoordinator`] owns the client-side view of the single
//! asymmetric key registered for this account. It bootstraps itself from the
//! daemon's current key, serializes generation and verification behind that
//! bootstrap, and folds daemon key events into its status. A failed rotation
//! never discards a working key, and a verification result that arrives after
//! the key it was issued for has been replaced is dropped.

use crate::error::{Error, Result};
use crate::notifier::{StateNotifier, SubscriptionId};
use brume_ipc::client::DaemonConnection;
use brume_ipc::types::{DaemonKeyEvent, PublicKey};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Why a key rotation attempt did not produce a new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeygenFailure {
    /// The account has reached its key limit
    TooManyKeys,

    /// Key generation or registration failed
    GenerationFailure,
}

/// Client-side view of the key lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum KeygenEvent {
    /// A key is registered for this account
    NewKey {
        public_key: PublicKey,

        /// `None` until a verification has run for this key
        verified: Option<bool>,

        /// Set when a later rotation attempt failed while this key stayed in
        /// place
        replacement_failure: Option<KeygenFailure>,
    },

    /// The account has reached its key limit and holds no usable key here
    TooManyKeys,

    /// Key generation failed and no previous key exists
    GenerationFailure,
}

impl KeygenEvent {
    fn from_daemon(event: DaemonKeyEvent) -> Self {
        match event {
            DaemonKeyEvent::NewKey(public_key) => KeygenEvent::NewKey {
                public_key,
                verified: None,
                replacement_failure: None,
            },
            DaemonKeyEvent::TooManyKeys => KeygenEvent::TooManyKeys,
            DaemonKeyEvent::GenerationFailure => KeygenEvent::GenerationFailure,
        }
    }

    fn failure(&self) -> Option<KeygenFailure> {
        match self {
            KeygenEvent::NewKey { .. } => None,
            KeygenEvent::TooManyKeys => Some(KeygenFailure::TooManyKeys),
            KeygenEvent::GenerationFailure => Some(KeygenFailure::GenerationFailure),
        }
    }
}

pub struct KeyRotationCoordinator {
    daemon: Arc<dyn DaemonConnection>,
    status: StateNotifier<Option<KeygenEvent>>,
    bootstrap_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    bootstrap_done: watch::Receiver<bool>,
    // Serializes generate/verify so at most one is outstanding at the daemon.
    op_lock: Mutex<()>,
}

impl KeyRotationCoordinator {
    /// Create the coordinator and start its bootstrap: fetch the daemon's
    /// current key, if any, and seed the status with it. Every operation
    /// joins the bootstrap before running, so none races the initial seed.
    pub fn new(daemon: Arc<dyn DaemonConnection>) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);

        let coordinator = Arc::new(KeyRotationCoordinator {
            daemon,
            status: StateNotifier::new(None),
            bootstrap_task: std::sync::Mutex::new(None),
            bootstrap_done: done_rx,
            op_lock: Mutex::new(()),
        });

        let task = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move {
                match coordinator.daemon.get_key().await {
                    Ok(Some(public_key)) => {
                        // A key event may already have arrived; it is newer
                        // than the fetched seed and wins.
                        coordinator.status.update_and_notify(|current| {
                            current.is_none().then(|| {
                                Some(KeygenEvent::NewKey {
                                    public_key: public_key.clone(),
                                    verified: None,
                                    replacement_failure: None,
                                })
                            })
                        });
                    }
                    Ok(None) => debug!("Daemon has no registered key yet"),
                    Err(e) => warn!("Failed to fetch the current key: {}", e),
                }
                let _ = done_tx.send(true);
            }
        });
        *coordinator.bootstrap_task.lock().unwrap() = Some(task);

        coordinator
    }

    /// The current key status, `None` until the bootstrap has seeded one or a
    /// key event arrived.
    pub fn current_status(&self) -> Option<KeygenEvent> {
        self.status.get()
    }

    /// Register a callback for every status change.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Option<KeygenEvent>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.status.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.status.unsubscribe(id)
    }

    async fn join_bootstrap(&self) -> Result<()> {
        let mut done = self.bootstrap_done.clone();
        done.wait_for(|done| *done)
            .await
            .map_err(|_| Error::ShutDown)?;
        Ok(())
    }

    /// Rotate the key. A failure outcome while a key is already in place
    /// preserves that key and its verification state, attaching the failure
    /// to it instead of discarding a working key.
    pub async fn generate(&self) -> Result<KeygenEvent> {
        self.join_bootstrap().await?;
        let _guard = self.op_lock.lock().await;

        let old_status = self.status.get();
        let outcome = match self.daemon.generate_key().await {
            Ok(event) => KeygenEvent::from_daemon(event),
            Err(e) => {
                warn!("Key generation call failed: {}", e);
                KeygenEvent::GenerationFailure
            }
        };

        let new_status = match (old_status, outcome.failure()) {
            (
                Some(KeygenEvent::NewKey {
                    public_key,
                    verified,
                    ..
                }),
                Some(failure),
            ) => KeygenEvent::NewKey {
                public_key,
                verified,
                replacement_failure: Some(failure),
            },
            _ => outcome,
        };

        self.status.set_and_notify(Some(new_status.clone()));
        Ok(new_status)
    }

    /// Verify the current key against the relay infrastructure. Returns the
    /// updated status, or `None` when the result was discarded because the
    /// key it was issued for is no longer current.
    pub async fn verify(&self) -> Result<Option<KeygenEvent>> {
        self.join_bootstrap().await?;
        let _guard = self.op_lock.lock().await;

        let verified = self.daemon.verify_key().await?;

        let updated = self.status.update_and_notify(|current| match current {
            Some(KeygenEvent::NewKey {
                public_key,
                replacement_failure,
                ..
            }) => Some(Some(KeygenEvent::NewKey {
                public_key: public_key.clone(),
                verified: Some(verified),
                replacement_failure: *replacement_failure,
            })),
            // The key changed while the verification was outstanding; the
            // result no longer applies to anything.
            _ => None,
        });

        Ok(updated.flatten())
    }

    /// Fold an unsolicited daemon key event in, replacing the status
    /// wholesale.
    pub fn handle_key_event(&self, event: DaemonKeyEvent) {
        debug!("Daemon key event: {:?}", event);
        self.status
            .set_and_notify(Some(KeygenEvent::from_daemon(event)));
    }

    /// Cancel the bootstrap. Operations still waiting on it fail with
    /// [`Error::ShutDown`]; none of them observes a half-seeded status.
    pub fn shutdown(&self) {
        if let Some(task) = self.bootstrap_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for KeyRotationCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
