//! Typed daemon RPC client
//!
//! Issues request/response calls over the framed transport and demultiplexes
//! daemon push events into a broadcast channel. A reader task owns the
//! receiving half of the socket; replies resolve pending requests through a
//! map keyed by request id, events fan out to subscribers.

use crate::messages::{
    DaemonEvent, DaemonMessage, DaemonRequest, DaemonResponse, RequestEnvelope,
};
use crate::transport::{self, RpcError, RpcResult, TransportReader, TransportWriter};
use crate::types::{DaemonKeyEvent, GeoLocation, PublicKey, Settings, TunnelState};
use async_trait::async_trait;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<DaemonResponse, String>>>>>;

/// Typed interface to the daemon's request/response operations.
///
/// Coordinators hold this as `Arc<dyn DaemonConnection>` for the lifetime of
/// one service instance; tests substitute an in-process fake.
#[async_trait]
pub trait DaemonConnection: Send + Sync {
    async fn get_settings(&self) -> RpcResult<Settings>;
    async fn set_allow_lan(&self, allow: bool) -> RpcResult<()>;
    async fn get_key(&self) -> RpcResult<Option<PublicKey>>;
    async fn generate_key(&self) -> RpcResult<DaemonKeyEvent>;
    async fn verify_key(&self) -> RpcResult<bool>;
    async fn get_location(&self) -> RpcResult<Option<GeoLocation>>;
    async fn get_state(&self) -> RpcResult<TunnelState>;
    async fn set_excluded_apps(&self, apps: Vec<String>) -> RpcResult<()>;
    async fn replace_tunnel_device(&self) -> RpcResult<()>;
    async fn connect_tunnel(&self) -> RpcResult<()>;
    async fn disconnect_tunnel(&self) -> RpcResult<()>;
    async fn shutdown(&self) -> RpcResult<()>;
}

/// Client for the daemon RPC socket.
pub struct DaemonRpcClient {
    writer: Mutex<TransportWriter>,
    pending: PendingMap,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<DaemonEvent>,
    closed_rx: watch::Receiver<bool>,
    reader_task: JoinHandle<()>,
}

impl DaemonRpcClient {
    /// Connect to the daemon socket at the given path.
    pub async fn connect<P: AsRef<Path>>(path: P) -> RpcResult<Self> {
        let (reader, writer) = transport::connect(path).await?;
        Ok(Self::new(reader, writer))
    }

    /// Build a client over an already established transport.
    pub fn new(reader: TransportReader, writer: TransportWriter) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&pending),
            event_tx.clone(),
            closed_tx,
        ));

        Self {
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            event_tx,
            closed_rx,
            reader_task,
        }
    }

    /// Subscribe to daemon push events. Slow subscribers observe lag, not
    /// blocked delivery.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    /// A signal that flips to `true` once the connection is lost, whether by
    /// clean daemon shutdown or transport failure.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    async fn read_loop(
        mut reader: TransportReader,
        pending: PendingMap,
        event_tx: broadcast::Sender<DaemonEvent>,
        closed_tx: watch::Sender<bool>,
    ) {
        loop {
            match reader.next_message().await {
                Ok(Some(DaemonMessage::Reply { id, result })) => {
                    let waiter = pending.lock().await.remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => warn!("Reply for unknown request id {}", id),
                    }
                }
                Ok(Some(DaemonMessage::Event(event))) => {
                    // No subscribers is fine, events are only interesting to
                    // whoever is listening right now.
                    let _ = event_tx.send(event);
                }
                Ok(None) => {
                    debug!("Daemon closed the connection");
                    break;
                }
                Err(e) => {
                    error!("Daemon transport error: {}", e);
                    break;
                }
            }
        }

        // Dropping the waiters fails every outstanding request with `Closed`.
        pending.lock().await.clear();
        let _ = closed_tx.send(true);
    }

    async fn request(&self, request: DaemonRequest) -> RpcResult<DaemonResponse> {
        if *self.closed_rx.borrow() {
            return Err(RpcError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let envelope = RequestEnvelope { id, request };
        let sent = {
            let mut writer = self.writer.lock().await;
            writer.send_request(&envelope).await
        };
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(RpcError::Daemon(message)),
            Err(_) => Err(RpcError::Closed),
        }
    }

    async fn request_ack(&self, request: DaemonRequest) -> RpcResult<()> {
        match self.request(request).await? {
            DaemonResponse::Ack => Ok(()),
            other => Err(unexpected_response(other)),
        }
    }
}

fn unexpected_response(response: DaemonResponse) -> RpcError {
    RpcError::Protocol(format!("Unexpected response: {:?}", response))
}

#[async_trait]
impl DaemonConnection for DaemonRpcClient {
    async fn get_settings(&self) -> RpcResult<Settings> {
        match self.request(DaemonRequest::GetSettings).await? {
            DaemonResponse::Settings(settings) => Ok(settings),
            other => Err(unexpected_response(other)),
        }
    }

    async fn set_allow_lan(&self, allow: bool) -> RpcResult<()> {
        self.request_ack(DaemonRequest::SetAllowLan(allow)).await
    }

    async fn get_key(&self) -> RpcResult<Option<PublicKey>> {
        match self.request(DaemonRequest::GetKey).await? {
            DaemonResponse::Key(key) => Ok(key),
            other => Err(unexpected_response(other)),
        }
    }

    async fn generate_key(&self) -> RpcResult<DaemonKeyEvent> {
        match self.request(DaemonRequest::GenerateKey).await? {
            DaemonResponse::KeyGeneration(event) => Ok(event),
            other => Err(unexpected_response(other)),
        }
    }

    async fn verify_key(&self) -> RpcResult<bool> {
        match self.request(DaemonRequest::VerifyKey).await? {
            DaemonResponse::KeyVerification(verified) => Ok(verified),
            other => Err(unexpected_response(other)),
        }
    }

    async fn get_location(&self) -> RpcResult<Option<GeoLocation>> {
        match self.request(DaemonRequest::GetLocation).await? {
            DaemonResponse::Location(location) => Ok(location),
            other => Err(unexpected_response(other)),
        }
    }

    async fn get_state(&self) -> RpcResult<TunnelState> {
        match self.request(DaemonRequest::GetState).await? {
            DaemonResponse::State(state) => Ok(state),
            other => Err(unexpected_response(other)),
        }
    }

    async fn set_excluded_apps(&self, apps: Vec<String>) -> RpcResult<()> {
        self.request_ack(DaemonRequest::SetExcludedApps(apps)).await
    }

    async fn replace_tunnel_device(&self) -> RpcResult<()> {
        self.request_ack(DaemonRequest::ReplaceTunnelDevice).await
    }

    async fn connect_tunnel(&self) -> RpcResult<()> {
        self.request_ack(DaemonRequest::ConnectTunnel).await
    }

    async fn disconnect_tunnel(&self) -> RpcResult<()> {
        self.request_ack(DaemonRequest::DisconnectTunnel).await
    }

    async fn shutdown(&self) -> RpcResult<()> {
        self.request_ack(DaemonRequest::Shutdown).await
    }
}

impl Drop for DaemonRpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{from_stream, DaemonSideTransport};
    use tokio::net::UnixStream;

    fn client_pair() -> (DaemonRpcClient, DaemonSideTransport) {
        let (client_end, daemon_end) = UnixStream::pair().expect("socket pair");
        let (reader, writer) = from_stream(client_end);
        (
            DaemonRpcClient::new(reader, writer),
            DaemonSideTransport::new(daemon_end),
        )
    }

    #[tokio::test]
    async fn replies_resolve_matching_requests_while_events_fan_out() {
        let (client, mut daemon) = client_pair();
        let mut events = client.subscribe_events();

        let daemon_task = tokio::spawn(async move {
            let request = daemon
                .next_request()
                .await
                .expect("read request")
                .expect("request frame");
            assert_eq!(request.request, DaemonRequest::GetState);

            // An event slipped in before the reply must not confuse the demux.
            daemon
                .send_message(&DaemonMessage::Event(DaemonEvent::TunnelStateChanged(
                    TunnelState::Disconnected,
                )))
                .await
                .expect("send event");
            daemon
                .send_message(&DaemonMessage::Reply {
                    id: request.id,
                    result: Ok(DaemonResponse::State(TunnelState::Disconnected)),
                })
                .await
                .expect("send reply");
            daemon
        });

        let state = client.get_state().await.expect("get state");
        assert_eq!(state, TunnelState::Disconnected);

        let event = events.recv().await.expect("receive event");
        assert_eq!(
            event,
            DaemonEvent::TunnelStateChanged(TunnelState::Disconnected)
        );

        daemon_task.await.expect("daemon side");
    }

    #[tokio::test]
    async fn daemon_reported_failures_surface_as_daemon_errors() {
        let (client, mut daemon) = client_pair();

        tokio::spawn(async move {
            let request = daemon
                .next_request()
                .await
                .expect("read request")
                .expect("request frame");
            daemon
                .send_message(&DaemonMessage::Reply {
                    id: request.id,
                    result: Err("relay list unavailable".to_string()),
                })
                .await
                .expect("send reply");
        });

        let result = client.get_settings().await;
        assert!(matches!(result, Err(RpcError::Daemon(_))));
    }

    #[tokio::test]
    async fn connection_loss_fails_pending_requests_and_signals_closed() {
        let (client, mut daemon) = client_pair();
        let mut closed = client.closed();

        tokio::spawn(async move {
            let _ = daemon.next_request().await;
            drop(daemon);
        });

        let result = client.get_state().await;
        assert!(matches!(result, Err(RpcError::Closed)));

        closed
            .wait_for(|closed| *closed)
            .await
            .expect("closed signal");

        // Requests issued after the loss fail fast.
        let result = client.get_state().await;
        assert!(matches!(result, Err(RpcError::Closed)));
    }
}
