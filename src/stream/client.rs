//! Persistent payments websocket with automatic reconnects.
//!
//! A [`PaymentStream`] spawns one background worker that owns the socket and
//! runs `connect -> receive -> backoff` in sequence, so at most one receive
//! loop exists per stream at any time. Received payloads are fanned out to the
//! stream's [`SubscriberRegistry`].

use std::future::Future;
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConnectionParameters, StreamClientOptions};
use crate::retry::{sleep_or_cancel, with_timeout};
use crate::stream::codec::{self, Frame};
use crate::stream::dispatch::{SubscriberError, SubscriberRegistry, SubscriptionId};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle as observed through [`PaymentStream::state_watch`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No socket; either not started, stopped, or between sessions.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// Socket is up and payloads are being dispatched.
    Open,
    /// Normal-closure handshake in progress after `stop`.
    Closing,
    /// Last attempt or session failed; a reconnect is pending.
    Failed,
}

enum Lifecycle {
    NotStarted,
    Running {
        cancel: CancellationToken,
        worker: JoinHandle<()>,
    },
    Stopped,
}

/// Long-lived payments stream for one phoenixd node.
pub struct PaymentStream {
    url: String,
    params: ConnectionParameters,
    options: StreamClientOptions,
    registry: Arc<SubscriberRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    lifecycle: Mutex<Lifecycle>,
}

impl PaymentStream {
    /// Creates a stopped stream. Nothing connects until [`Self::start`].
    pub fn new(
        params: ConnectionParameters,
        options: StreamClientOptions,
    ) -> Result<Self, StreamClientError> {
        install_crypto_provider();
        let url = params.websocket_url();
        // Reject URLs that could never produce a handshake request up front,
        // instead of retrying them forever.
        url.as_str().into_client_request()?;

        let (state, _) = watch::channel(ConnectionState::Idle);
        Ok(Self {
            url,
            params,
            options,
            registry: Arc::new(SubscriberRegistry::new()),
            state: Arc::new(state),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        })
    }

    /// Websocket endpoint every attempt connects to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Shared handle to the subscriber registry.
    pub fn registry(&self) -> Arc<SubscriberRegistry> {
        Arc::clone(&self.registry)
    }

    /// Registers a callback invoked with every received payload.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.registry.subscribe(callback)
    }

    /// Registers a queue-backed subscriber.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<String>) {
        self.registry.subscribe_channel()
    }

    /// Removes a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Starts the background worker.
    ///
    /// Returns once the first connect attempt has either opened the socket or
    /// failed and handed over to the reconnect loop; connect failures are
    /// never returned here. Calling `start` on a running stream is a no-op;
    /// calling it after [`Self::stop`] returns [`StreamClientError::Stopped`].
    pub async fn start(&self) -> Result<(), StreamClientError> {
        let (started_tx, started_rx) = oneshot::channel();
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            match *lifecycle {
                Lifecycle::Running { .. } => {
                    debug!(event = "start_ignored", reason = "already running");
                    return Ok(());
                }
                Lifecycle::Stopped => return Err(StreamClientError::Stopped),
                Lifecycle::NotStarted => {}
            }

            let cancel = CancellationToken::new();
            let worker = StreamWorker {
                url: self.url.clone(),
                params: self.params.clone(),
                options: self.options.clone(),
                registry: Arc::clone(&self.registry),
                state: Arc::clone(&self.state),
                cancel: cancel.clone(),
            };
            let worker = tokio::spawn(worker.run(started_tx));
            *lifecycle = Lifecycle::Running { cancel, worker };
        }

        // The worker drops the sender without signalling only when it was
        // cancelled before finishing the first attempt.
        let _ = started_rx.await;
        Ok(())
    }

    /// Closes the socket and halts reconnects.
    ///
    /// Waits for the worker to send its normal-closure frame and exit. Any
    /// pending backoff wait is cut short. Calling `stop` again is a no-op.
    pub async fn stop(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        match previous {
            Lifecycle::Running { cancel, worker } => {
                info!(event = "stream_stopping", url = %self.url);
                cancel.cancel();
                if let Err(err) = worker.await {
                    warn!(event = "stream_worker_join_failed", error = %err);
                }
            }
            Lifecycle::NotStarted => {
                self.state.send_replace(ConnectionState::Idle);
            }
            Lifecycle::Stopped => {
                debug!(event = "stop_ignored", reason = "already stopped");
            }
        }
    }

    /// Waits for `signal`, then stops the stream.
    pub async fn stop_on<F>(&self, signal: F)
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.stop().await;
    }
}

impl Drop for PaymentStream {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Running { cancel, .. } = lifecycle {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for PaymentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentStream")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("subscribers", &self.registry.len())
            .finish()
    }
}

/// Errors produced by stream setup and connect attempts.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Stop was requested while a connect attempt was in flight.
    #[error("connect attempt cancelled")]
    Cancelled,

    /// The stream was stopped and cannot be started again.
    #[error("stream has been stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

enum SessionOutcome {
    Stopped,
    Reconnect,
}

struct StreamWorker {
    url: String,
    params: ConnectionParameters,
    options: StreamClientOptions,
    registry: Arc<SubscriberRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
}

impl StreamWorker {
    async fn run(self, started_tx: oneshot::Sender<()>) {
        let mut started_tx = Some(started_tx);
        let mut failures = 0usize;

        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt = failures + 1;
            debug!(event = "connect_attempt", attempt, url = %self.url);

            match self.connect().await {
                Ok(socket) => {
                    self.set_state(ConnectionState::Open);
                    info!(event = "connected", url = %self.url, attempt);
                    signal_started(&mut started_tx);

                    match self.receive_loop(socket).await {
                        SessionOutcome::Stopped => break,
                        // A dropped session counts as the first failure of a new run.
                        SessionOutcome::Reconnect => failures = 1,
                    }
                }
                Err(StreamClientError::Cancelled) => break,
                Err(err) => {
                    failures += 1;
                    self.set_state(ConnectionState::Failed);
                    warn!(
                        event = "connect_failed",
                        url = %self.url,
                        attempt,
                        retry_in_ms = self.delay(failures).as_millis() as u64,
                        error = %err
                    );
                    signal_started(&mut started_tx);
                }
            }

            if !sleep_or_cancel(self.delay(failures), &self.cancel).await {
                break;
            }
        }

        self.set_state(ConnectionState::Idle);
        debug!(event = "stream_worker_exited", url = %self.url);
    }

    fn delay(&self, failures: usize) -> Duration {
        self.options.reconnect_policy.delay_for_attempt(failures.max(1))
    }

    /// One connect attempt with a fresh handle.
    async fn connect(&self) -> Result<Socket, StreamClientError> {
        let mut request = self.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.params.authorization_header().clone());

        let timeout = self.options.connect_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StreamClientError::Cancelled),
            result = with_timeout(timeout, connect_async(request)) => match result {
                Ok(Ok((socket, _response))) => Ok(socket),
                Ok(Err(err)) => Err(StreamClientError::WebSocket(err)),
                Err(_) => Err(StreamClientError::ConnectTimeout(timeout)),
            },
        }
    }

    async fn receive_loop(&self, mut socket: Socket) -> SessionOutcome {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.disconnect(&mut socket).await;
                    return SessionOutcome::Stopped;
                }
                next = socket.next() => match next {
                    Some(Ok(message)) => match codec::decode(message) {
                        Frame::Text(payload) => {
                            debug!(event = "payload_received", bytes = payload.len());
                            self.registry.dispatch(&payload);
                        }
                        Frame::Ping(payload) => {
                            if let Err(err) = socket.send(Message::Pong(payload)).await {
                                return self.receive_failed(&err.to_string());
                            }
                        }
                        Frame::Pong => {}
                        Frame::Undecodable { len } => {
                            warn!(event = "payload_dropped", bytes = len, reason = "not valid utf-8");
                        }
                        Frame::Close { code, reason } => {
                            info!(event = "remote_closed", url = %self.url, code, reason = %reason);
                            if let Err(err) = socket.close(None).await {
                                debug!(event = "close_ack_failed", error = %err);
                            }
                            self.set_state(ConnectionState::Idle);
                            return SessionOutcome::Reconnect;
                        }
                    },
                    Some(Err(err)) => return self.receive_failed(&err.to_string()),
                    None => return self.receive_failed("stream ended without close frame"),
                },
            }
        }
    }

    fn receive_failed(&self, error: &str) -> SessionOutcome {
        self.set_state(ConnectionState::Failed);
        warn!(
            event = "receive_failed",
            url = %self.url,
            retry_in_ms = self.delay(1).as_millis() as u64,
            error
        );
        SessionOutcome::Reconnect
    }

    async fn disconnect(&self, socket: &mut Socket) {
        self.set_state(ConnectionState::Closing);
        match socket.close(Some(codec::normal_close())).await {
            Ok(()) => info!(event = "disconnected", url = %self.url),
            Err(err) => warn!(event = "disconnect_failed", url = %self.url, error = %err),
        }
        self.set_state(ConnectionState::Idle);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(event = "state_changed", from = ?previous, to = ?next);
        }
    }
}

/// Picks the process-wide rustls provider used for `wss` hosts.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // An application may already have installed its own provider.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn signal_started(started_tx: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = started_tx.take() {
        let _ = tx.send(());
    }
}
