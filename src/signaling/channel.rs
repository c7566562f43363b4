use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::message::{SignalPayload, SignalingMessage};
use super::reconnect::ReconnectPolicy;
use crate::error::{Result, SessionError};
use crate::identity::SignalingEndpoint;
use crate::lock;

type SignalingStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Async handler invoked for every inbound message of one event name.
pub type MessageHandler = Arc<dyn Fn(SignalingMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
    /// The reconnect policy ran out of attempts.
    GiveUp,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::GiveUp => "give_up",
        };
        f.write_str(name)
    }
}

enum ServeOutcome {
    Shutdown,
    Dropped,
}

struct DriverHandle {
    task: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

/// Persistent control-plane connection to the coordination server.
pub struct SignalingChannel {
    shared: Arc<ChannelShared>,
    driver: Mutex<Option<DriverHandle>>,
}

struct ChannelShared {
    endpoint: SignalingEndpoint,
    policy: ReconnectPolicy,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    outbound: StdMutex<Option<mpsc::UnboundedSender<Message>>>,
    state: watch::Sender<ConnectionState>,
}

impl SignalingChannel {
    pub fn new(endpoint: SignalingEndpoint, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);

        Self {
            shared: Arc::new(ChannelShared {
                endpoint,
                policy,
                handlers: RwLock::new(HashMap::new()),
                outbound: StdMutex::new(None),
                state,
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &SignalingEndpoint {
        &self.shared.endpoint
    }

    /// Starts the connection driver. Calling this while a driver is already
    /// running is a no-op. Establishment failures are retried per the
    /// reconnect policy, never returned.
    pub async fn connect(&self) {
        let mut driver = self.driver.lock().await;
        if let Some(handle) = driver.as_ref() {
            if !handle.task.is_finished() {
                tracing::debug!(
                    participant = self.shared.endpoint.participant_id(),
                    "Signaling driver already running"
                );
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let task = tokio::spawn(async move { shared.run(shutdown_rx).await });

        *driver = Some(DriverHandle {
            task,
            shutdown: shutdown_tx,
        });
    }

    /// Cancels any pending reconnect and closes the transport.
    pub async fn disconnect(&self) {
        let handle = self.driver.lock().await.take();

        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            let abort = handle.task.abort_handle();
            if timeout(Duration::from_secs(2), handle.task).await.is_err() {
                tracing::warn!("Signaling driver did not stop in time, aborting");
                abort.abort();
            }
        }

        self.shared.clear_outbound();
        self.shared.set_state(ConnectionState::Closed);
        tracing::info!(
            participant = self.shared.endpoint.participant_id(),
            "Signaling channel disconnected"
        );
    }

    /// Registers the handler for `event`, replacing any previous one.
    pub async fn on<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(SignalingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |message| Box::pin(handler(message)));
        let event = event.into();

        let mut handlers = self.shared.handlers.write().await;
        if handlers.insert(event.clone(), handler).is_some() {
            tracing::debug!(event = %event, "Replaced signaling handler");
        }
    }

    pub async fn off(&self, event: &str) {
        self.shared.handlers.write().await.remove(event);
    }

    /// Queues `envelope` on the live transport. Fails, without panicking, when
    /// the transport is not open; delivery is never guaranteed.
    pub fn send_message(&self, envelope: &SignalingMessage) -> Result<()> {
        self.shared.send(envelope)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

impl ChannelShared {
    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            let url = self.endpoint.connection_url();

            let connected = tokio::select! {
                _ = &mut shutdown => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                result = connect_async(url.as_str()) => result,
            };

            match connected {
                Ok((stream, _)) => {
                    attempt = 0;
                    match self.serve(stream, &mut shutdown).await {
                        ServeOutcome::Shutdown => {
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                        ServeOutcome::Dropped => {
                            tracing::warn!(
                                url = %self.endpoint.url(),
                                "Signaling transport dropped"
                            );
                        }
                    }
                }
                Err(e) => {
                    let err = SessionError::from(e);
                    tracing::warn!(
                        url = %self.endpoint.url(),
                        error = %err,
                        "Signaling connection attempt failed"
                    );
                }
            }

            let Some(delay) = self.policy.delay_for(attempt) else {
                tracing::error!(
                    url = %self.endpoint.url(),
                    attempts = attempt,
                    "Giving up on signaling reconnection"
                );
                self.set_state(ConnectionState::GiveUp);
                return;
            };
            attempt += 1;

            self.set_state(ConnectionState::Reconnecting);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempt,
                "Scheduling signaling reconnect"
            );

            tokio::select! {
                _ = &mut shutdown => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                _ = sleep(delay) => {}
            }
        }
    }

    async fn serve(
        &self,
        stream: SignalingStream,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> ServeOutcome {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        *lock(&self.outbound) = Some(tx);
        self.set_state(ConnectionState::Open);
        tracing::info!(
            url = %self.endpoint.url(),
            participant = self.endpoint.participant_id(),
            role = %self.endpoint.role(),
            "Signaling channel open"
        );

        // Re-announce on every open; the server treats this as idempotent.
        let own_id = self.endpoint.participant_id();
        match SignalingMessage::new(&SignalPayload::JoinRequest, own_id, Some(own_id)) {
            Ok(join) => {
                let _ = self.send(&join);
            }
            Err(e) => tracing::error!(error = %e, "Failed to build join request"),
        }

        let outcome = loop {
            tokio::select! {
                _ = &mut *shutdown => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        tracing::debug!(error = %e, "Close frame not delivered");
                    }
                    break ServeOutcome::Shutdown;
                }
                Some(frame) = rx.recv() => {
                    if let Err(e) = write.send(frame).await {
                        tracing::warn!(error = %e, "Failed to write signaling frame");
                        break ServeOutcome::Dropped;
                    }
                }
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.dispatch(&text).await,
                        Err(e) => tracing::warn!(error = %e, "Dropping non UTF-8 signaling frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(frame = ?frame, "Signaling server closed the connection");
                        break ServeOutcome::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Signaling transport error");
                        break ServeOutcome::Dropped;
                    }
                    None => break ServeOutcome::Dropped,
                }
            }
        };

        self.clear_outbound();
        outcome
    }

    async fn dispatch(&self, text: &str) {
        let message = match SignalingMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, raw_message = %text, "Dropping malformed signaling frame");
                return;
            }
        };

        tracing::debug!(
            event = %message.event,
            participant = message.participant,
            "Received signaling message"
        );

        let handler = self.handlers.read().await.get(&message.event).cloned();
        match handler {
            Some(handler) => handler(message).await,
            None => tracing::trace!(event = %message.event, "No handler for signaling event"),
        }
    }

    fn send(&self, envelope: &SignalingMessage) -> Result<()> {
        let result = envelope.to_json().and_then(|text| {
            let outbound = lock(&self.outbound);
            match outbound.as_ref() {
                Some(tx) if *self.state.borrow() == ConnectionState::Open => tx
                    .send(Message::Text(text))
                    .map_err(|_| SessionError::transport("signaling writer has stopped")),
                _ => Err(SessionError::transport("signaling channel is not connected")),
            }
        });

        if let Err(e) = &result {
            tracing::warn!(
                event = %envelope.event,
                participant = envelope.participant,
                error = %e,
                "Failed to send signaling message"
            );
        }
        result
    }

    fn clear_outbound(&self) {
        lock(&self.outbound).take();
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Signaling state changed");
        }
    }
}
