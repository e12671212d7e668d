//! Realtime websocket client and connection lifecycle.
//!
//! One client owns at most one physical socket. The socket lives in a
//! background worker task; the client talks to it through an outbound
//! command queue and observes it through a [`ConnectionState`] watch channel.
//! Inbound frames are routed by the worker to the consumer registered for
//! their subscription id.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

use crate::auth::{self, Credential, DEFAULT_HOST, DEFAULT_WEBSOCKET_ROOT};
use crate::gql::{
    nft_sales_subscription, token_chart_subscription, token_price_subscription,
    token_swap_subscription, GqlRequest, NftSalesParams, TokenChartParams, TokenPriceParams,
    TokenSwapParams,
};
use crate::stream::dispatch::dispatch_frame;
use crate::stream::proto::ClientFrame;
use crate::stream::registry::{Consumer, SubscriptionId, SubscriptionRegistry};
use crate::stream::transport::{
    SocketFactory, SocketHandle, TextSink, TextStream, TungsteniteFactory, WS_TRANSPORT_PROTOCOL,
};

/// Lifecycle of the client's single connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No socket has been created yet.
    Disconnected,
    /// The socket is being opened.
    Connecting,
    /// The socket is open; subscriptions can be started.
    Open,
    /// A close was requested and has not completed.
    Closing,
    /// The socket is gone. Clients do not reconnect.
    Closed,
}

/// Optional configuration for [`RealtimeClient`].
#[derive(Clone, Debug)]
pub struct RealtimeClientOptions {
    /// Host the auth header and start frames are scoped to.
    pub host: String,
    /// Websocket endpoint, without query string.
    pub websocket_root: String,
    /// When `false`, the connection is opened as soon as the client is built.
    pub lazy_connect: bool,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            websocket_root: DEFAULT_WEBSOCKET_ROOT.to_string(),
            lazy_connect: true,
        }
    }
}

impl RealtimeClientOptions {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the websocket endpoint. Trailing whitespace is ignored.
    pub fn with_endpoint(mut self, websocket_root: impl Into<String>) -> Self {
        self.websocket_root = websocket_root.into().trim_end().to_string();
        self
    }

    pub fn with_lazy_connect(mut self, lazy_connect: bool) -> Self {
        self.lazy_connect = lazy_connect;
        self
    }
}

/// Errors produced by the realtime client.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Missing or invalid client configuration, such as an empty API key.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No socket implementation can run in the current runtime.
    #[error("websocket transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A handshake header could not be encoded.
    #[error("invalid websocket header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    /// The socket failed to open.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The connection was closed, or is closing.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The connection worker is no longer accepting frames.
    #[error("send queue is closed")]
    SendQueueClosed,
}

enum Outbound {
    Frame(String),
    Close,
}

/// State shared between the client and its connection worker.
struct Shared {
    state: watch::Sender<ConnectionState>,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn fail(&self, message: String) {
        *self.failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message);
        self.state.send_replace(ConnectionState::Closed);
    }

    fn closed_error(&self) -> RealtimeError {
        match self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            Some(message) => RealtimeError::ConnectFailed(message),
            None => RealtimeError::ConnectionClosed,
        }
    }
}

struct ClientInner {
    credential: Credential,
    websocket_root: String,
    factory: Arc<dyn SocketFactory>,
    registry: Arc<SubscriptionRegistry>,
    shared: Arc<Shared>,
    // Also serializes client-side state transitions.
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl ClientInner {
    fn lock_outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, command: Outbound) -> Result<(), RealtimeError> {
        self.lock_outbound()
            .as_ref()
            .ok_or(RealtimeError::ConnectionClosed)?
            .send(command)
            .map_err(|_| RealtimeError::SendQueueClosed)
    }

    /// Queues `command` only while the connection is open. Holding the
    /// outbound lock orders this against a concurrent `disconnect`, whose
    /// close is queued under the same lock.
    fn send_while_open(&self, command: Outbound) -> Result<(), RealtimeError> {
        let outbound = self.lock_outbound();
        if self.shared.state() != ConnectionState::Open {
            return Err(RealtimeError::ConnectionClosed);
        }
        outbound
            .as_ref()
            .ok_or(RealtimeError::ConnectionClosed)?
            .send(command)
            .map_err(|_| RealtimeError::SendQueueClosed)
    }

    fn websocket_url(&self) -> String {
        auth::websocket_url(&self.websocket_root, &self.credential.auth_header())
    }

    /// Spawns the connection worker. Caller holds the outbound lock and has
    /// checked the state is `Disconnected`.
    fn open(
        &self,
        outbound: &mut Option<mpsc::UnboundedSender<Outbound>>,
    ) -> Result<(), RealtimeError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RealtimeError::TransportUnavailable("no tokio runtime is running".to_string())
        })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *outbound = Some(outbound_tx);
        self.shared.state.send_replace(ConnectionState::Connecting);
        debug!(event = "connection_opening");

        runtime.spawn(connection_worker(
            self.websocket_url(),
            Arc::clone(&self.factory),
            Arc::clone(&self.registry),
            Arc::clone(&self.shared),
            outbound_rx,
        ));
        Ok(())
    }
}

/// Realtime client multiplexing subscriptions over one websocket.
///
/// Cloning is cheap; clones share the same connection and subscriptions.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    /// Creates a lazily connecting client for the production endpoint.
    pub fn new(api_key: SecretString) -> Result<Self, RealtimeError> {
        Self::with_options(api_key, RealtimeClientOptions::default())
    }

    pub fn with_options(
        api_key: SecretString,
        options: RealtimeClientOptions,
    ) -> Result<Self, RealtimeError> {
        Self::with_transport(api_key, options, Arc::new(TungsteniteFactory))
    }

    /// Creates a client that opens its socket through `factory`.
    ///
    /// With `lazy_connect` disabled this must be called from within a tokio
    /// runtime; the connection attempt starts immediately.
    pub fn with_transport(
        api_key: SecretString,
        options: RealtimeClientOptions,
        factory: Arc<dyn SocketFactory>,
    ) -> Result<Self, RealtimeError> {
        let credential = Credential::with_host(api_key, options.host)?;
        if options.websocket_root.trim().is_empty() {
            return Err(RealtimeError::Configuration(
                "websocket endpoint cannot be empty".to_string(),
            ));
        }

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let client = Self {
            inner: Arc::new(ClientInner {
                credential,
                websocket_root: options.websocket_root,
                factory,
                registry: Arc::new(SubscriptionRegistry::new()),
                shared: Arc::new(Shared {
                    state,
                    failure: Mutex::new(None),
                }),
                outbound: Mutex::new(None),
            }),
        };

        if !options.lazy_connect {
            let mut outbound = client.inner.lock_outbound();
            client.inner.open(&mut outbound)?;
        }
        Ok(client)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Receiver that observes every connection state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Host the client authenticates against.
    pub fn host(&self) -> &str {
        self.inner.credential.host()
    }

    /// Authenticated websocket URL, including the encoded auth header.
    pub fn websocket_url(&self) -> String {
        self.inner.websocket_url()
    }

    /// Number of subscriptions currently registered.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.len()
    }

    /// Opens the connection, or waits for the one already opening.
    ///
    /// Concurrent callers share a single connection attempt. Resolves
    /// immediately when the connection is already open. There is no timeout:
    /// wrap the call in `tokio::time::timeout` if the endpoint may hang.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let mut state_rx = {
            let mut outbound = self.inner.lock_outbound();
            match self.state() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(self.inner.shared.closed_error());
                }
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected => self.inner.open(&mut outbound)?,
            }
            self.inner.shared.state.subscribe()
        };

        let state = state_rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state)
            .map_err(|_| RealtimeError::ConnectionClosed)?;

        match state {
            ConnectionState::Open => Ok(()),
            _ => Err(self.inner.shared.closed_error()),
        }
    }

    /// Closes the connection and waits until the close is observed.
    ///
    /// Resolves immediately when no connection was ever opened or it is
    /// already closed. Registered subscriptions are not removed; they simply
    /// stop receiving frames.
    pub async fn disconnect(&self) -> Result<(), RealtimeError> {
        let mut state_rx = {
            let outbound = self.inner.lock_outbound();
            let mut close_requested = false;
            self.inner.shared.state.send_if_modified(|state| match *state {
                ConnectionState::Connecting | ConnectionState::Open => {
                    *state = ConnectionState::Closing;
                    close_requested = true;
                    true
                }
                _ => false,
            });

            match self.state() {
                ConnectionState::Disconnected | ConnectionState::Closed => return Ok(()),
                _ => {}
            }
            if close_requested {
                debug!(event = "connection_close_requested");
                if let Some(tx) = outbound.as_ref() {
                    let _ = tx.send(Outbound::Close);
                }
            }
            self.inner.shared.state.subscribe()
        };

        state_rx
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .map_err(|_| RealtimeError::ConnectionClosed)?;
        Ok(())
    }

    /// Starts a subscription and routes its payloads to `consumer`.
    ///
    /// Opens the connection first if needed. The registry keeps a shared
    /// reference to `consumer`; keep your own clone to inspect its state.
    pub async fn subscribe(
        &self,
        query: &str,
        consumer: Arc<dyn Consumer>,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        self.subscribe_with_variables(query, None, consumer).await
    }

    /// Like [`subscribe`](Self::subscribe), with GraphQL variables.
    pub async fn subscribe_with_variables(
        &self,
        query: &str,
        variables: Option<Value>,
        consumer: Arc<dyn Consumer>,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        self.connect().await?;

        let id = self.inner.registry.register(consumer);
        let sent = ClientFrame::start(
            id.to_string(),
            query,
            variables,
            self.inner.credential.host(),
            self.inner.credential.api_key().expose_secret(),
        )
        .and_then(|frame| frame.to_text())
        .map_err(RealtimeError::from)
        .and_then(|text| self.inner.send_while_open(Outbound::Frame(text)))
        .and_then(|()| {
            // The worker may have exited without reading the frame.
            match self.state() {
                ConnectionState::Open => Ok(()),
                _ => Err(RealtimeError::ConnectionClosed),
            }
        });

        if let Err(err) = sent {
            self.inner.registry.unregister(&id);
            return Err(err);
        }

        debug!(event = "subscription_started", subscription_id = %id);
        Ok(SubscriptionHandle {
            id,
            client: Arc::downgrade(&self.inner),
        })
    }

    /// Subscribes to NFT sale events matching `params`.
    pub async fn subscribe_to_nft_sales(
        &self,
        params: &NftSalesParams,
        consumer: Arc<dyn Consumer>,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        self.subscribe_request(nft_sales_subscription(params), consumer)
            .await
    }

    /// Subscribes to token price updates matching `params`.
    pub async fn subscribe_to_token_price_updates(
        &self,
        params: &TokenPriceParams,
        consumer: Arc<dyn Consumer>,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        self.subscribe_request(token_price_subscription(params), consumer)
            .await
    }

    /// Subscribes to chart bar updates for one pair.
    pub async fn subscribe_to_token_chart_updates(
        &self,
        params: &TokenChartParams,
        consumer: Arc<dyn Consumer>,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        self.subscribe_request(token_chart_subscription(params), consumer)
            .await
    }

    /// Subscribes to swap events for one pair.
    pub async fn subscribe_to_token_swap_updates(
        &self,
        params: &TokenSwapParams,
        consumer: Arc<dyn Consumer>,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        self.subscribe_request(token_swap_subscription(params), consumer)
            .await
    }

    async fn subscribe_request(
        &self,
        request: GqlRequest,
        consumer: Arc<dyn Consumer>,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        self.subscribe_with_variables(&request.query, request.variables, consumer)
            .await
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("host", &self.inner.credential.host())
            .field("websocket_root", &self.inner.websocket_root)
            .field("state", &self.state())
            .field("subscriptions", &self.inner.registry.len())
            .finish()
    }
}

/// Cancellation handle returned by [`RealtimeClient::subscribe`].
///
/// Dropping the handle does not cancel the subscription.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    client: Weak<ClientInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stops routing frames to this subscription's consumer.
    ///
    /// The first call releases the registry entry and, if the connection is
    /// still open, asks the server to stop the subscription. Later calls do
    /// nothing.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.client.upgrade() else {
            return;
        };
        if !inner.registry.unregister(&self.id) {
            return;
        }
        debug!(event = "subscription_cancelled", subscription_id = %self.id);

        if inner.shared.state() != ConnectionState::Open {
            return;
        }
        let stop = ClientFrame::Stop {
            id: self.id.to_string(),
        };
        match stop.to_text() {
            Ok(text) => {
                let _ = inner.send(Outbound::Frame(text));
            }
            Err(err) => warn!(event = "stop_frame_encode_failed", error = %err),
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}

enum ConnectionOutcome {
    ClientClosed,
    ServerClosed,
    Failed(RealtimeError),
}

async fn connection_worker(
    url: String,
    factory: Arc<dyn SocketFactory>,
    registry: Arc<SubscriptionRegistry>,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let opened = tokio::select! {
        result = factory.connect(url, WS_TRANSPORT_PROTOCOL) => result,
        () = wait_for_close(&mut outbound_rx) => {
            info!(event = "connection_aborted");
            shared.state.send_replace(ConnectionState::Closed);
            return;
        }
    };

    let SocketHandle {
        mut sink,
        mut stream,
    } = match opened {
        Ok(handle) => handle,
        Err(err) => {
            warn!(event = "connection_failed", error = %err);
            shared.fail(err.to_string());
            return;
        }
    };

    shared.state.send_if_modified(|state| {
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Open;
            true
        } else {
            false
        }
    });
    info!(event = "connection_opened");

    let outcome = run_open_connection(&mut sink, &mut stream, &registry, &mut outbound_rx).await;
    let orphaned = registry.len();
    match outcome {
        ConnectionOutcome::ClientClosed => {
            info!(event = "connection_closed", orphaned_subscriptions = orphaned);
        }
        ConnectionOutcome::ServerClosed => {
            warn!(event = "connection_dropped", orphaned_subscriptions = orphaned);
        }
        ConnectionOutcome::Failed(err) => {
            warn!(
                event = "connection_failed",
                error = %err,
                orphaned_subscriptions = orphaned
            );
        }
    }
    shared.state.send_replace(ConnectionState::Closed);
}

async fn run_open_connection(
    sink: &mut TextSink,
    stream: &mut TextStream,
    registry: &SubscriptionRegistry,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> ConnectionOutcome {
    loop {
        tokio::select! {
            command = outbound_rx.recv() => {
                match command {
                    Some(Outbound::Frame(text)) => {
                        if let Err(err) = sink.send(text).await {
                            return ConnectionOutcome::Failed(err);
                        }
                    }
                    // `None` means every client handle was dropped.
                    Some(Outbound::Close) | None => {
                        close_socket(sink, stream).await;
                        return ConnectionOutcome::ClientClosed;
                    }
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(text)) => {
                        dispatch_frame(registry, &text);
                    }
                    Some(Err(err)) => return ConnectionOutcome::Failed(err),
                    None => return ConnectionOutcome::ServerClosed,
                }
            }
        }
    }
}

async fn close_socket(sink: &mut TextSink, stream: &mut TextStream) {
    if let Err(err) = sink.close().await {
        debug!(event = "connection_close_failed", error = %err);
        return;
    }
    // Wait for the peer to finish the close handshake. Frames still in
    // flight are dropped.
    while let Some(message) = stream.next().await {
        if message.is_err() {
            break;
        }
    }
}

async fn wait_for_close(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    while let Some(command) = outbound_rx.recv().await {
        if matches!(command, Outbound::Close) {
            return;
        }
    }
}
