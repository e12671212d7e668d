use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use defined_realtime_sdk::auth::encode_auth_header;
use defined_realtime_sdk::gql::{TokenPriceData, TokenPriceParams};
use defined_realtime_sdk::stream::proto::ClientFrame;
use defined_realtime_sdk::{
    ConnectionState, FnSink, RealtimeClient, RealtimeClientOptions, RealtimeError,
};
use futures_util::StreamExt;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const TEST_API_KEY: &str = "test-api-key";
const TEST_HOST: &str = "realtime.api.example";
const TEST_TOKEN: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
const TEST_NETWORK_ID: u64 = 1;

#[derive(Debug)]
struct WsObserved {
    start_id: String,
    query: String,
    variables: Option<Value>,
    authorization: String,
    host: String,
    stop_id: String,
}

#[derive(Clone)]
struct WsState {
    expected_query: String,
    observed_tx: Arc<Mutex<Option<oneshot::Sender<Result<WsObserved, String>>>>>,
}

#[derive(Debug)]
enum Event {
    Data(Value),
    Error(Value),
}

fn test_options(addr: SocketAddr) -> RealtimeClientOptions {
    RealtimeClientOptions::default()
        .with_host(TEST_HOST)
        .with_endpoint(format!("ws://{addr}/graphql/realtime"))
}

fn channel_sink() -> (FnSink, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let error_tx = tx.clone();
    let sink = FnSink::new(move |data| {
        let _ = tx.send(Event::Data(data));
    })
    .with_error(move |error| {
        let _ = error_tx.send(Event::Error(error.errors));
    });
    (sink, rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for subscription event")
        .expect("subscription event channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn realtime_client_ws_smoke_subscribe_receive_unsubscribe() {
    let header = encode_auth_header(TEST_API_KEY, TEST_HOST).expect("encode auth header");
    let (observed_tx, observed_rx) = oneshot::channel();
    let ws_state = WsState {
        expected_query: format!("header={header}&payload=e30="),
        observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
    };

    let app = Router::new()
        .route("/graphql/realtime", get(ws_handler))
        .with_state(ws_state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let client = RealtimeClient::with_options(
        SecretString::new(TEST_API_KEY.to_string()),
        test_options(addr),
    )
    .expect("build realtime client");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let (sink, mut events) = channel_sink();
    let handle = client
        .subscribe_to_token_price_updates(
            &TokenPriceParams {
                contract_address: Some(TEST_TOKEN.to_string()),
                network_id: Some(TEST_NETWORK_ID),
            },
            Arc::new(sink),
        )
        .await
        .expect("subscribe to price updates");
    assert_eq!(client.state(), ConnectionState::Open);

    let Event::Data(data) = next_event(&mut events).await else {
        panic!("expected data before error");
    };
    let price = TokenPriceData::from_value(data).expect("decode price payload");
    assert_eq!(price.on_update_price.address, TEST_TOKEN);
    assert_eq!(price.on_update_price.price_usd, 3120.5);

    let Event::Error(errors) = next_event(&mut events).await else {
        panic!("expected error after data");
    };
    assert_eq!(errors, json!([{"message": "rate limited"}]));
    assert_eq!(client.state(), ConnectionState::Open);

    handle.unsubscribe();
    let observed = timeout(Duration::from_secs(2), observed_rx)
        .await
        .expect("timed out waiting for ws server observations")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed");
    assert_eq!(observed.start_id, handle.id().to_string());
    assert_eq!(observed.stop_id, observed.start_id);
    assert!(
        observed
            .query
            .contains("onUpdatePrice(address: $address, networkId: $networkId)"),
        "unexpected query: {}",
        observed.query
    );
    assert_eq!(
        observed.variables,
        Some(json!({"address": TEST_TOKEN, "networkId": TEST_NETWORK_ID}))
    );
    assert_eq!(observed.authorization, TEST_API_KEY);
    assert_eq!(observed.host, TEST_HOST);
    assert_eq!(client.active_subscriptions(), 0);

    timeout(Duration::from_secs(2), client.disconnect())
        .await
        .expect("timed out waiting for disconnect")
        .expect("disconnect");
    assert_eq!(client.state(), ConnectionState::Closed);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn realtime_client_reports_rejected_handshake() {
    let app = Router::new().route(
        "/graphql/realtime",
        get(|| async { StatusCode::UNAUTHORIZED }),
    );
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let client = RealtimeClient::with_options(
        SecretString::new(TEST_API_KEY.to_string()),
        test_options(addr),
    )
    .expect("build realtime client");

    let result = timeout(Duration::from_secs(2), client.connect())
        .await
        .expect("timed out waiting for connect");
    assert!(
        matches!(result, Err(RealtimeError::ConnectFailed(_))),
        "unexpected connect result: {result:?}"
    );
    assert_eq!(client.state(), ConnectionState::Closed);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn realtime_client_observes_server_close() {
    let app = Router::new().route(
        "/graphql/realtime",
        get(|ws: WebSocketUpgrade| async move {
            ws.protocols(["graphql-ws"])
                .on_upgrade(|mut socket| async move {
                    let _ = recv_client_frame(&mut socket).await;
                    // Let `subscribe` return before the close lands.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = socket.send(Message::Close(None)).await;
                })
        }),
    );
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let client = RealtimeClient::with_options(
        SecretString::new(TEST_API_KEY.to_string()),
        test_options(addr),
    )
    .expect("build realtime client");
    let mut states = client.watch_state();

    let (sink, _events) = channel_sink();
    client
        .subscribe("subscription { onUpdatePrice { priceUsd } }", Arc::new(sink))
        .await
        .expect("subscribe");

    timeout(
        Duration::from_secs(2),
        states.wait_for(|state| *state == ConnectionState::Closed),
    )
    .await
    .expect("timed out waiting for server close")
    .expect("state channel closed");
    assert_eq!(client.active_subscriptions(), 1);
    assert!(matches!(
        client.connect().await,
        Err(RealtimeError::ConnectionClosed)
    ));

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

async fn ws_handler(
    State(state): State<WsState>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if query.as_deref() != Some(state.expected_query.as_str()) {
        if let Some(tx) = state.observed_tx.lock().await.take() {
            let _ = tx.send(Err(format!("unexpected connection query: {query:?}")));
        }
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let observed_tx = state.observed_tx.clone();
    ws.protocols(["graphql-ws"])
        .on_upgrade(move |mut socket| async move {
            let result = run_ws_protocol(&mut socket).await;
            if let Some(tx) = observed_tx.lock().await.take() {
                let _ = tx.send(result);
            }
            drain_until_close(&mut socket).await;
        })
        .into_response()
}

async fn run_ws_protocol(socket: &mut WebSocket) -> Result<WsObserved, String> {
    let (start_id, payload) = match recv_client_frame(socket).await? {
        ClientFrame::Start { id, payload } => (id, payload),
        other => {
            return Err(format!(
                "expected first client frame to be start, got {other:?}"
            ));
        }
    };
    let query = payload
        .query()
        .map_err(|err| format!("start payload data is not a query document: {err}"))?;

    send_server_frame(socket, json!({"id": start_id, "type": "start_ack"})).await?;
    send_server_frame(socket, json!({"type": "ka"})).await?;
    send_server_frame(
        socket,
        json!({
            "id": start_id,
            "type": "data",
            "payload": {
                "data": {
                    "onUpdatePrice": {
                        "address": TEST_TOKEN,
                        "networkId": TEST_NETWORK_ID,
                        "priceUsd": 3120.5,
                        "timestamp": 1_700_000_000
                    }
                }
            }
        }),
    )
    .await?;
    send_server_frame(
        socket,
        json!({
            "id": start_id,
            "type": "error",
            "payload": {"errors": [{"message": "rate limited"}]}
        }),
    )
    .await?;

    let stop_id = match recv_client_frame(socket).await? {
        ClientFrame::Stop { id } => id,
        other => {
            return Err(format!(
                "expected second client frame to be stop, got {other:?}"
            ));
        }
    };

    Ok(WsObserved {
        start_id,
        query: query.query,
        variables: query.variables,
        authorization: payload.extensions.authorization.authorization,
        host: payload.extensions.authorization.host,
        stop_id,
    })
}

async fn recv_client_frame(socket: &mut WebSocket) -> Result<ClientFrame, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return ClientFrame::from_text(text.as_ref())
                    .map_err(|err| format!("failed to decode client frame: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected client frame".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

async fn send_server_frame(socket: &mut WebSocket, frame: Value) -> Result<(), String> {
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .map_err(|err| format!("failed to send server frame: {err}"))
}

async fn drain_until_close(socket: &mut WebSocket) {
    while let Some(Ok(message)) = socket.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
