use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use i3x_sdk::api::{ApiError, I3xClient};
use i3x_sdk::model::{DeliveryBatch, SubscriptionId};
use i3x_sdk::retry::ReconnectPolicy;
use i3x_sdk::subscription::{
    channel_sink, DeliveryMode, SessionError, SessionOptions, SessionState, Subscription,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_API_KEY: &str = "test-api-key";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct MockState {
    expected_api_key: String,
    close_first_stream: bool,
    stream_opens: Arc<AtomicUsize>,
    registered: Arc<Mutex<Vec<Value>>>,
}

impl MockState {
    fn new(close_first_stream: bool) -> Self {
        Self {
            expected_api_key: TEST_API_KEY.to_string(),
            close_first_stream,
            stream_opens: Arc::default(),
            registered: Arc::default(),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == self.expected_api_key)
    }
}

struct MockServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MockServer {
    fn client(&self) -> I3xClient {
        I3xClient::with_api_key(
            &format!("http://{}", self.addr),
            SecretString::new(TEST_API_KEY.to_string()),
        )
        .expect("build client for mock server")
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[tokio::test]
async fn subscription_rest_calls_and_value_dialects() {
    let state = MockState::new(false);
    let server = spawn_server(mock_router(state.clone())).await;

    let mut subscription = Subscription::create(server.client())
        .await
        .expect("create subscription");
    assert_eq!(subscription.id().as_str(), "7");

    subscription
        .register(&["pump", "valve"], Some(2))
        .await
        .expect("register points");
    let points: Vec<_> = subscription.points().collect();
    assert_eq!(points, ["pump", "valve"]);
    let registered = state.registered.lock().await.clone();
    assert_eq!(
        registered,
        [json!({"elementIds": ["pump", "valve"], "maxDepth": 2})]
    );

    let values = server
        .client()
        .get_values(&["pump", "valve"], 1)
        .await
        .expect("read values");
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].element_id, "pump");
    assert_eq!(values[0].value, json!(1.5));
    assert_eq!(values[0].quality.as_deref(), Some("Good"));

    let history = server
        .client()
        .get_history("pump", None, None, 1)
        .await
        .expect("read history");
    assert_eq!(history.element_id, "pump");
    assert_eq!(history.value, json!([]));

    subscription.delete().await.expect("delete subscription");
}

#[tokio::test]
async fn transport_errors_carry_status_and_body() {
    let server = spawn_server(mock_router(MockState::new(false))).await;

    let err = server
        .client()
        .get_namespaces()
        .await
        .expect_err("namespaces route is down");
    match err {
        ApiError::Transport { status, ref body } => {
            assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE);
            let body: Value = serde_json::from_str(body).expect("raw json body");
            assert_eq!(body, json!({"detail": "maintenance window", "code": 503}));
        }
        ref other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.summary().as_deref(), Some("maintenance window"));
    assert!(!server.client().test_connection().await);
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let addr = listener.local_addr().expect("read listener address");
    drop(listener);

    let client = I3xClient::new(&format!("http://{addr}")).expect("client");
    let err = client
        .get_namespaces()
        .await
        .expect_err("nothing listens on the port");
    assert!(matches!(err, ApiError::Network(_)), "unexpected error: {err}");
    assert_eq!(err.status(), None);
    assert!(!client.test_connection().await);
}

#[tokio::test]
async fn push_session_delivers_stream_frames() {
    let state = MockState::new(false);
    let server = spawn_server(mock_router(state.clone())).await;
    let subscription = Subscription::attach(server.client(), SubscriptionId::from(7u64));

    let (sink, mut rx) = channel_sink();
    let mut session = subscription.live_session(SessionOptions::default(), sink, |_: SessionError| {});
    session.start();

    let batch = recv_batch(&mut rx).await;
    assert_eq!(batch.updates()[0].element_id, "pump");
    assert_eq!(batch.updates()[0].value, json!(0));
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(state.stream_opens.load(Ordering::SeqCst), 1);

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn push_session_reconnects_after_server_closes_stream() {
    let state = MockState::new(true);
    let server = spawn_server(mock_router(state.clone())).await;
    let subscription = Subscription::attach(server.client(), SubscriptionId::from(7u64));

    let (sink, mut rx) = channel_sink();
    let options = SessionOptions {
        reconnect: ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
        },
        ..SessionOptions::default()
    };
    let mut session = subscription.live_session(options, sink, |_: SessionError| {});
    session.start();

    let first = recv_batch(&mut rx).await;
    let second = recv_batch(&mut rx).await;
    assert_eq!(first.updates()[0].value, json!(0));
    assert_eq!(second.updates()[0].value, json!(1));
    assert_eq!(state.stream_opens.load(Ordering::SeqCst), 2);
    assert_eq!(session.reconnect_attempts(), 0);

    session.stop();
}

#[tokio::test]
async fn push_session_gives_up_when_stream_is_rejected() {
    let server = spawn_server(mock_router(MockState::new(false))).await;
    let client = I3xClient::new(&format!("http://{}", server.addr)).expect("client");
    let subscription = Subscription::attach(client, SubscriptionId::from(7u64));

    let (error_tx, mut error_rx) = tokio::sync::mpsc::unbounded_channel();
    let options = SessionOptions {
        reconnect: ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
        },
        ..SessionOptions::default()
    };
    let mut session = subscription.live_session(
        options,
        |_: DeliveryBatch| panic!("no batch expected"),
        move |error: SessionError| {
            let _ = error_tx.send(error);
        },
    );
    session.start();

    let error = timeout(RECV_TIMEOUT, error_rx.recv())
        .await
        .expect("timed out waiting for session error")
        .expect("error channel closed");
    assert!(matches!(
        error,
        SessionError::SubscriptionExhausted { attempts: 2 }
    ));
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn poll_session_delivers_sync_results() {
    let server = spawn_server(mock_router(MockState::new(false))).await;
    let subscription = Subscription::attach(server.client(), SubscriptionId::from(7u64));

    let (sink, mut rx) = channel_sink();
    let options = SessionOptions {
        mode: DeliveryMode::Poll,
        poll_interval: Duration::from_millis(50),
        ..SessionOptions::default()
    };
    let mut session = subscription.live_session(options, sink, |_: SessionError| {});
    session.start();

    for _ in 0..2 {
        let batch = recv_batch(&mut rx).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.updates()[0].element_id, "pump");
        assert_eq!(batch.updates()[0].value, json!(3));
    }
    assert_eq!(session.state(), SessionState::Open);

    session.stop();
}

async fn recv_batch(rx: &mut tokio::sync::mpsc::UnboundedReceiver<DeliveryBatch>) -> DeliveryBatch {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for batch")
        .expect("batch channel closed")
}

fn mock_router(state: MockState) -> Router {
    Router::new()
        .route("/namespaces", get(namespaces_handler))
        .route("/objects/value", post(values_handler))
        .route("/objects/history", post(history_handler))
        .route("/subscriptions", post(create_handler))
        .route("/subscriptions/7", delete(delete_handler))
        .route("/subscriptions/7/register", post(register_handler))
        .route("/subscriptions/7/sync", post(sync_handler))
        .route("/subscriptions/7/stream", get(stream_handler))
        .with_state(state)
}

async fn namespaces_handler() -> impl IntoResponse {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"detail": "maintenance window", "code": 503})),
    )
}

async fn values_handler(Json(payload): Json<Value>) -> Json<Value> {
    assert_eq!(payload["elementIds"], json!(["pump", "valve"]));
    Json(json!({"results": [
        {"elementId": "pump", "success": true, "data": {"value": 1.5, "quality": "Good"}},
        {"elementId": "valve", "success": false, "error": "not found"}
    ]}))
}

async fn history_handler() -> Json<Value> {
    Json(json!({"results": [{"elementId": "pump", "success": false}]}))
}

async fn create_handler(State(state): State<MockState>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"subscriptionId": 7, "message": "created"})).into_response()
}

async fn delete_handler() -> StatusCode {
    StatusCode::OK
}

async fn register_handler(
    State(state): State<MockState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    state.registered.lock().await.push(payload);
    Json(json!({"message": "registered"}))
}

async fn sync_handler() -> Json<Value> {
    Json(json!({
        "pump": {"data": [{"value": 3, "quality": "Good"}]},
        "idle": {"data": []}
    }))
}

async fn stream_handler(State(state): State<MockState>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "missing api key"})),
        )
            .into_response();
    }

    let open = state.stream_opens.fetch_add(1, Ordering::SeqCst);
    let frame = json!([{"pump": {"data": [{"value": open}]}}]).to_string();
    let events = stream::iter([Ok::<_, Infallible>(Event::default().data(frame))]);
    if open == 0 && state.close_first_stream {
        Sse::new(events.boxed()).into_response()
    } else {
        Sse::new(events.chain(stream::pending()).boxed()).into_response()
    }
}

async fn spawn_server(app: Router) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server should run");
    });
    MockServer { addr, task }
}
