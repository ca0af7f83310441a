use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use neutrino_sdk::config::AppConfig;
use neutrino_sdk::data_api::{DataApiClient, DataApiClientOptions, DataApiError};
use neutrino_sdk::object::RemoteObject;
use neutrino_sdk::retry::RetryPolicy;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};

const TEST_APP: &str = "app1";
const TEST_TOKEN: &str = "test-token";

#[derive(Clone)]
struct ApiState {
    records: Arc<Mutex<HashMap<String, Value>>>,
    // Number of requests answered with 503 before serving normally.
    flaky: Arc<AtomicUsize>,
    hits: Arc<AtomicUsize>,
}

impl ApiState {
    fn new(flaky: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            flaky: Arc::new(AtomicUsize::new(flaky)),
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn client(addr: SocketAddr) -> DataApiClient {
    let config = AppConfig::new(TEST_APP, SecretString::new(TEST_TOKEN.to_string()))
        .with_api_host(format!("http://{addr}/"));
    let options = DataApiClientOptions {
        retry_policy: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            jitter: Duration::ZERO,
        },
        ..DataApiClientOptions::default()
    };
    DataApiClient::with_options(config, options).expect("build data api client")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_object_get_update_reset_remove() {
    let state = ApiState::new(0);
    state.records.lock().await.insert(
        "todos/x1".to_string(),
        json!({"id": "x1", "title": "a", "meta": {"owner": "u1"}}),
    );
    let (addr, shutdown_tx, server_task) = spawn_server(state.clone()).await;

    let mut remote = RemoteObject::new(client(addr), "x1", "todos");
    remote.object_mut().set("local", json!(true));

    let object = remote.get().await.expect("get");
    assert_eq!(object.get("title"), Some(&json!("a")));
    assert_eq!(object.get("local"), Some(&json!(true)));

    remote.object_mut().set("title", json!("b"));
    remote.update().await.expect("update");
    assert_eq!(
        state.records.lock().await.get("todos/x1"),
        Some(&json!({"id": "x1", "title": "b", "meta": {"owner": "u1"}, "local": true}))
    );

    state
        .records
        .lock()
        .await
        .insert("todos/x1".to_string(), json!({"id": "x1", "title": "c"}));
    let object = remote.reset().await.expect("reset");
    assert_eq!(object.get("title"), Some(&json!("c")));
    assert!(object.get("local").is_none());
    assert!(object.get("meta").is_none());

    remote.remove().await.expect("remove");
    assert!(state.records.lock().await.get("todos/x1").is_none());

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock api task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_errors_are_retried_and_client_errors_are_not() {
    let state = ApiState::new(2);
    state
        .records
        .lock()
        .await
        .insert("todos/x1".to_string(), json!({"id": "x1"}));
    let (addr, shutdown_tx, server_task) = spawn_server(state.clone()).await;
    let api = client(addr);

    let record = api.get("todos", "x1").await.expect("third attempt succeeds");
    assert_eq!(record, json!({"id": "x1"}));
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);

    let missing = api.get("todos", "nope").await.expect_err("missing record");
    match &missing {
        DataApiError::HttpStatus { status, body } => {
            assert_eq!(*status, StatusCode::NOT_FOUND);
            assert_eq!(body, "record not found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!missing.is_retryable());
    assert_eq!(state.hits.load(Ordering::SeqCst), 4);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock api task should join");
}

async fn record_handler(
    State(state): State<ApiState>,
    Path((app, data_type, id)): Path<(String, String, String)>,
    headers: HeaderMap,
    method: axum::http::Method,
    body: Bytes,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);

    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TEST_TOKEN}"));
    if !authorized || app != TEST_APP {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        );
    }

    let remaining = state.flaky.load(Ordering::SeqCst);
    if remaining > 0 {
        state.flaky.store(remaining - 1, Ordering::SeqCst);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"message": "warming up"})),
        );
    }

    let key = format!("{data_type}/{id}");
    let mut records = state.records.lock().await;
    match method {
        axum::http::Method::GET => match records.get(&key) {
            Some(record) => (StatusCode::OK, Json(record.clone())),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "record not found"})),
            ),
        },
        axum::http::Method::PUT => {
            let record: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            records.insert(key, record.clone());
            (StatusCode::OK, Json(record))
        }
        axum::http::Method::DELETE => match records.remove(&key) {
            Some(_) => (StatusCode::OK, Json(json!({"deleted": id}))),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "record not found"})),
            ),
        },
        _ => (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({"error": "method not allowed"})),
        ),
    }
}

async fn spawn_server(
    state: ApiState,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route(
            "/{app}/data/{data_type}/{id}",
            get(record_handler).put(record_handler).delete(record_handler),
        )
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock api listener");
    let addr = listener
        .local_addr()
        .expect("read mock api listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock api should run");
    });
    (addr, shutdown_tx, task)
}
