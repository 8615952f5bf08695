//! Companion target server: a tiny JSON CRUD API for the load generator to hit.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

pub mod store;

use store::ItemStore;

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct AppState {
    started: Instant,
    items: ItemStore,
}

impl AppState {
    pub fn new(capacity: usize) -> Self {
        Self {
            started: Instant::now(),
            items: ItemStore::new(capacity),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/items", get(handle_list_items).post(handle_create_item))
        .route("/api/items/:id", get(handle_get_item))
        .route("/api/status", get(handle_status))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, capacity: usize, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(Arc::new(AppState::new(capacity)));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn run(addr: SocketAddr, capacity: usize) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, capacity, "test server listening");
    println!("Test server running on http://{}", local);
    serve(listener, capacity, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down test server");
    })
    .await
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime": state.started.elapsed().as_secs_f64(),
    }))
}

async fn handle_status() -> Json<Value> {
    Json(json!({
        "status": "operational",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn handle_list_items(State(state): State<Arc<AppState>>) -> Json<Value> {
    let items = state.items.list();
    Json(json!({ "count": items.len(), "items": items }))
}

async fn handle_create_item(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let fields = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) => return error(StatusCode::BAD_REQUEST, "Request body must be a JSON object"),
        Err(e) => return error(StatusCode::BAD_REQUEST, &format!("Invalid JSON body: {}", e)),
    };
    (StatusCode::CREATED, Json(state.items.insert(fields))).into_response()
}

async fn handle_get_item(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match id.parse::<u64>().ok().and_then(|id| state.items.get(id)) {
        Some(item) => Json(item).into_response(),
        None => error(StatusCode::NOT_FOUND, "Item not found"),
    }
}

/// Start a server on an ephemeral localhost port for tests.
#[cfg(test)]
pub(crate) async fn spawn_ephemeral(capacity: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, capacity, std::future::pending()));
    addr
}
