//! Mock openHAB server
//!
//! Accepts item commands at /rest/items/{item} and serves linked pages at
//! /rest/sitemaps/{sitemap}/{page}. Every request is recorded.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// One request as the server saw it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub body: String,
    pub content_type: Option<String>,
    pub authorization: Option<String>,
}

struct MockState {
    requests: Vec<RecordedRequest>,
    command_status: StatusCode,
}

type SharedState = Arc<RwLock<MockState>>;

pub struct MockOpenHabServer {
    addr: SocketAddr,
    state: SharedState,
    handle: JoinHandle<()>,
}

impl MockOpenHabServer {
    /// Start a mock server on a random port
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockState {
            requests: Vec::new(),
            command_status: StatusCode::OK,
        }));

        let app = Router::new()
            .route("/rest/items/{item}", post(handle_command))
            .route("/rest/sitemaps/{sitemap}/{page}", get(handle_page))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Status returned for item commands from now on
    pub async fn set_command_status(&self, status: StatusCode) {
        self.state.write().await.command_status = status;
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.read().await.requests.clone()
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

fn record(headers: &HeaderMap, path: String, body: String) -> RecordedRequest {
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    RecordedRequest {
        path,
        body,
        content_type: header_str(header::CONTENT_TYPE),
        authorization: header_str(header::AUTHORIZATION),
    }
}

async fn handle_command(
    State(state): State<SharedState>,
    Path(item): Path<String>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let mut state = state.write().await;
    state
        .requests
        .push(record(&headers, format!("/rest/items/{item}"), body));
    state.command_status
}

async fn handle_page(
    State(state): State<SharedState>,
    Path((sitemap, page)): Path<(String, String)>,
    headers: HeaderMap,
) -> Json<Value> {
    let path = format!("/rest/sitemaps/{sitemap}/{page}");
    state
        .write()
        .await
        .requests
        .push(record(&headers, path.clone(), String::new()));

    Json(json!({
        "id": page,
        "title": "Ground Floor [3 lights on]",
        "icon": "groundfloor",
        "link": path,
    }))
}
