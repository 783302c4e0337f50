//! Throwaway HTTP servers shared by the unit tests.

use crate::models::Product;
use axum::{
    Json, Router,
    body::Bytes,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    format!("http://{addr}")
}

/// An address nothing listens on.
pub async fn unused_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

#[derive(Default)]
struct MockState {
    hits: HashMap<&'static str, u32>,
    status_script: VecDeque<Value>,
    detected: Vec<String>,
    products: Vec<Product>,
    upload_rejection: Option<String>,
    upload_failures: u32,
    match_failures: u32,
    last_match: Option<Vec<String>>,
}

/// Scriptable stand-in for the processing backend.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self, route: &str) -> u32 {
        self.lock().hits.get(route).copied().unwrap_or(0)
    }

    /// Status bodies served in order; once exhausted a completed status is served.
    pub fn script_status(&self, bodies: Vec<Value>) {
        self.lock().status_script = bodies.into();
    }

    pub fn set_detected(&self, objects: &[&str]) {
        self.lock().detected = objects.iter().map(|o| o.to_string()).collect();
    }

    pub fn set_products(&self, products: Vec<Product>) {
        self.lock().products = products;
    }

    pub fn reject_uploads(&self, message: &str) {
        self.lock().upload_rejection = Some(message.to_string());
    }

    /// The next `times` uploads answer with HTTP 500.
    pub fn fail_uploads(&self, times: u32) {
        self.lock().upload_failures = times;
    }

    /// The next `times` product matches answer with HTTP 500.
    pub fn fail_matches(&self, times: u32) {
        self.lock().match_failures = times;
    }

    pub fn last_match_request(&self) -> Option<Vec<String>> {
        self.lock().last_match.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    fn hit(&self, route: &'static str) {
        *self.lock().hits.entry(route).or_default() += 1;
    }

    fn upload_reply(&self) -> Response {
        let mut state = self.lock();
        if state.upload_failures > 0 {
            state.upload_failures -= 1;
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        match &state.upload_rejection {
            Some(message) => Json(json!({"success": false, "error": message})).into_response(),
            None => Json(json!({"success": true, "videoId": "vid-1"})).into_response(),
        }
    }

    pub fn router(&self) -> Router {
        let health = self.clone();
        let upload = self.clone();
        let upload_file = self.clone();
        let detect = self.clone();
        let status = self.clone();
        let matcher = self.clone();
        Router::new()
            .route(
                "/health",
                get(move || {
                    let mock = health.clone();
                    async move {
                        mock.hit("health");
                        Json(json!({"status": "ok"}))
                    }
                }),
            )
            .route(
                "/videos/upload",
                post(move |_body: Bytes| {
                    let mock = upload.clone();
                    async move {
                        mock.hit("upload");
                        mock.upload_reply()
                    }
                }),
            )
            .route(
                "/videos/upload-file",
                post(move |_body: Bytes| {
                    let mock = upload_file.clone();
                    async move {
                        mock.hit("upload-file");
                        mock.upload_reply()
                    }
                }),
            )
            .route(
                "/videos/{id}/detect-objects",
                post(move |Path(_id): Path<String>| {
                    let mock = detect.clone();
                    async move {
                        mock.hit("detect");
                        let objects = mock.lock().detected.clone();
                        Json(json!({"success": true, "objects": objects}))
                    }
                }),
            )
            .route(
                "/videos/{id}/status",
                get(move |Path(_id): Path<String>| {
                    let mock = status.clone();
                    async move {
                        mock.hit("status");
                        let mut state = mock.lock();
                        let detected = state.detected.clone();
                        let body = state.status_script.pop_front().unwrap_or_else(|| {
                            json!({
                                "success": true,
                                "status": "completed",
                                "progress": 100,
                                "detectedObjects": detected,
                            })
                        });
                        Json(body)
                    }
                }),
            )
            .route(
                "/products/match",
                post(move |Json(body): Json<Value>| {
                    let mock = matcher.clone();
                    async move {
                        mock.hit("match");
                        let objects = body["objects"]
                            .as_array()
                            .map(|items| {
                                items
                                    .iter()
                                    .filter_map(|v| v.as_str().map(str::to_string))
                                    .collect::<Vec<_>>()
                            })
                            .unwrap_or_default();
                        let mut state = mock.lock();
                        state.last_match = Some(objects);
                        if state.match_failures > 0 {
                            state.match_failures -= 1;
                            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                        }
                        Json(json!({"success": true, "products": state.products})).into_response()
                    }
                }),
            )
    }
}

/// Feedback sink that keeps every event for inspection.
#[derive(Default)]
pub struct MemoryFeedback {
    events: Mutex<Vec<crate::matching::FeedbackEvent>>,
}

impl MemoryFeedback {
    pub fn events(&self) -> Vec<crate::matching::FeedbackEvent> {
        self.events.lock().expect("feedback lock").clone()
    }
}

#[async_trait::async_trait]
impl crate::matching::FeedbackSink for MemoryFeedback {
    async fn record(&self, event: &crate::matching::FeedbackEvent) {
        self.events.lock().expect("feedback lock").push(event.clone());
    }
}
