//! Scripted transport and helpers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::ApiClient;
use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::session::LoginSurface;
use crate::transport::{ApiRequest, ApiResponse, Method, Transport};

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub token: Option<String>,
}

type Handler = dyn Fn(&ApiRequest, Option<&str>) -> ApiResponse + Send + Sync;

pub(crate) struct MockTransport {
    handler: Box<Handler>,
    latency: Duration,
    calls: Mutex<Vec<RecordedCall>>,
    completed: AtomicUsize,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&ApiRequest, Option<&str>) -> ApiResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.path == path)
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls_to(path).len()
    }

    /// Exchanges that ran to the end (not cancelled during latency).
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method.clone(),
            path: request.path.clone(),
            body: request.body.clone(),
            token: access_token.map(str::to_string),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let response = (self.handler)(request, access_token);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    }
}

#[derive(Default)]
pub(crate) struct RecordingLoginSurface {
    redirects: AtomicUsize,
}

impl RecordingLoginSurface {
    pub fn redirects(&self) -> usize {
        self.redirects.load(Ordering::SeqCst)
    }
}

impl LoginSurface for RecordingLoginSurface {
    fn is_active(&self) -> bool {
        false
    }

    fn redirect_to_login(&self) {
        self.redirects.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn json_response(status: u16, body: Value) -> ApiResponse {
    ApiResponse::new(status, body.to_string())
}

/// Client over `transport` with a logged-in session (`token` / `refresh`).
pub(crate) fn client_with(transport: Arc<MockTransport>, config: ClientConfig) -> ApiClient {
    let credentials = CredentialStore::in_memory();
    credentials.replace(&calibra_core::session::CredentialPair::new("token", "refresh"));
    ApiClient::builder(config)
        .transport(transport)
        .credentials(credentials)
        .build()
        .unwrap()
}
