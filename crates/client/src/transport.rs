//! Wire-level request/response types and the reqwest transport.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

pub use reqwest::Method;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

const MAX_LOG_BODY_CHARS: usize = 512;

/// Response header set by the server when the user must come back to a record after login.
pub const REDIRECT_REQUIRED_HEADER: &str = "x-redirect-required";
/// Record id that goes with [`REDIRECT_REQUIRED_HEADER`].
pub const REDIRECT_RECORD_ID_HEADER: &str = "x-redirect-record-id";

/// How hard the caller needs the request to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Cancelled together with the caller.
    #[default]
    Standard,
    /// Keeps running after the caller is dropped (teardown calls such as lock release).
    BestEffort,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub delivery: Delivery,
    /// Set once the request has been replayed after an authorization failure.
    pub retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            delivery: Delivery::Standard,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.delivery = Delivery::BestEffort;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parse the body; an empty body parses as JSON `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let body = if self.body.trim().is_empty() {
            "null"
        } else {
            self.body.as_str()
        };
        serde_json::from_str(body).map_err(|e| {
            log::error!(
                "Failed to deserialize response. Body: {}, Error: {}",
                truncate(&self.body),
                e
            );
            ClientError::api(self.status, format!("Failed to parse response: {}", e))
        })
    }

    /// Turns a non-2xx response into an API error.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(self.to_error())
    }

    pub fn to_error(&self) -> ClientError {
        if let Ok(error) = serde_json::from_str::<ApiErrorBody>(&self.body) {
            let message = match (error.code, error.message, error.error) {
                (Some(code), Some(message), _) => Some(format!("{}: {}", code, message)),
                (_, Some(message), _) => Some(message),
                (_, _, Some(error)) => Some(error),
                _ => None,
            };
            if let Some(message) = message {
                return ClientError::api(self.status, message);
            }
        }
        ClientError::api(self.status, format!("Request failed: {}", truncate(&self.body)))
    }

    /// Record id to reopen after login, when the server asked for it.
    pub fn redirect_record_id(&self) -> Option<&str> {
        let required = self
            .header(REDIRECT_REQUIRED_HEADER)
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(false);
        if !required {
            return None;
        }
        self.header(REDIRECT_RECORD_ID_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

fn truncate(body: &str) -> String {
    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    preview
}

/// Executes one HTTP exchange. Status codes are returned, not interpreted.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &ApiRequest, access_token: Option<&str>)
        -> Result<ApiResponse>;
}

/// Transport over a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    /// Create headers for an API request.
    fn headers(&self, token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ClientError::auth("Invalid access token format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        Ok(headers)
    }

    fn log_response(method: &Method, path: &str, status: u16, body: &str) {
        if (200..300).contains(&status) {
            debug!("API {} {} -> {}", method, path, status);
            return;
        }
        debug!("API {} {} -> {}: {}", method, path, status, truncate(body));
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse> {
        let url = format!(
            "{}/{}",
            self.base_url,
            request.path.trim_start_matches('/')
        );

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(self.headers(access_token)?);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect::<HashMap<_, _>>();
        let body = response.text().await?;
        Self::log_response(&request.method, &request.path, status, &body);

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
