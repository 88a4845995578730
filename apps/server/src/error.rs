use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub const REDIRECT_REQUIRED_HEADER: &str = "x-redirect-required";
pub const REDIRECT_RECORD_ID_HEADER: &str = "x-redirect-record-id";

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Unauthorized {
        message: String,
        /// Record the user should land on again after signing in.
        record_id: Option<String>,
    },

    #[error("Record is locked by {locked_by}")]
    Locked { locked_by: String },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
            record_id: None,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Locked { .. } => "LOCKED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Locked { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(message) = &self {
            tracing::error!(error = %message, "request failed");
        }

        let body = match &self {
            Self::Locked { locked_by } => json!({
                "code": self.code(),
                "message": self.to_string(),
                "locked_by": locked_by,
            }),
            _ => json!({ "code": self.code(), "message": self.to_string() }),
        };
        let mut response = (self.status(), Json(body)).into_response();

        if let Self::Unauthorized {
            record_id: Some(record_id),
            ..
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(record_id) {
                let headers = response.headers_mut();
                headers.insert(REDIRECT_REQUIRED_HEADER, HeaderValue::from_static("true"));
                headers.insert(REDIRECT_RECORD_ID_HEADER, value);
            }
        }
        response
    }
}
