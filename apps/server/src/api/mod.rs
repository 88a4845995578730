//! HTTP surface of the mock lab backend.

mod auth;
mod drafts;
mod locks;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::Router;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(auth::router())
        .merge(locks::router())
        .merge(drafts::router())
}

/// Record id of a `/drafts/{kind}/{id}...` path, used as the post-login redirect target.
fn record_id_from_path(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some("drafts"), Some(_), Some(id)) if !id.is_empty() => Some(id.to_string()),
        _ => None,
    }
}

/// User behind the `Authorization: Bearer` access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let reject = |message: &str| ApiError::Unauthorized {
            message: message.to_string(),
            record_id: record_id_from_path(parts.uri.path()),
        };

        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| reject("Missing bearer token"))?;

        let username = state
            .authenticate(token)
            .ok_or_else(|| reject("Invalid or expired token"))?;

        Ok(AuthUser { username })
    }
}
