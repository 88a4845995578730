use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, TokenPair};

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<TokenPair>> {
    let pair = state
        .login(&request.username, &request.password)
        .ok_or_else(|| ApiError::unauthorized("Invalid username or password"))?;
    info!(user = %request.username, "login");
    Ok(Json(pair))
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    match state.refresh(&request.refresh_token) {
        Some(pair) => Ok(Json(pair)),
        None => {
            warn!("refresh with unknown or reused token");
            Err(ApiError::unauthorized("Invalid or expired refresh token"))
        }
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
}
