use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use calibra_core::locks::{AcquireResponse, LockTarget};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

async fn acquire(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(target): Json<LockTarget>,
) -> ApiResult<Json<AcquireResponse>> {
    let result = state
        .locks()
        .acquire(&target, &user.username, state.config.lock_ttl, Instant::now());
    match result {
        Ok(entry) => {
            debug!(record = %target, holder = %entry.holder, "lock held");
            Ok(Json(AcquireResponse {
                status: "locked".to_string(),
                locked_by: Some(entry.holder),
            }))
        }
        Err(holder) => {
            info!(record = %target, holder = %holder, requested_by = %user.username, "lock conflict");
            Err(ApiError::Locked { locked_by: holder })
        }
    }
}

async fn release(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(target): Json<LockTarget>,
) -> ApiResult<Json<Value>> {
    let released = state.locks().release(&target, &user.username);
    debug!(record = %target, released, "lock release");
    Ok(Json(json!({
        "status": if released { "released" } else { "not_held" }
    })))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/locks/acquire", post(acquire))
        .route("/locks/release", post(release))
}
