use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use calibra_core::calibration::{evaluate, ReadingSheet, SheetEvaluation};
use calibra_core::drafts::DraftModel;
use serde_json::Value;
use tracing::{debug, info};

use super::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn evaluate_payload(payload: &Value) -> ApiResult<SheetEvaluation> {
    let sheet = ReadingSheet::from_stored(payload)
        .map_err(|e| ApiError::BadRequest(format!("Invalid reading sheet: {}", e)))?;
    Ok(evaluate(&sheet))
}

/// Stored form: the submitted payload with the computed values written into each step.
fn with_evaluation(mut payload: Value, evaluation: &SheetEvaluation) -> ApiResult<Value> {
    let computed =
        serde_json::to_value(evaluation).map_err(|e| ApiError::Internal(e.to_string()))?;
    if let (Some(steps), Some(results)) = (
        payload.get_mut("steps").and_then(Value::as_array_mut),
        computed.get("steps").and_then(Value::as_array),
    ) {
        for (step, result) in steps.iter_mut().zip(results) {
            if let (Some(step), Some(result)) = (step.as_object_mut(), result.as_object()) {
                for (key, value) in result {
                    step.insert(key.clone(), value.clone());
                }
            }
        }
    }
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            "max_error".to_string(),
            computed.get("max_error").cloned().unwrap_or(Value::Null),
        );
    }
    Ok(payload)
}

async fn load_draft(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state
        .draft(&kind, &id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No draft for {}/{}", kind, id)))
}

async fn save_draft(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((kind, id)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<SheetEvaluation>> {
    let evaluation = evaluate_payload(&payload)?;
    state.store_draft(&kind, &id, with_evaluation(payload, &evaluation)?);
    info!(record = %format!("{}/{}", kind, id), user = %user.username, "draft saved");
    Ok(Json(evaluation))
}

async fn calculate(
    _user: AuthUser,
    Path((kind, id)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<SheetEvaluation>> {
    debug!(record = %format!("{}/{}", kind, id), "calculate");
    Ok(Json(evaluate_payload(&payload)?))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drafts/{kind}/{id}", get(load_draft))
        .route("/drafts/{kind}/{id}/draft", post(save_draft))
        .route("/drafts/{kind}/{id}/calculate", post(calculate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stored_draft_carries_computed_values() {
        let payload = json!({"steps": [{"nominal": 10, "readings": [9, 11]}]});
        let evaluation = evaluate_payload(&payload).unwrap();
        let stored = with_evaluation(payload, &evaluation).unwrap();

        assert_eq!(stored["steps"][0]["readings"], json!([9, 11]));
        assert_eq!(stored["steps"][0]["mean"], json!(10.0));
        assert_eq!(stored["max_error"], json!(0.0));
    }

    #[test]
    fn malformed_sheet_is_rejected() {
        assert!(matches!(
            evaluate_payload(&json!({"steps": "nope"})),
            Err(ApiError::BadRequest(_))
        ));
    }
}
