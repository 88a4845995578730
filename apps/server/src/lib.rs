//! Mock Calibra lab backend: auth with rotating refresh tokens, advisory record locks and
//! reading-sheet drafts.

pub mod api;
pub mod config;
pub mod error;
pub mod state;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use state::AppState;

pub fn app(state: Arc<AppState>) -> Router {
    api::router().with_state(state)
}

/// Serves the API on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    axum::serve(listener, app(state)).await
}
