//! Route modules for the attachment server

pub mod health;
pub mod upload;

use axum::Router;

use crate::state::AppState;

/// Assemble the application routes
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/api/attachments", upload::router(state.config().upload.max_chunk_size))
        .with_state(state)
}
