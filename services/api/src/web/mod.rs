pub mod documents;
pub mod middleware;
pub mod problem;
pub mod rate_limit;
pub mod rest;
pub mod state;
pub mod upload;

use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

pub use middleware::require_auth;
use state::AppState;

/// Room for multipart framing on top of the largest accepted file.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Builds the `/api/v1` router with authentication, rate limiting and problem rendering.
///
/// The caller adds CORS and the Swagger UI. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the rate limiter
/// can key on the peer address.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = usize::try_from(state.config.max_file_bytes.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/upload", post(upload::create_upload_handler))
        .route("/upload/{upload_id}/file", post(upload::upload_file_handler))
        .route("/upload/{upload_id}/finalize", post(upload::finalize_upload_handler))
        .route("/upload/{upload_id}/status", get(upload::upload_status_handler))
        .route("/documents/uploads", get(documents::list_uploads_handler))
        .route("/documents/uploads/{document_id}", delete(documents::delete_upload_handler))
        .route("/documents/{document_id}/status", get(documents::document_status_handler))
        .route("/annotations/{document_id}", get(documents::annotations_handler))
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .nest("/api/v1", protected_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum_middleware::from_fn_with_state(state.clone(), rate_limit::rate_limit))
        .layer(axum_middleware::from_fn(problem::render_problems))
        .with_state(state)
}
