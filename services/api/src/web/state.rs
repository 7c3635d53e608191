//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use crate::web::rate_limit::ClientRateLimiter;
use std::sync::Arc;
use textlift_core::{DatabaseService, DocumentService, UploadService};

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub config: Arc<Config>,
    pub uploads: Arc<UploadService>,
    pub documents: Arc<DocumentService>,
    pub rate_limiter: Arc<ClientRateLimiter>,
}
