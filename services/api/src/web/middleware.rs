//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use textlift_core::ports::PortError;
use textlift_core::ServiceError;
use tracing::{error, warn};

use crate::web::problem::ApiFailure;
use crate::web::state::AppState;

/// Name of the cookie carrying the auth session id.
pub const SESSION_COOKIE: &str = "session";

/// Middleware that validates the auth session cookie and extracts the user_id.
///
/// If valid, inserts the user_id into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiFailure> {
    let unauthorized = || ApiFailure(ServiceError::Unauthorized("Authentication required".to_string()));

    // 1. Extract cookie header
    let cookie_header = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;

    // 2. Parse session ID from cookie
    let auth_session_id = session_from_cookies(cookie_header).ok_or_else(unauthorized)?;

    // 3. Validate auth session in the database, get user_id
    let user_id = match state.db.validate_auth_session(auth_session_id).await {
        Ok(user_id) => user_id,
        Err(PortError::Unauthorized) | Err(PortError::NotFound(_)) => {
            warn!("Rejected unknown or expired auth session");
            return Err(unauthorized());
        }
        Err(e) => {
            error!("Failed to validate auth session: {:?}", e);
            return Err(ApiFailure(e.into()));
        }
    };

    // 4. Insert user_id into request extensions
    req.extensions_mut().insert(user_id);

    // 5. Continue to the handler
    Ok(next.run(req).await)
}

fn session_from_cookies(cookie_header: &str) -> Option<&str> {
    cookie_header.split(';').find_map(|c| {
        let (name, value) = c.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_session_cookie_among_others() {
        assert_eq!(session_from_cookies("theme=dark; session=abc123"), Some("abc123"));
        assert_eq!(session_from_cookies("session=xyz"), Some("xyz"));
        assert_eq!(session_from_cookies("mysession=nope; session="), None);
        assert_eq!(session_from_cookies("theme=dark"), None);
    }
}
