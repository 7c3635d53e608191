//! services/api/src/web/problem.rs
//!
//! Problem-style error responses.
//!
//! Handlers return `ApiFailure`, which only records the error on the response.
//! The `render_problems` middleware, which knows the request path, turns it into
//! the `application/problem+json` body.

use axum::{
    body::to_bytes,
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use textlift_core::ServiceError;
use tracing::{error, warn};
use utoipa::ToSchema;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// Detail sent for every unclassified failure; the cause is only logged.
pub const INTERNAL_DETAIL: &str = "Unknown internal server error.";

/// The body of every synchronous error response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub path: String,
}

/// Error half of every handler result.
#[derive(Debug)]
pub struct ApiFailure(pub ServiceError);

impl From<ServiceError> for ApiFailure {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

/// Status and public detail, attached to the response until the path is known.
#[derive(Debug, Clone)]
struct PendingProblem {
    status: StatusCode,
    detail: String,
}

pub fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ServiceError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ServiceError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let detail = match &self.0 {
            ServiceError::Internal(cause) => {
                error!(error = %cause, "Internal error while handling request");
                INTERNAL_DETAIL.to_string()
            }
            ServiceError::PayloadTooLarge { message, limit } => {
                warn!(limit, "Payload too large");
                format!("{} (limit {} bytes)", message, limit)
            }
            other => other.to_string(),
        };
        let mut response = status.into_response();
        response.extensions_mut().insert(PendingProblem { status, detail });
        response
    }
}

pub fn problem_response(status: StatusCode, detail: String, path: &str) -> Response {
    let body = Problem {
        problem_type: "about:blank".to_string(),
        title: status.canonical_reason().unwrap_or("Error").to_string(),
        status: status.as_u16(),
        detail,
        path: path.to_string(),
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_CONTENT_TYPE));
    response
}

/// Renders `ApiFailure` responses as problem documents carrying the request path.
///
/// Other error responses that are not JSON already, such as extractor
/// rejections and unmatched routes, are rewrapped the same way.
pub async fn render_problems(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let mut response = next.run(req).await;
    if let Some(pending) = response.extensions_mut().remove::<PendingProblem>() {
        return problem_response(pending.status, pending.detail, &path);
    }

    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) || is_json(&response) {
        return response;
    }
    let detail = if status.is_server_error() {
        error!(%status, path = %path, "Request failed outside a handler");
        INTERNAL_DETAIL.to_string()
    } else {
        rejection_detail(response, status).await
    };
    problem_response(status, detail, &path)
}

/// Largest plain-text rejection body kept as problem detail.
const MAX_REJECTION_BYTES: usize = 16 * 1024;

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json") || value.starts_with(PROBLEM_CONTENT_TYPE))
}

async fn rejection_detail(response: Response, status: StatusCode) -> String {
    let fallback = || status.canonical_reason().unwrap_or("Request could not be processed").to_string();
    match to_bytes(response.into_body(), MAX_REJECTION_BYTES).await {
        Ok(bytes) if !bytes.is_empty() => {
            let text = String::from_utf8_lossy(&bytes).trim().to_string();
            if text.is_empty() {
                fallback()
            } else {
                text
            }
        }
        _ => fallback(),
    }
}
