//! Axum integration: replay responses for requests carrying an
//! `Idempotency-Key` header.

use crate::fingerprint::{hash_bytes, hash_value};
use crate::{IdempotencyError, IdempotencyMiddleware, IdempotencyStore, Outcome};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Set on responses served from the store.
pub const REPLAYED_HEADER: &str = "x-idempotency-replayed";

/// Request and response bodies above this size are not buffered.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedResponse {
    pub status_code: u16,
    /// In response order; repeated headers such as `set-cookie` keep every value.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    async fn from_response(response: Response) -> Result<Self, InnerFailure> {
        let (parts, body) = response.into_parts();
        let body = to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| InnerFailure::Body(e.to_string()))?;

        let headers = parts
            .headers
            .iter()
            .filter(|(name, _)| {
                name.as_str() != header::CONTENT_LENGTH.as_str()
                    && name.as_str() != header::TRANSFER_ENCODING.as_str()
            })
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        Ok(Self {
            status_code: parts.status.as_u16(),
            headers,
            body: body.to_vec(),
        })
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, self.body).into_response();
        let headers = response.headers_mut();
        headers.clear();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        response
    }
}

/// Why the wrapped service's response was not stored.
#[derive(Debug, thiserror::Error)]
enum InnerFailure {
    /// 5xx responses are passed through but leave the key retryable.
    #[error("inner service returned status {}", .0.status_code)]
    ServerError(CachedResponse),
    #[error("failed to read response body: {0}")]
    Body(String),
}

impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        let status = match &self {
            IdempotencyError::AlreadyInProgress { .. } => StatusCode::CONFLICT,
            IdempotencyError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            IdempotencyError::MissingIdempotencyKey | IdempotencyError::InvalidKeyFormat => {
                StatusCode::BAD_REQUEST
            }
            IdempotencyError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut response = (status, self.to_string()).into_response();
        if let IdempotencyError::AlreadyInProgress { retry_after, .. } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

/// Axum middleware for idempotency.
///
/// ```ignore
/// let app = Router::new()
///     .route("/orders", post(create_order))
///     .layer(axum::middleware::from_fn_with_state(
///         middleware.clone(),
///         idempotency_middleware::<SqliteIdempotencyStore>,
///     ));
/// ```
pub async fn idempotency_middleware<S>(
    State(middleware): State<Arc<IdempotencyMiddleware<S>>>,
    req: Request,
    next: Next,
) -> Response
where
    S: IdempotencyStore + 'static,
{
    // Only apply to mutating methods
    if !matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH) {
        return next.run(req).await;
    }

    let coordinator = middleware.coordinator();
    let header_key = req
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(header_key) = header_key else {
        if coordinator.config().raise_on_no_idempotency_key {
            return IdempotencyError::MissingIdempotencyKey.into_response();
        }
        return next.run(req).await;
    };
    if Uuid::parse_str(&header_key).is_err() {
        return IdempotencyError::InvalidKeyFormat.into_response();
    }

    let fingerprint = serde_json::json!({
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "idempotency_key": header_key,
    });
    let key = middleware.fingerprinter().namespaced(&hash_value(&fingerprint));

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to buffer request body for idempotency");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };
    let payload_hash = coordinator
        .config()
        .payload_validation_enabled
        .then(|| hash_bytes(&bytes));
    let req = Request::from_parts(parts, Body::from(bytes));

    let result = coordinator
        .execute(&key, payload_hash, move || async move {
            let cached = CachedResponse::from_response(next.run(req).await).await?;
            if cached.status_code >= 500 {
                Err(InnerFailure::ServerError(cached))
            } else {
                Ok(cached)
            }
        })
        .await;

    match result {
        Ok(Outcome::Fresh(cached)) => cached.into_response(),
        Ok(Outcome::Replayed(cached)) => {
            let mut response = cached.into_response();
            response
                .headers_mut()
                .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
            response
        }
        Err(IdempotencyError::HandlerFailed(error)) => match error.downcast::<InnerFailure>() {
            Ok(failure) => match *failure {
                InnerFailure::ServerError(cached) => cached.into_response(),
                InnerFailure::Body(message) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
                }
            },
            Err(other) => IdempotencyError::HandlerFailed(other).into_response(),
        },
        Err(e) => e.into_response(),
    }
}
