//! Error taxonomy of the pipeline and the JSON envelopes it answers with.
//!
//! Every error raised above the business-handler boundary is converted into
//! a response here; none propagates past the outer panic guard.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gatehouse_core::PanicReport;
use jsonwebtoken::errors::ErrorKind;
use serde_json::json;

pub const TIMEOUT_MESSAGE: &str = "request timeout";
pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";
pub const UNAVAILABLE_MESSAGE: &str = "service unavailable";
pub const UNAUTHORIZED_MESSAGE: &str = "unauthorized";

/// Builds the standard `{"message": ...}` error envelope.
#[must_use]
pub fn json_message(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

/// 408 answer synthesized when the deadline fires before the handler finishes.
#[must_use]
pub fn timeout_response() -> Response {
    json_message(StatusCode::REQUEST_TIMEOUT, TIMEOUT_MESSAGE)
}

/// 500 answer for a recovered panic.
///
/// The panic value and its type are only included when `expose_details` is set.
#[must_use]
pub fn panic_response(report: &PanicReport, expose_details: bool) -> Response {
    if !expose_details {
        return json_message(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE);
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "message": INTERNAL_ERROR_MESSAGE,
            "error": report.message,
            "type": report.type_name,
        })),
    )
        .into_response()
}

/// Why a bearer credential was rejected.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    Missing,
    #[error("malformed bearer credential")]
    Malformed,
    #[error("credential expired")]
    Expired,
    #[error("credential signature does not match the configured key")]
    InvalidSignature,
    #[error("credential rejected: {reason}")]
    Invalid { reason: String },
}

impl AuthError {
    /// Metric tag for this failure.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed => "malformed",
            Self::Expired => "expired",
            Self::InvalidSignature => "invalid_signature",
            Self::Invalid { .. } => "invalid",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Self::Malformed,
            _ => Self::Invalid {
                reason: err.to_string(),
            },
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let mut response = json_message(StatusCode::UNAUTHORIZED, UNAUTHORIZED_MESSAGE);
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        response
    }
}

/// Returned by [`Deadline::run`](crate::service::Deadline::run) when the
/// deadline fires before the wrapped work completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Failures while buffering a request body for logging.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    BodyRead(axum::BoxError),
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        match self {
            Self::BodyTooLarge { .. } => {
                json_message(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
            }
            Self::BodyRead(_) => json_message(StatusCode::BAD_REQUEST, "unreadable request body"),
        }
    }
}
