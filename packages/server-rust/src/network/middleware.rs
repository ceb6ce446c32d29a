//! Transport-edge HTTP middleware.
//!
//! Applied outside the request pipeline so CORS preflights are answered
//! before correlation, authentication, or supervision run.

use axum::http::header::{HeaderName, AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::service::middleware::X_REQUEST_ID;

/// Builds the CORS layer from the configured list of allowed origins.
///
/// A wildcard `"*"` in the origins list allows any origin. Otherwise,
/// each origin string is parsed and added to an explicit allowlist;
/// unparsable entries are skipped.
#[must_use]
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    let request_id: HeaderName = X_REQUEST_ID.clone();
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, request_id.clone()])
        .expose_headers([request_id])
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;

    fn app(origins: &[&str]) -> Router {
        let origins: Vec<String> = origins.iter().map(ToString::to_string).collect();
        Router::new()
            .route("/items", get(|| async { "[]" }))
            .layer(build_cors_layer(&origins))
    }

    fn preflight(origin: &str) -> Request {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/items")
            .header("origin", origin)
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin() {
        let response = app(&["*"]).oneshot(preflight("https://anywhere.test")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn explicit_list_echoes_allowed_origin_only() {
        let app = app(&["https://app.example.com", "not a header\n"]);

        let allowed = app
            .clone()
            .oneshot(preflight("https://app.example.com"))
            .await
            .unwrap();
        assert_eq!(
            allowed.headers()["access-control-allow-origin"],
            "https://app.example.com"
        );

        let denied = app.oneshot(preflight("https://evil.test")).await.unwrap();
        assert!(denied.headers().get("access-control-allow-origin").is_none());
    }
}
