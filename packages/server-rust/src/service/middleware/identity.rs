//! Bearer credential validation.
//!
//! For routes not on the skip-list, extracts `Authorization: Bearer <token>`,
//! verifies its HS256 signature and expiry, and binds the subject into the
//! [`RequestContext`]. Any failure short-circuits with 401; the inner
//! service is never called. Skip-listed routes bypass validation entirely,
//! even when they carry an invalid credential.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use gatehouse_core::Claims;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tower::{Layer, Service};
use tracing::warn;

use super::{request_context, route_of, ResponseFuture};
use crate::service::config::AuthConfig;
use crate::service::error::AuthError;

// ---------------------------------------------------------------------------
// CredentialVerifier
// ---------------------------------------------------------------------------

/// Validates bearer credentials against the configured signing key.
pub struct CredentialVerifier {
    key: DecodingKey,
    validation: Validation,
    skip_paths: HashSet<String>,
}

impl CredentialVerifier {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway.as_secs();
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            key: DecodingKey::from_secret(&config.secret),
            validation,
            skip_paths: config.skip_paths.clone(),
        }
    }

    #[must_use]
    pub fn is_skipped(&self, path: &str) -> bool {
        self.skip_paths.contains(path)
    }

    /// Extracts the token from `Authorization: Bearer <token>`.
    /// The scheme is matched case-insensitively.
    ///
    /// # Errors
    ///
    /// [`AuthError::Missing`] without the header, [`AuthError::Malformed`]
    /// for any other scheme or an empty token.
    pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
        let value = headers
            .get(header::AUTHORIZATION)
            .ok_or(AuthError::Missing)?
            .to_str()
            .map_err(|_| AuthError::Malformed)?;

        let (scheme, token) = value.split_once(' ').ok_or(AuthError::Malformed)?;
        let token = token.trim();
        if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
            return Err(AuthError::Malformed);
        }
        Ok(token)
    }

    /// Verifies signature and expiry, returning the embedded claims.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] describing why the token was rejected.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(AuthError::from)
    }

    /// Full check of a request's headers.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] for a missing, malformed, expired, or
    /// wrongly-signed credential.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Claims, AuthError> {
        self.verify(Self::bearer_token(headers)?)
    }
}

// ---------------------------------------------------------------------------
// IdentityLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing bearer authentication outside the skip-list.
#[derive(Clone)]
pub struct IdentityLayer {
    verifier: Arc<CredentialVerifier>,
}

impl IdentityLayer {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            verifier: Arc::new(CredentialVerifier::new(config)),
        }
    }
}

impl<S> Layer<S> for IdentityLayer {
    type Service = IdentityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdentityService {
            inner,
            verifier: Arc::clone(&self.verifier),
        }
    }
}

// ---------------------------------------------------------------------------
// IdentityService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct IdentityService<S> {
    inner: S,
    verifier: Arc<CredentialVerifier>,
}

impl<S> Service<Request> for IdentityService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        if self.verifier.is_skipped(req.uri().path()) {
            return Box::pin(self.inner.call(req));
        }

        let ctx = request_context(&req);
        match self.verifier.authenticate(req.headers()) {
            Ok(claims) => {
                req.extensions_mut().insert(ctx.with_subject_id(claims.sub.as_str()));
                req.extensions_mut().insert(claims);
                Box::pin(self.inner.call(req))
            }
            Err(err) => {
                warn!(
                    correlation_id = ctx.correlation_id(),
                    method = %req.method(),
                    route = %route_of(&req),
                    reason = err.reason(),
                    error = %err,
                    "authentication failed"
                );
                metrics::counter!("http_auth_failures_total", "reason" => err.reason()).increment(1);
                Box::pin(std::future::ready(Ok(err.into_response())))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
