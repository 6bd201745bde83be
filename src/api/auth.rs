// =============================================================================
// Admin Authentication: one token for the dashboard API and WebSocket
// =============================================================================
//
// The token is read from `SGNL_ADMIN_TOKEN` on every check, so rotating it
// needs no restart. With no token configured every authenticated route is
// closed. REST handlers take the `AdminAuth` extractor (token in an
// `Authorization: Bearer` header); the WebSocket upgrade passes its
// `?token=` query parameter to `check_admin`. Both end in `authorize`.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

/// Environment variable holding the dashboard admin token.
pub const ADMIN_TOKEN_ENV: &str = "SGNL_ADMIN_TOKEN";

/// Why a request was refused. Every variant maps to 403.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    NotConfigured,
    MissingToken,
    WrongToken,
}

impl AuthFailure {
    fn message(self) -> &'static str {
        match self {
            Self::NotConfigured => "admin token not configured on server",
            Self::MissingToken => "missing admin token",
            Self::WrongToken => "invalid admin token",
        }
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message() });
        (StatusCode::FORBIDDEN, Json(body)).into_response()
    }
}

/// Check a presented token against the expected one.
pub fn authorize(presented: Option<&str>, expected: &str) -> Result<(), AuthFailure> {
    if expected.is_empty() {
        return Err(AuthFailure::NotConfigured);
    }
    let presented = presented
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthFailure::MissingToken)?;

    if tokens_match(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(AuthFailure::WrongToken)
    }
}

/// `authorize` against the token currently in the environment, logging
/// refusals.
pub fn check_admin(presented: Option<&str>) -> Result<(), AuthFailure> {
    let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();
    authorize(presented, &expected).inspect_err(|failure| {
        warn!(reason = failure.message(), "admin request refused");
    })
}

/// Token from an `Authorization: Bearer <token>` header. The scheme name is
/// case-insensitive.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token)
}

/// Byte equality whose running time depends only on the lengths.
fn tokens_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extractor guarding admin-only handlers.
pub struct AdminAuth;

#[async_trait]
impl<S> FromRequestParts<S> for AdminAuth
where
    S: Send + Sync,
{
    type Rejection = AuthFailure;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        check_admin(bearer_token(&parts.headers)).map(|()| AdminAuth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn authorize_outcomes() {
        assert_eq!(authorize(Some("s3cret"), "s3cret"), Ok(()));
        assert_eq!(authorize(Some(" s3cret "), "s3cret"), Ok(()));
        assert_eq!(authorize(Some("s3cre7"), "s3cret"), Err(AuthFailure::WrongToken));
        assert_eq!(authorize(Some("s3cret-longer"), "s3cret"), Err(AuthFailure::WrongToken));
        assert_eq!(authorize(None, "s3cret"), Err(AuthFailure::MissingToken));
        assert_eq!(authorize(Some("  "), "s3cret"), Err(AuthFailure::MissingToken));
        // An unconfigured server refuses even an empty presented token.
        assert_eq!(authorize(Some(""), ""), Err(AuthFailure::NotConfigured));
    }

    #[test]
    fn bearer_scheme_is_required() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn refusal_is_forbidden() {
        let resp = AuthFailure::WrongToken.into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
