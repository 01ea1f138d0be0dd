//! Bearer-token authentication middleware for the management endpoint and
//! (optionally) proxied routes.
//!
//! Ground: `turbomcp-transport::security::SecurityManager::validate_authentication`
//! for the `Authorization: Bearer <token>` parsing convention; adapted here
//! as an `axum` middleware rather than a pre-dispatch header check, and
//! using a constant-time comparison since the token is a shared secret
//! (spec.md §6: `MCP_GATEWAY_TOKEN`).

use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

/// Shared auth state injected into the router.
#[derive(Clone)]
pub struct AuthState {
    pub token: Arc<SecretString>,
}

impl AuthState {
    pub fn new(token: SecretString) -> Self {
        Self { token: Arc::new(token) }
    }

    fn accepts(&self, candidate: &str) -> bool {
        constant_time_eq(self.token.expose_secret().as_bytes(), candidate.as_bytes())
    }
}

/// `axum` middleware enforcing `Authorization: Bearer <token>` on every
/// request it wraps. Unauthenticated/invalid requests receive `401` with
/// `WWW-Authenticate: Bearer` (spec.md §7).
pub async fn require_bearer_token(
    State(auth): State<AuthState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|candidate| auth.accepts(candidate));

    if !authorized {
        return unauthorized();
    }

    next.run(request).await
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        "authentication failed",
    )
        .into_response()
}

/// Constant-time byte comparison so token verification doesn't leak
/// timing information about how many leading bytes matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_token() {
        let state = AuthState::new(SecretString::from("abc123".to_string()));
        assert!(state.accepts("abc123"));
    }

    #[test]
    fn rejects_mismatched_token() {
        let state = AuthState::new(SecretString::from("abc123".to_string()));
        assert!(!state.accepts("wrong"));
        assert!(!state.accepts("abc1234"));
        assert!(!state.accepts(""));
    }

    #[test]
    fn constant_time_eq_matches_standard_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
    }
}
