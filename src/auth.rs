//! Basic-auth middleware.
//!
//! Verifies `Authorization: Basic` credentials against the configured
//! account set and threads the authenticated username through the request
//! as `Caller` — the policy engine treats it as the caller's role.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use std::sync::Arc;

use crate::handlers::AppState;

/// Authenticated caller identity, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Username of the verified basic credential; used as the role for
    /// policy lookup.
    pub role: String,
}

pub async fn require_basic_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let credentials = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_basic);

    let Some((username, password)) = credentials else {
        return challenge();
    };

    match state.accounts.get(&username) {
        Some(expected) if *expected == password => {}
        _ => {
            tracing::warn!("Rejected basic credential for user {}", username);
            return challenge();
        }
    }

    request.extensions_mut().insert(Caller { role: username });
    next.run(request).await
}

/// Parse a `Basic <base64(user:password)>` header value.
fn decode_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn challenge() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"kms\"")],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(credentials: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }

    #[test]
    fn test_decode_basic_round_trip() {
        let header = encode("admin:password");
        assert_eq!(
            decode_basic(&header),
            Some(("admin".to_string(), "password".to_string()))
        );
    }

    #[test]
    fn test_decode_basic_password_may_contain_colon() {
        let header = encode("admin:pass:word");
        assert_eq!(
            decode_basic(&header),
            Some(("admin".to_string(), "pass:word".to_string()))
        );
    }

    #[test]
    fn test_decode_basic_rejects_other_schemes() {
        assert_eq!(decode_basic("Bearer abcdef"), None);
    }

    #[test]
    fn test_decode_basic_rejects_invalid_base64() {
        assert_eq!(decode_basic("Basic not-base64!!!"), None);
    }

    #[test]
    fn test_decode_basic_rejects_missing_separator() {
        let header = encode("admin");
        assert_eq!(decode_basic(&header), None);
    }

    #[test]
    fn test_challenge_carries_www_authenticate() {
        let response = challenge();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }
}
