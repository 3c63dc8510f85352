use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::state::AppState;
use fleet_common::error::AppError;
use fleet_common::http::extract_bearer;

/// Guard for administrative routes. The expected token comes from server
/// configuration; comparison is over digests so length and content leak
/// nothing through timing.
pub async fn require_admin(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state
        .config
        .admin_token
        .as_deref()
        .ok_or(AppError::Forbidden)?;

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::Unauthorized)?;

    if !digest_eq(presented, expected) {
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

fn digest_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::digest_eq;

    #[test]
    fn digest_comparison() {
        assert!(digest_eq("secret-token", "secret-token"));
        assert!(!digest_eq("secret-token", "secret-tokeN"));
        assert!(!digest_eq("", "secret-token"));
    }
}
