use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use uuid::Uuid;

use fleet_common::error::{AppError, AppResult};

pub const TOKEN_PREFIX: &str = "flt_live_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub raw_token: String,
    pub token_hash: String,
}

/// Mint a fresh device token. Only the argon2 hash is ever stored.
pub fn issue_device_token() -> AppResult<IssuedToken> {
    let suffix = Uuid::new_v4().simple().to_string();
    let raw_token = format!("{TOKEN_PREFIX}{suffix}");
    let token_hash = hash_token(&raw_token)?;

    Ok(IssuedToken {
        raw_token,
        token_hash,
    })
}

pub fn hash_token(raw_token: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(raw_token.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| AppError::Internal)
}

pub fn verify_token(stored_hash: &str, candidate: &str) -> AppResult<bool> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|e| AppError::InvalidInput(format!("invalid stored token hash: {e}")))?;

    Ok(Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::{issue_device_token, verify_token, TOKEN_PREFIX};

    #[test]
    fn issues_prefixed_token_and_hash() {
        let issued = issue_device_token().expect("issue");
        assert!(issued.raw_token.starts_with(TOKEN_PREFIX));
        assert!(!issued.token_hash.is_empty());
        assert_ne!(issued.raw_token, issued.token_hash);
    }

    #[test]
    fn verifies_only_the_issued_token() {
        let issued = issue_device_token().expect("issue");
        assert!(verify_token(&issued.token_hash, &issued.raw_token).expect("verify"));
        assert!(!verify_token(&issued.token_hash, "flt_live_wrongwrongwrong").expect("verify"));
    }

    #[test]
    fn rotation_invalidates_the_old_token() {
        let first = issue_device_token().expect("first");
        let second = issue_device_token().expect("second");
        assert!(!verify_token(&second.token_hash, &first.raw_token).expect("verify"));
    }
}
