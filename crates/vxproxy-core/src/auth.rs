use std::sync::Arc;

use subtle::{Choice, ConstantTimeEq};

use crate::error::DispatchError;

pub trait AuthProvider: Send + Sync {
    /// Checks the keys the caller presented (query `key`, `x-goog-api-key`).
    /// One matching candidate is enough.
    fn authenticate(&self, presented: &[&str]) -> Result<(), DispatchError>;
}

/// Accepts every caller. Used when no shared secret is configured.
#[derive(Debug, Default)]
pub struct NoopAuth;

impl AuthProvider for NoopAuth {
    fn authenticate(&self, _presented: &[&str]) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// One shared secret for every caller, compared in constant time.
pub struct SharedSecretAuth {
    secret: Vec<u8>,
}

impl SharedSecretAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into().into_bytes(),
        }
    }
}

impl std::fmt::Debug for SharedSecretAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretAuth").finish_non_exhaustive()
    }
}

impl AuthProvider for SharedSecretAuth {
    fn authenticate(&self, presented: &[&str]) -> Result<(), DispatchError> {
        let mut candidates = presented
            .iter()
            .map(|key| key.trim())
            .filter(|key| !key.is_empty())
            .peekable();
        if candidates.peek().is_none() {
            return Err(DispatchError::AuthenticationFailure("missing api key"));
        }
        // Every candidate is compared; `ct_eq` on slices of different length
        // returns false without inspecting contents.
        let matched = candidates.fold(Choice::from(0), |acc, key| {
            acc | key.as_bytes().ct_eq(&self.secret)
        });
        if bool::from(matched) {
            Ok(())
        } else {
            Err(DispatchError::AuthenticationFailure("invalid api key"))
        }
    }
}

/// Picks the provider for an optional configured secret.
pub fn auth_from_secret(secret: Option<&str>) -> Arc<dyn AuthProvider> {
    match secret.map(str::trim).filter(|secret| !secret.is_empty()) {
        Some(secret) => Arc::new(SharedSecretAuth::new(secret)),
        None => Arc::new(NoopAuth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_matches_exactly() {
        let auth = SharedSecretAuth::new("s3cret");
        assert!(auth.authenticate(&["s3cret"]).is_ok());
        assert!(auth.authenticate(&["s3cret-"]).is_err());
        assert!(auth.authenticate(&["S3CRET"]).is_err());
        assert!(matches!(
            auth.authenticate(&[]),
            Err(DispatchError::AuthenticationFailure("missing api key"))
        ));
        assert!(matches!(
            auth.authenticate(&["  "]),
            Err(DispatchError::AuthenticationFailure("missing api key"))
        ));
    }

    #[test]
    fn any_matching_candidate_is_accepted() {
        let auth = SharedSecretAuth::new("s3cret");
        assert!(auth.authenticate(&["wrong", "s3cret"]).is_ok());
        assert!(auth.authenticate(&["s3cret", "wrong"]).is_ok());
        assert!(auth.authenticate(&["", "s3cret"]).is_ok());
        assert!(matches!(
            auth.authenticate(&["wrong", "also-wrong"]),
            Err(DispatchError::AuthenticationFailure("invalid api key"))
        ));
    }

    #[test]
    fn missing_secret_disables_auth() {
        assert!(auth_from_secret(None).authenticate(&[]).is_ok());
        assert!(auth_from_secret(Some("")).authenticate(&[]).is_ok());
        assert!(auth_from_secret(Some("x")).authenticate(&[]).is_err());
    }

    #[test]
    fn debug_never_prints_the_secret() {
        let rendered = format!("{:?}", SharedSecretAuth::new("hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
