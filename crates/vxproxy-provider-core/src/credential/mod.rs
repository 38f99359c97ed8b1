mod pool;
mod state;

pub use pool::{AcquireError, CredentialPool, PoolError, PoolSnapshot};
pub use state::{CredentialId, CredentialState, Outcome, UnavailableReason};

use std::fmt;
use std::future::Future;

use tokio::sync::OnceCell;

/// One Vertex Express API key held by the pool.
///
/// `api_key` never changes after startup. The project id is filled in at most once.
pub struct Credential {
    id: CredentialId,
    api_key: String,
    project_id: OnceCell<String>,
}

impl Credential {
    pub fn new(id: CredentialId, api_key: impl Into<String>) -> Self {
        Self {
            id,
            api_key: api_key.into(),
            project_id: OnceCell::new(),
        }
    }

    pub fn id(&self) -> CredentialId {
        self.id
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.get().map(String::as_str)
    }

    /// Returns the cached project id, running `derive` only when none is cached.
    ///
    /// Concurrent callers wait on the same derivation. A failed derivation leaves
    /// the cache empty.
    pub async fn project_id_or_try_init<F, Fut, E>(&self, derive: F) -> Result<&str, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        self.project_id
            .get_or_try_init(derive)
            .await
            .map(String::as_str)
    }

    /// Last four characters of the key, for logs.
    pub fn masked(&self) -> String {
        mask_key(&self.api_key)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("api_key", &self.masked())
            .field("project_id", &self.project_id())
            .finish()
    }
}

pub fn mask_key(key: &str) -> String {
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_masks_key() {
        let cred = Credential::new(3, "AQ.secret-value-1234");
        let debug = format!("{cred:?}");
        assert!(debug.contains("***1234"));
        assert!(!debug.contains("secret"));
    }

    #[tokio::test]
    async fn failed_derivation_keeps_cache_empty() {
        let cred = Credential::new(0, "k");
        let res: Result<&str, &str> = cred.project_id_or_try_init(|| async { Err("nope") }).await;
        assert_eq!(res, Err("nope"));
        assert_eq!(cred.project_id(), None);

        let res: Result<&str, &str> = cred
            .project_id_or_try_init(|| async { Ok("proj-1".to_string()) })
            .await;
        assert_eq!(res, Ok("proj-1"));
        assert_eq!(cred.project_id(), Some("proj-1"));
    }
}
