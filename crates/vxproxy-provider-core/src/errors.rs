use std::error::Error;
use std::fmt;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub enum ProviderError {
    InvalidRequest(String),
    Other(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            ProviderError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for ProviderError {}

/// Why a credential did not yield a project id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The backend could not be asked right now (transport, 429, 5xx).
    Transient(String),
    /// The backend answered, but the credential does not name a project.
    Unresolvable(String),
}

impl ResolveError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResolveError::Unresolvable(_))
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Transient(msg) => write!(f, "project probe failed: {msg}"),
            ResolveError::Unresolvable(msg) => write!(f, "project id unresolvable: {msg}"),
        }
    }
}

impl Error for ResolveError {}
