use serde::{Deserialize, Serialize};

pub type CredentialId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialState {
    Available,
    /// Failed recoverably on its last attempt; still selectable by later requests.
    CoolingDown { reason: UnavailableReason },
    /// Permanently failed for the process lifetime.
    Disabled { reason: UnavailableReason },
}

impl CredentialState {
    pub fn is_disabled(&self) -> bool {
        matches!(self, CredentialState::Disabled { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnavailableReason {
    RateLimit,
    Timeout,
    Transport,
    Upstream5xx,
    AuthInvalid,
    ProjectUnresolved,
}

/// Feedback the dispatcher gives the pool after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Recoverable(UnavailableReason),
    Fatal(UnavailableReason),
}
