use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::provider::UpstreamTransportErrorKind;
use crate::{CredentialId, UnavailableReason};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Upstream(UpstreamEvent),
    Operational(OperationalEvent),
}

/// One backend call attempt. Never carries the backend key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEvent {
    pub trace_id: Option<String>,
    pub at: SystemTime,
    pub provider: String,
    pub credential_id: Option<CredentialId>,
    pub attempt_no: u32,
    pub model: String,
    pub action: String,
    pub request_method: String,
    pub request_url: String,
    pub response_status: Option<u16>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub transport_kind: Option<UpstreamTransportErrorKind>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    CoolingDown(CredentialStateEvent),
    Disabled(CredentialStateEvent),
    Recovered(CredentialStateEvent),
    ProjectResolved(ProjectResolvedEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialStateEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub reason: Option<UnavailableReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectResolvedEvent {
    pub at: SystemTime,
    pub credential_id: Option<CredentialId>,
    pub project_id: String,
}
