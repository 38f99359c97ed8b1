use bytes::Bytes;
use http::StatusCode;

use vxproxy_provider_core::{
    Headers, ProviderError, ResolveError, StreamError, UnavailableReason, header_set,
};

use crate::proxy_engine::ProxyResponse;

/// Request-level failures the gateway answers itself.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{0}")]
    AuthenticationFailure(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("all {attempts} credential attempts failed{}", last_failure_suffix(.last_failure))]
    PoolExhausted {
        attempts: usize,
        last_failure: Option<String>,
    },
    #[error("backend unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("credential rejected: {0}")]
    CredentialRejected(String),
    #[error("internal error: {0}")]
    Internal(String),
}

fn last_failure_suffix(last_failure: &Option<String>) -> String {
    match last_failure {
        Some(summary) => format!(" (last: {summary})"),
        None => String::new(),
    }
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            DispatchError::CredentialRejected(_) => StatusCode::UNAUTHORIZED,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Google-style status string for the error envelope.
    pub fn google_status(&self) -> &'static str {
        match self {
            DispatchError::AuthenticationFailure(_) | DispatchError::CredentialRejected(_) => {
                "UNAUTHENTICATED"
            }
            DispatchError::InvalidRequest(_) => "INVALID_ARGUMENT",
            DispatchError::PoolExhausted { .. } | DispatchError::UpstreamUnavailable(_) => {
                "UNAVAILABLE"
            }
            DispatchError::Internal(_) => "INTERNAL",
        }
    }

    /// `{"error":{"code","message","status"}}`, the shape Gemini clients parse.
    pub fn into_response(self) -> ProxyResponse {
        let status = self.status().as_u16();
        let body = serde_json::json!({
            "error": {
                "code": status,
                "message": self.to_string(),
                "status": self.google_status(),
            }
        });
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        ProxyResponse::buffered(
            status,
            headers,
            Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
        )
    }
}

impl From<ProviderError> for DispatchError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidRequest(msg) => DispatchError::InvalidRequest(msg),
            other => DispatchError::Internal(other.to_string()),
        }
    }
}

/// Why one credential attempt did not produce a response for the caller.
#[derive(Debug)]
pub enum AttemptFailure {
    /// The credential's project id could not be resolved.
    CredentialResolution(ResolveError),
    /// Transport error, timeout, 429, 5xx or a stream that died before its first chunk.
    RecoverableBackend {
        reason: UnavailableReason,
        summary: String,
        /// The backend's answer, when there was one.
        response: Option<ProxyResponse>,
    },
    /// The backend rejected the credential itself.
    FatalCredential {
        reason: UnavailableReason,
        summary: String,
        response: Option<ProxyResponse>,
    },
    /// The caller's request is at fault; the backend answer goes back untouched.
    CallerInput(ProxyResponse),
    /// The request cannot be translated; no credential would help.
    Rejected(DispatchError),
}

impl AttemptFailure {
    pub fn summary(&self) -> String {
        match self {
            AttemptFailure::CredentialResolution(err) => err.to_string(),
            AttemptFailure::RecoverableBackend { summary, .. }
            | AttemptFailure::FatalCredential { summary, .. } => summary.clone(),
            AttemptFailure::CallerInput(resp) => format!("http_status_{}", resp.status),
            AttemptFailure::Rejected(err) => err.to_string(),
        }
    }
}

/// A committed stream broke; the caller's body is aborted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("backend stream truncated: {0}")]
pub struct StreamTruncated(pub StreamError);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_engine::ProxyBody;

    fn body_json(resp: ProxyResponse) -> serde_json::Value {
        match resp.body {
            ProxyBody::Bytes(bytes) => serde_json::from_slice(&bytes).unwrap(),
            ProxyBody::Stream(_) => panic!("expected buffered body"),
        }
    }

    #[test]
    fn pool_exhausted_is_a_503_envelope() {
        let err = DispatchError::PoolExhausted {
            attempts: 2,
            last_failure: Some("http_status_503".to_string()),
        };
        let resp = err.into_response();
        assert_eq!(resp.status, 503);
        let json = body_json(resp);
        assert_eq!(json["error"]["code"], 503);
        assert_eq!(json["error"]["status"], "UNAVAILABLE");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("http_status_503")
        );
    }

    #[test]
    fn auth_failure_is_401() {
        let resp = DispatchError::AuthenticationFailure("invalid api key").into_response();
        assert_eq!(resp.status, 401);
        assert_eq!(body_json(resp)["error"]["message"], "invalid api key");
    }
}
