use std::fmt;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::headers::Headers;
use crate::{Credential, InboundRequest, ProviderResult, ResolveError, UnavailableReason};

/// Chunks of a backend stream, in arrival order. An `Err` item is always the last one.
pub type StreamItem = Result<Bytes, StreamError>;
pub type ByteStream = tokio::sync::mpsc::Receiver<StreamItem>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
        }
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failures (no HTTP response).
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// HTTP error response captured as bytes (non-2xx).
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamFailure::Transport { kind, message } => {
                write!(f, "transport error ({kind:?}): {message}")
            }
            UpstreamFailure::Http { status, .. } => write!(f, "http_status_{status}"),
        }
    }
}

/// A backend stream that broke after it was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    ReadTimeout,
    Transport(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::ReadTimeout => write!(f, "upstream stream idle timeout"),
            StreamError::Transport(msg) => write!(f, "upstream stream error: {msg}"),
        }
    }
}

impl std::error::Error for StreamError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Rotate to another credential.
    Recoverable(UnavailableReason),
    /// Disable this credential, then rotate.
    Fatal(UnavailableReason),
    /// The caller's request is at fault; hand the response back untouched.
    CallerInput,
}

pub fn classify_failure(failure: &UpstreamFailure) -> FailureClass {
    match failure {
        UpstreamFailure::Transport { kind, .. } => match kind {
            UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout => {
                FailureClass::Recoverable(UnavailableReason::Timeout)
            }
            _ => FailureClass::Recoverable(UnavailableReason::Transport),
        },
        UpstreamFailure::Http { status, body, .. } => {
            if *status == 429 {
                return FailureClass::Recoverable(UnavailableReason::RateLimit);
            }
            if (500..600).contains(status) {
                return FailureClass::Recoverable(UnavailableReason::Upstream5xx);
            }
            if *status == 401 || *status == 403 {
                return FailureClass::Fatal(UnavailableReason::AuthInvalid);
            }
            if *status == 400 && is_invalid_key_body(body) {
                return FailureClass::Fatal(UnavailableReason::AuthInvalid);
            }
            FailureClass::CallerInput
        }
    }
}

/// Google reports a rejected key as a 400 with `API_KEY_INVALID` in the details.
fn is_invalid_key_body(body: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<JsonValue>(body) else {
        return false;
    };
    let Some(error) = value.get("error") else {
        return false;
    };
    let reason_match = error
        .get("details")
        .and_then(JsonValue::as_array)
        .map(|details| {
            details.iter().any(|detail| {
                matches!(
                    detail.get("reason").and_then(JsonValue::as_str),
                    Some("API_KEY_INVALID" | "API_KEY_EXPIRED")
                )
            })
        })
        .unwrap_or(false);
    if reason_match {
        return true;
    }
    error
        .get("message")
        .and_then(JsonValue::as_str)
        .map(|message| {
            let message = message.to_ascii_lowercase();
            message.contains("api key not valid") || message.contains("api key expired")
        })
        .unwrap_or(false)
}

/// A backend this gateway can forward to.
///
/// Implementations only build requests and interpret bodies; IO and retry
/// policy belong to the dispatcher.
pub trait UpstreamProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// A request whose answer reveals the credential's project id.
    fn build_project_probe(&self, credential: &Credential) -> ProviderResult<UpstreamHttpRequest>;

    /// Extracts the project id from a probe answer.
    fn parse_project_probe(&self, status: u16, body: &[u8]) -> Result<String, ResolveError>;

    /// Builds the outbound call for `req` using `api_key` against `project_id`.
    fn build_generate(
        &self,
        req: &InboundRequest,
        api_key: &str,
        project_id: &str,
    ) -> ProviderResult<UpstreamHttpRequest>;

    /// Post-processes a buffered 2xx body before it goes back to the caller.
    fn finish_response(&self, _req: &InboundRequest, body: Bytes) -> Bytes {
        body
    }
}
