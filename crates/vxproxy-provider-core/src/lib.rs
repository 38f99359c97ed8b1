//! Core abstractions for vxproxy.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP client.
//! Provider implementations construct `UpstreamHttpRequest`, while a higher layer
//! performs IO and owns the retry loop.

pub mod credential;
pub mod errors;
pub mod events;
pub mod headers;
pub mod provider;
pub mod request;

pub use credential::{
    AcquireError, Credential, CredentialId, CredentialPool, CredentialState, Outcome, PoolError,
    PoolSnapshot, UnavailableReason,
};
pub use errors::{ProviderError, ProviderResult, ResolveError};
pub use events::{
    CredentialStateEvent, Event, EventHub, EventSink, OperationalEvent, ProjectResolvedEvent,
    TerminalEventSink, UpstreamEvent,
};
pub use headers::{Headers, header_get, header_set};
pub use provider::{
    ByteStream, FailureClass, HttpMethod, StreamError, StreamItem, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamProvider, UpstreamTransportErrorKind,
    classify_failure,
};
pub use request::InboundRequest;
