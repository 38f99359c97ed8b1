use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use tracing::{info, warn};

use vxproxy_provider_core::{
    AcquireError, Credential, CredentialId, CredentialPool, Event, EventHub, FailureClass,
    InboundRequest, Outcome, StreamError, UnavailableReason, UpstreamBody, UpstreamEvent,
    UpstreamFailure, UpstreamHttpRequest, UpstreamProvider, UpstreamTransportErrorKind,
    classify_failure,
};

use crate::auth::AuthProvider;
use crate::error::{AttemptFailure, DispatchError};
use crate::relay;
use crate::resolver::ProjectResolver;
use crate::upstream_client::UpstreamClient;

mod types;

pub use types::{ProxyBody, ProxyCall, ProxyResponse};

/// Id carried by caller-supplied keys, which live outside the pool.
const DETACHED_CREDENTIAL_ID: CredentialId = CredentialId::MAX;
const DETACHED_CACHE_LIMIT: usize = 1024;

struct UpstreamEventInput<'a> {
    trace_id: &'a str,
    credential_id: Option<CredentialId>,
    attempt_no: u32,
    request: &'a InboundRequest,
    upstream_req: &'a UpstreamHttpRequest,
    started: Instant,
    response_status: Option<u16>,
    error_kind: Option<&'static str>,
    error_message: Option<String>,
    transport_kind: Option<UpstreamTransportErrorKind>,
}

/// Authenticates callers, rotates pooled credentials and relays backend answers.
#[derive(Clone)]
pub struct ProxyEngine {
    pool: Arc<CredentialPool>,
    resolver: ProjectResolver,
    provider: Arc<dyn UpstreamProvider>,
    client: Arc<dyn UpstreamClient>,
    auth: Arc<dyn AuthProvider>,
    detached: Arc<Mutex<HashMap<String, Arc<Credential>>>>,
}

impl ProxyEngine {
    pub fn new(
        pool: Arc<CredentialPool>,
        provider: Arc<dyn UpstreamProvider>,
        client: Arc<dyn UpstreamClient>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let resolver =
            ProjectResolver::new(provider.clone(), client.clone(), pool.events().clone());
        Self {
            pool,
            resolver,
            provider,
            client,
            auth,
            detached: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn events(&self) -> &EventHub {
        self.pool.events()
    }

    pub fn resolver(&self) -> &ProjectResolver {
        &self.resolver
    }

    /// Serves a caller request from the credential pool.
    ///
    /// Each credential is tried at most once; the first usable backend answer
    /// wins. Caller mistakes are handed back without trying another credential.
    pub async fn dispatch(&self, call: ProxyCall) -> Result<ProxyResponse, DispatchError> {
        let ProxyCall {
            trace_id,
            presented_keys,
            request,
        } = call;

        let presented: Vec<&str> = presented_keys.iter().map(String::as_str).collect();
        if let Err(err) = self.auth.authenticate(&presented) {
            warn!(event = "downstream_rejected", trace_id = %trace_id, error = %err);
            return Err(err);
        }

        let max_attempts = self.pool.len();
        let mut excluded: HashSet<CredentialId> = HashSet::with_capacity(max_attempts);
        let mut last_failure: Option<String> = None;
        let mut attempts = 0usize;

        while attempts < max_attempts {
            let credential = match self.pool.select_candidate(&excluded).await {
                Ok(credential) => credential,
                Err(AcquireError::NoCandidateAvailable) => break,
            };
            let credential_id = credential.id();
            excluded.insert(credential_id);
            attempts += 1;

            let failure = match self
                .attempt(
                    &trace_id,
                    &request,
                    &credential,
                    Some(credential_id),
                    attempts as u32,
                )
                .await
            {
                Ok(resp) => {
                    self.pool.report_outcome(credential_id, Outcome::Success).await;
                    return Ok(resp);
                }
                Err(AttemptFailure::CallerInput(resp)) => return Ok(resp),
                Err(AttemptFailure::Rejected(err)) => return Err(err),
                Err(failure) => failure,
            };

            let outcome = attempt_outcome(&failure);
            self.pool.report_outcome(credential_id, outcome).await;
            let summary = failure.summary();
            warn!(
                event = "attempt_failed",
                trace_id = %trace_id,
                credential_id,
                attempt_no = attempts,
                outcome = ?outcome,
                error = %summary,
            );
            last_failure = Some(summary);
        }

        warn!(
            event = "pool_exhausted",
            trace_id = %trace_id,
            attempts,
            last_failure = last_failure.as_deref().unwrap_or(""),
        );
        Err(DispatchError::PoolExhausted {
            attempts,
            last_failure,
        })
    }

    /// Serves a request with a caller-supplied backend key.
    ///
    /// No rotation: backend answers, including failures, go back as they are.
    /// The project id cache is shared across requests that use the same key.
    pub async fn dispatch_detached(
        &self,
        trace_id: &str,
        api_key: Option<&str>,
        request: InboundRequest,
    ) -> Result<ProxyResponse, DispatchError> {
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(DispatchError::AuthenticationFailure(
                "missing x-vertex-express-key",
            ))?;
        let credential = self.detached_credential(api_key)?;

        match self.attempt(trace_id, &request, &credential, None, 1).await {
            Ok(resp) => Ok(resp),
            Err(AttemptFailure::CallerInput(resp)) => Ok(resp),
            Err(AttemptFailure::Rejected(err)) => Err(err),
            Err(AttemptFailure::CredentialResolution(err)) if err.is_fatal() => {
                Err(DispatchError::CredentialRejected(err.to_string()))
            }
            Err(AttemptFailure::CredentialResolution(err)) => {
                Err(DispatchError::UpstreamUnavailable(err.to_string()))
            }
            Err(AttemptFailure::RecoverableBackend {
                summary, response, ..
            }) => response.ok_or(DispatchError::UpstreamUnavailable(summary)),
            Err(AttemptFailure::FatalCredential {
                summary, response, ..
            }) => response.ok_or(DispatchError::CredentialRejected(summary)),
        }
    }

    fn detached_credential(&self, api_key: &str) -> Result<Arc<Credential>, DispatchError> {
        let mut guard = self.detached.lock().map_err(|_| {
            DispatchError::Internal("detached credential cache lock failed".to_string())
        })?;
        if let Some(credential) = guard.get(api_key) {
            return Ok(credential.clone());
        }
        if guard.len() >= DETACHED_CACHE_LIMIT {
            guard.clear();
        }
        let credential = Arc::new(Credential::new(DETACHED_CREDENTIAL_ID, api_key));
        guard.insert(api_key.to_string(), credential.clone());
        Ok(credential)
    }

    async fn attempt(
        &self,
        trace_id: &str,
        request: &InboundRequest,
        credential: &Credential,
        credential_id: Option<CredentialId>,
        attempt_no: u32,
    ) -> Result<ProxyResponse, AttemptFailure> {
        let project_id = match credential_id {
            Some(_) => self.resolver.resolve(credential).await,
            None => self.resolver.resolve_detached(credential).await,
        }
        .map_err(AttemptFailure::CredentialResolution)?;

        let upstream_req = self
            .provider
            .build_generate(request, credential.api_key(), project_id)
            .map_err(|err| AttemptFailure::Rejected(err.into()))?;

        let started = Instant::now();
        let event = |response_status: Option<u16>,
                     error_kind: Option<&'static str>,
                     error_message: Option<String>,
                     transport_kind: Option<UpstreamTransportErrorKind>| {
            UpstreamEventInput {
                trace_id,
                credential_id,
                attempt_no,
                request,
                upstream_req: &upstream_req,
                started,
                response_status,
                error_kind,
                error_message,
                transport_kind,
            }
        };

        let resp = match self.client.send(upstream_req.clone()).await {
            Ok(resp) => resp,
            Err(failure) => {
                self.emit_upstream_event(event(
                    None,
                    Some("transport"),
                    Some(failure.to_string()),
                    transport_kind_from_failure(&failure),
                ))
                .await;
                return Err(failure_from_class(classify_failure(&failure), &failure, None));
            }
        };

        let status = resp.status;
        if !(200..300).contains(&status) {
            let body = match resp.body {
                UpstreamBody::Bytes(body) => body,
                UpstreamBody::Stream(_) => Bytes::new(),
            };
            let failure = UpstreamFailure::Http {
                status,
                headers: resp.headers.clone(),
                body: body.clone(),
            };
            self.emit_upstream_event(event(
                Some(status),
                Some("http"),
                Some(failure.to_string()),
                None,
            ))
            .await;
            let passthrough = ProxyResponse::buffered(status, resp.headers, body);
            return Err(failure_from_class(
                classify_failure(&failure),
                &failure,
                Some(passthrough),
            ));
        }

        match resp.body {
            UpstreamBody::Bytes(body) => {
                self.emit_upstream_event(event(Some(status), None, None, None))
                    .await;
                let body = self.provider.finish_response(request, body);
                Ok(ProxyResponse::buffered(status, resp.headers, body))
            }
            UpstreamBody::Stream(rx) => match relay::open(rx, trace_id).await {
                Ok(stream) => {
                    self.emit_upstream_event(event(Some(status), None, None, None))
                        .await;
                    Ok(ProxyResponse {
                        status,
                        headers: resp.headers,
                        body: ProxyBody::Stream(stream),
                    })
                }
                Err(err) => {
                    self.emit_upstream_event(event(
                        Some(status),
                        Some("stream"),
                        Some(err.to_string()),
                        None,
                    ))
                    .await;
                    let reason = match err {
                        StreamError::ReadTimeout => UnavailableReason::Timeout,
                        StreamError::Transport(_) => UnavailableReason::Transport,
                    };
                    Err(AttemptFailure::RecoverableBackend {
                        reason,
                        summary: err.to_string(),
                        response: None,
                    })
                }
            },
        }
    }

    async fn emit_upstream_event(&self, input: UpstreamEventInput<'_>) {
        let elapsed_ms = input.started.elapsed().as_millis() as u64;
        info!(
            event = "upstream_attempt",
            trace_id = %input.trace_id,
            provider = self.provider.name(),
            credential_id = ?input.credential_id,
            attempt_no = input.attempt_no,
            model = %input.request.model,
            action = %input.request.action,
            status = ?input.response_status,
            error_kind = input.error_kind.unwrap_or(""),
            elapsed_ms,
        );
        self.pool
            .events()
            .emit(Event::Upstream(UpstreamEvent {
                trace_id: Some(input.trace_id.to_string()),
                at: SystemTime::now(),
                provider: self.provider.name().to_string(),
                credential_id: input.credential_id,
                attempt_no: input.attempt_no,
                model: input.request.model.clone(),
                action: input.request.action.clone(),
                request_method: input.upstream_req.method.as_str().to_string(),
                request_url: input.upstream_req.url.clone(),
                response_status: input.response_status,
                error_kind: input.error_kind.map(str::to_string),
                error_message: input.error_message,
                transport_kind: input.transport_kind,
                elapsed_ms,
            }))
            .await;
    }
}

fn attempt_outcome(failure: &AttemptFailure) -> Outcome {
    match failure {
        AttemptFailure::CredentialResolution(err) if err.is_fatal() => {
            Outcome::Fatal(UnavailableReason::ProjectUnresolved)
        }
        AttemptFailure::CredentialResolution(_) => {
            Outcome::Recoverable(UnavailableReason::ProjectUnresolved)
        }
        AttemptFailure::RecoverableBackend { reason, .. } => Outcome::Recoverable(*reason),
        AttemptFailure::FatalCredential { reason, .. } => Outcome::Fatal(*reason),
        AttemptFailure::CallerInput(_) | AttemptFailure::Rejected(_) => Outcome::Success,
    }
}

fn failure_from_class(
    class: FailureClass,
    failure: &UpstreamFailure,
    response: Option<ProxyResponse>,
) -> AttemptFailure {
    match class {
        FailureClass::Recoverable(reason) => AttemptFailure::RecoverableBackend {
            reason,
            summary: failure.to_string(),
            response,
        },
        FailureClass::Fatal(reason) => AttemptFailure::FatalCredential {
            reason,
            summary: failure.to_string(),
            response,
        },
        FailureClass::CallerInput => match response {
            Some(resp) => AttemptFailure::CallerInput(resp),
            None => AttemptFailure::RecoverableBackend {
                reason: UnavailableReason::Transport,
                summary: failure.to_string(),
                response: None,
            },
        },
    }
}

fn transport_kind_from_failure(failure: &UpstreamFailure) -> Option<UpstreamTransportErrorKind> {
    match failure {
        UpstreamFailure::Transport { kind, .. } => Some(*kind),
        _ => None,
    }
}
