use std::sync::Arc;
use std::time::SystemTime;

use tracing::{info, warn};

use vxproxy_provider_core::{
    Credential, CredentialId, Event, EventHub, OperationalEvent, ProjectResolvedEvent,
    ResolveError, UpstreamBody, UpstreamProvider,
};

use crate::upstream_client::UpstreamClient;

/// Maps a credential to its Vertex project id, probing the backend at most
/// once per credential.
#[derive(Clone)]
pub struct ProjectResolver {
    provider: Arc<dyn UpstreamProvider>,
    client: Arc<dyn UpstreamClient>,
    events: EventHub,
}

impl ProjectResolver {
    pub fn new(
        provider: Arc<dyn UpstreamProvider>,
        client: Arc<dyn UpstreamClient>,
        events: EventHub,
    ) -> Self {
        Self {
            provider,
            client,
            events,
        }
    }

    /// Resolves a pooled credential.
    pub async fn resolve<'c>(&self, credential: &'c Credential) -> Result<&'c str, ResolveError> {
        self.resolve_inner(credential, Some(credential.id())).await
    }

    /// Resolves a caller-supplied key that is not part of the pool.
    pub async fn resolve_detached<'c>(
        &self,
        credential: &'c Credential,
    ) -> Result<&'c str, ResolveError> {
        self.resolve_inner(credential, None).await
    }

    async fn resolve_inner<'c>(
        &self,
        credential: &'c Credential,
        credential_id: Option<CredentialId>,
    ) -> Result<&'c str, ResolveError> {
        credential
            .project_id_or_try_init(|| self.derive(credential, credential_id))
            .await
    }

    async fn derive(
        &self,
        credential: &Credential,
        credential_id: Option<CredentialId>,
    ) -> Result<String, ResolveError> {
        let probe = self
            .provider
            .build_project_probe(credential)
            .map_err(|err| ResolveError::Unresolvable(err.to_string()))?;

        let resp = match self.client.send(probe).await {
            Ok(resp) => resp,
            Err(failure) => {
                warn!(
                    event = "project_probe_failed",
                    credential_id = ?credential_id,
                    key = %credential.masked(),
                    error = %failure,
                );
                return Err(ResolveError::Transient(failure.to_string()));
            }
        };
        let body = match resp.body {
            UpstreamBody::Bytes(body) => body,
            UpstreamBody::Stream(_) => {
                return Err(ResolveError::Unresolvable(
                    "probe answered with a stream".to_string(),
                ));
            }
        };

        let project_id = match self.provider.parse_project_probe(resp.status, &body) {
            Ok(project_id) => project_id,
            Err(err) => {
                warn!(
                    event = "project_probe_failed",
                    credential_id = ?credential_id,
                    key = %credential.masked(),
                    status = resp.status,
                    error = %err,
                );
                return Err(err);
            }
        };

        info!(
            event = "project_resolved",
            credential_id = ?credential_id,
            key = %credential.masked(),
            project_id = %project_id,
        );
        self.events
            .emit(Event::Operational(OperationalEvent::ProjectResolved(
                ProjectResolvedEvent {
                    at: SystemTime::now(),
                    credential_id,
                    project_id: project_id.clone(),
                },
            )))
            .await;
        Ok(project_id)
    }
}
