use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use vxproxy_common::{GlobalConfig, GlobalConfigPatch, split_key_list};
use vxproxy_provider_core::{CredentialPool, EventHub, TerminalEventSink};
use vxproxy_provider_impl::{VertexExpressConfig, VertexExpressProvider};

use crate::auth::auth_from_secret;
use crate::proxy_engine::ProxyEngine;
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "vxproxy",
    version,
    about = "Gemini API gateway rotating Vertex AI Express keys"
)]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "VXPROXY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "PORT")]
    pub port: Option<String>,

    /// Shared secret callers must present. Caller auth is off when unset.
    #[arg(long, env = "PROXY_API_KEY")]
    pub proxy_api_key: Option<String>,

    /// Comma-separated Vertex Express API keys.
    #[arg(long, env = "VERTEX_EXPRESS_KEYS")]
    pub vertex_express_keys: Option<String>,

    /// Backend base URL.
    #[arg(long, env = "VXPROXY_BASE_URL")]
    pub base_url: Option<String>,

    /// Vertex location used in backend URLs.
    #[arg(long, env = "VXPROXY_LOCATION")]
    pub location: Option<String>,

    /// Model named by the project id probe.
    #[arg(long, env = "VXPROXY_PROBE_MODEL")]
    pub probe_model: Option<String>,

    /// Seconds to wait for backend response headers.
    #[arg(long, env = "VXPROXY_CALL_TIMEOUT_SECS")]
    pub call_timeout_secs: Option<String>,

    /// Seconds a backend stream may stay silent.
    #[arg(long, env = "VXPROXY_STREAM_IDLE_TIMEOUT_SECS")]
    pub stream_idle_timeout_secs: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "VXPROXY_PROXY")]
    pub proxy: Option<String>,
}

pub struct Bootstrap {
    pub global: GlobalConfig,
    pub engine: Arc<ProxyEngine>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    // clap already applies CLI > ENV per field; defaults fill the rest.
    let global = patch_from_args(args)?
        .into_config()
        .context("finalize global config")?;

    let events = EventHub::new(1024);
    events
        .add_sink(Arc::new(TerminalEventSink::operational_only()))
        .await;

    let pool = Arc::new(
        CredentialPool::new(global.backend_keys.iter().cloned(), events)
            .context("build credential pool")?,
    );
    let provider = Arc::new(VertexExpressProvider::new(VertexExpressConfig::from_global(
        &global,
    )));
    let client = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::from_global(&global))
            .context("build upstream client")?,
    );
    let auth = auth_from_secret(global.proxy_api_key.as_deref());

    info!(
        host = %global.host,
        port = global.port,
        credentials = pool.len(),
        caller_auth = global.proxy_api_key.is_some(),
        base_url = %global.base_url,
        location = %global.location,
        proxy = %global.proxy.as_deref().unwrap_or(""),
        "config loaded"
    );

    let engine = Arc::new(ProxyEngine::new(pool, provider, client, auth));
    Ok(Bootstrap { global, engine })
}

pub fn patch_from_args(args: CliArgs) -> anyhow::Result<GlobalConfigPatch> {
    Ok(GlobalConfigPatch {
        host: sanitize_optional_env_value(args.host),
        port: parse_u16_env_value(args.port, "PORT")?,
        proxy_api_key: sanitize_optional_env_value(args.proxy_api_key),
        backend_keys: sanitize_optional_env_value(args.vertex_express_keys)
            .map(|raw| split_key_list(&raw)),
        base_url: sanitize_optional_env_value(args.base_url),
        location: sanitize_optional_env_value(args.location),
        probe_model: sanitize_optional_env_value(args.probe_model),
        call_timeout: parse_secs_env_value(args.call_timeout_secs, "VXPROXY_CALL_TIMEOUT_SECS")?,
        stream_idle_timeout: parse_secs_env_value(
            args.stream_idle_timeout_secs,
            "VXPROXY_STREAM_IDLE_TIMEOUT_SECS",
        )?,
        proxy: sanitize_optional_env_value(args.proxy),
    })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems may inject unresolved placeholders like `${VAR}`.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_secs_env_value(
    value: Option<String>,
    env_name: &str,
) -> anyhow::Result<Option<Duration>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let secs = raw
        .parse::<u64>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    if secs == 0 {
        return Err(anyhow::anyhow!("{env_name} must be greater than zero"));
    }
    Ok(Some(Duration::from_secs(secs)))
}
