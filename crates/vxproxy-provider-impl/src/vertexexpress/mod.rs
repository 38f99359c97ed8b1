pub mod project;
pub mod rewrite;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tracing::debug;

use vxproxy_common::{DEFAULT_BASE_URL, DEFAULT_LOCATION, DEFAULT_PROBE_MODEL, GlobalConfig};
use vxproxy_provider_core::{
    Credential, Headers, HttpMethod, InboundRequest, ProviderError, ProviderResult, ResolveError,
    UpstreamHttpRequest, UpstreamProvider, header_get, header_set,
};

use self::rewrite::RewriteTable;

const PROVIDER_NAME: &str = "vertexexpress";
const BACKEND_KEY_HEADER: &str = "x-goog-api-key";
const BODY_REWRITE_ACTIONS: [&str; 2] = ["generateContent", "streamGenerateContent"];

/// Caller headers that never reach the backend.
const STRIPPED_HEADERS: [&str; 15] = [
    "host",
    "content-length",
    "accept-encoding",
    "authorization",
    "x-goog-api-key",
    "x-vertex-express-key",
    "x-api-key",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexExpressConfig {
    pub base_url: String,
    pub location: String,
    pub probe_model: String,
}

impl Default for VertexExpressConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            probe_model: DEFAULT_PROBE_MODEL.to_string(),
        }
    }
}

impl VertexExpressConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            base_url: global.base_url.clone(),
            location: global.location.clone(),
            probe_model: global.probe_model.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexExpressProvider {
    config: VertexExpressConfig,
    rewrites: RewriteTable,
}

impl VertexExpressProvider {
    pub fn new(config: VertexExpressConfig) -> Self {
        Self::with_rewrites(config, RewriteTable::vertex_defaults())
    }

    pub fn with_rewrites(config: VertexExpressConfig, rewrites: RewriteTable) -> Self {
        Self { config, rewrites }
    }

    pub fn config(&self) -> &VertexExpressConfig {
        &self.config
    }

    fn rewrite_body(
        &self,
        model: &str,
        action: &str,
        body: &Bytes,
    ) -> ProviderResult<(String, Bytes)> {
        if !BODY_REWRITE_ACTIONS.contains(&action) {
            return Ok((self.rewrites.resolve_model(model), body.clone()));
        }
        // Bodies that are not a JSON object are proxied as is.
        let Ok(JsonValue::Object(mut map)) = serde_json::from_slice::<JsonValue>(body) else {
            debug!(model, action, "request body is not a JSON object; forwarding unchanged");
            return Ok((self.rewrites.resolve_model(model), body.clone()));
        };
        let model = self.rewrites.apply(model, &mut map);
        let body = serde_json::to_vec(&JsonValue::Object(map))
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok((model, Bytes::from(body)))
    }
}

impl Default for VertexExpressProvider {
    fn default() -> Self {
        Self::new(VertexExpressConfig::default())
    }
}

impl UpstreamProvider for VertexExpressProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn build_project_probe(&self, credential: &Credential) -> ProviderResult<UpstreamHttpRequest> {
        let url = build_url(
            &self.config.base_url,
            &format!(
                "/v1/publishers/google/models/{}:generateContent",
                self.config.probe_model
            ),
        );
        let mut headers = Vec::new();
        set_content_type_json(&mut headers);
        header_set(&mut headers, BACKEND_KEY_HEADER, credential.api_key());
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(Bytes::from_static(b"{}")),
            is_stream: false,
        })
    }

    fn parse_project_probe(&self, status: u16, body: &[u8]) -> Result<String, ResolveError> {
        project::parse_probe(status, body)
    }

    fn build_generate(
        &self,
        req: &InboundRequest,
        api_key: &str,
        project_id: &str,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let model = vertexexpress_model(&req.model);
        if model.is_empty() || req.action.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "missing model or action".to_string(),
            ));
        }
        let (model, body) = self.rewrite_body(model, &req.action, &req.body)?;

        let path = format!(
            "/v1/projects/{project_id}/locations/{}/publishers/google/models/{model}:{}",
            self.config.location, req.action
        );
        let url = build_url(&self.config.base_url, &path);
        let query = forward_query(req.query.as_deref(), req.is_stream());
        let url = append_query(&url, query.as_deref());

        let mut headers = forward_headers(&req.headers);
        if header_get(&headers, "content-type").is_none() {
            set_content_type_json(&mut headers);
        }
        header_set(&mut headers, BACKEND_KEY_HEADER, api_key);

        Ok(UpstreamHttpRequest {
            method: req.method,
            url,
            headers,
            body: Some(body),
            is_stream: req.is_stream(),
        })
    }

    fn finish_response(&self, req: &InboundRequest, body: Bytes) -> Bytes {
        if req.is_stream() {
            return body;
        }
        drop_empty_parts(body)
    }
}

fn vertexexpress_model(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model).trim()
}

/// Keeps the caller's query minus its `key`; streaming calls always ask for SSE.
fn forward_query(query: Option<&str>, is_stream: bool) -> Option<String> {
    let mut pairs: Vec<(String, String)> = query
        .filter(|q| !q.is_empty())
        .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
        .unwrap_or_default();
    pairs.retain(|(k, _)| k != "key" && !(is_stream && k == "alt"));
    if is_stream {
        pairs.push(("alt".to_string(), "sse".to_string()));
    }
    if pairs.is_empty() {
        return None;
    }
    serde_urlencoded::to_string(&pairs).ok()
}

fn forward_headers(inbound: &Headers) -> Headers {
    inbound
        .iter()
        .filter(|(name, _)| {
            !STRIPPED_HEADERS
                .iter()
                .any(|blocked| name.eq_ignore_ascii_case(blocked))
        })
        .cloned()
        .collect()
}

/// Removes empty entries from `candidates[*].content.parts`.
fn drop_empty_parts(body: Bytes) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<JsonValue>(&body) else {
        return body;
    };
    let Some(candidates) = value
        .get_mut("candidates")
        .and_then(JsonValue::as_array_mut)
    else {
        return body;
    };
    for candidate in candidates.iter_mut() {
        if let Some(parts) = candidate
            .get_mut("content")
            .and_then(|content| content.get_mut("parts"))
            .and_then(JsonValue::as_array_mut)
        {
            parts.retain(|part| !is_empty_part(part));
        }
    }
    match serde_json::to_vec(&value) {
        Ok(out) => Bytes::from(out),
        Err(_) => body,
    }
}

/// Null, `false`, zero and empty strings, arrays or objects carry nothing.
fn is_empty_part(part: &JsonValue) -> bool {
    match part {
        JsonValue::Null => true,
        JsonValue::Bool(flag) => !flag,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(text) => text.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
    }
}

fn set_content_type_json(headers: &mut Headers) {
    header_set(headers, "content-type", "application/json");
}

fn append_query(url: &str, query: Option<&str>) -> String {
    let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) else {
        return url.to_string();
    };
    if url.contains('?') {
        format!("{url}&{query}")
    } else {
        format!("{url}?{query}")
    }
}

fn build_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") && (path == "v1" || path.starts_with("v1/")) {
        path = path.trim_start_matches("v1/").trim_start_matches("v1");
    }
    format!("{base}/{path}")
}
