use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Extension, Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use tracing::info;

use vxproxy_core::{DispatchError, ProxyBody, ProxyCall, ProxyEngine, ProxyResponse};
use vxproxy_provider_core::{Headers, HttpMethod, InboundRequest};

/// Header carrying a caller's own backend key on the frontend routes.
const DIRECT_KEY_HEADER: &str = "x-vertex-express-key";

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<ProxyEngine>,
}

#[derive(Clone)]
struct RequestTraceId(String);

/// Gateway keys the caller presented, taken out of the request before routing.
#[derive(Clone)]
struct PresentedKeys(Vec<String>);

pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    let state = ProxyState { engine };

    Router::new()
        .route("/v1beta/models/{*name}", post(gemini_post))
        .route("/v1/models/{*name}", post(gemini_post))
        .route("/frontend/v1beta/models/{*name}", post(frontend_post))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn(downstream_context))
        .with_state(state)
}

async fn downstream_context(mut req: axum::http::Request<Body>, next: Next) -> Response {
    let trace_id = uuid::Uuid::now_v7().to_string();
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // Extract before stripping.
    let keys = extract_user_keys(req.headers(), req.uri().query());

    // Downstream auth material never reaches handlers, the backend or logs.
    strip_downstream_auth_headers(req.headers_mut());
    strip_downstream_auth_query(req.uri_mut());
    req.extensions_mut()
        .insert(RequestTraceId(trace_id.clone()));
    req.extensions_mut().insert(PresentedKeys(keys));

    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        method = %method,
        path = %path,
    );
    let resp = next.run(req).await;
    info!(
        event = "downstream_responded",
        trace_id = %trace_id,
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
    );
    resp
}

fn strip_downstream_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-goog-api-key");
}

fn strip_downstream_auth_query(uri: &mut axum::http::Uri) {
    let Some(q) = uri.query() else { return };

    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(q) else {
        return;
    };

    let filtered: Vec<(String, String)> = pairs.into_iter().filter(|(k, _)| k != "key").collect();

    let new_q = match serde_urlencoded::to_string(&filtered) {
        Ok(s) => s,
        Err(_) => return,
    };

    let path = uri.path();
    let new_uri_str = if new_q.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{new_q}")
    };
    if let Ok(new_uri) = new_uri_str.parse() {
        *uri = new_uri;
    }
}

/// Gateway keys come from `?key=` and `x-goog-api-key`, like the Gemini API.
/// Both are kept; a caller passes if either one matches.
fn extract_user_keys(headers: &HeaderMap, query: Option<&str>) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(q) = query
        && let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(q)
        && let Some(key) = pairs
            .into_iter()
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    {
        keys.push(key);
    }

    if let Some(value) = headers
        .get("x-goog-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        keys.push(value.to_string());
    }
    keys
}

async fn gemini_post(
    State(state): State<ProxyState>,
    Extension(trace_id): Extension<RequestTraceId>,
    Extension(keys): Extension<PresentedKeys>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match inbound_request(&name, query, &headers, body) {
        Ok(request) => request,
        Err(err) => return to_axum_response(err.into_response()),
    };
    let call = ProxyCall {
        trace_id: trace_id.0,
        presented_keys: keys.0,
        request,
    };
    match state.engine.dispatch(call).await {
        Ok(resp) => to_axum_response(resp),
        Err(err) => to_axum_response(err.into_response()),
    }
}

async fn frontend_post(
    State(state): State<ProxyState>,
    Extension(trace_id): Extension<RequestTraceId>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let direct_key = headers
        .get(DIRECT_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let request = match inbound_request(&name, query, &headers, body) {
        Ok(request) => request,
        Err(err) => return to_axum_response(err.into_response()),
    };
    match state
        .engine
        .dispatch_detached(&trace_id.0, direct_key.as_deref(), request)
        .await
    {
        Ok(resp) => to_axum_response(resp),
        Err(err) => to_axum_response(err.into_response()),
    }
}

async fn healthz(State(state): State<ProxyState>) -> Response {
    let snapshot = state.engine.pool().snapshot().await;
    let status = if snapshot.disabled < snapshot.credentials {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot)).into_response()
}

/// Splits `{model}:{action}` from the path tail.
fn inbound_request(
    name: &str,
    query: Option<String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<InboundRequest, DispatchError> {
    let name = name.trim_start_matches('/');
    let Some((model, action)) = name.rsplit_once(':') else {
        return Err(DispatchError::InvalidRequest(format!(
            "expected models/{{model}}:{{action}}, got `{name}`"
        )));
    };
    let (model, action) = (model.trim(), action.trim());
    if model.is_empty() || action.is_empty() {
        return Err(DispatchError::InvalidRequest(
            "empty model or action".to_string(),
        ));
    }
    Ok(InboundRequest {
        method: HttpMethod::Post,
        model: model.to_string(),
        action: action.to_string(),
        query: query.filter(|q| !q.is_empty()),
        headers: headers_to_vec(headers),
        body,
    })
}

fn to_axum_response(resp: ProxyResponse) -> Response {
    let is_stream = resp.is_stream();
    let mut builder = Response::builder().status(resp.status);
    if let Some(h) = builder.headers_mut() {
        for (k, v) in resp.headers {
            // Drop hop-by-hop and framing headers. Hyper sets framing itself.
            if is_hop_by_hop_or_framing_header(&k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                h.append(name, value);
            }
        }
        if is_stream {
            // Hint common reverse proxies to avoid buffering SSE responses.
            h.entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            h.entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }

    let body = match resp.body {
        ProxyBody::Bytes(b) => Body::from(b),
        ProxyBody::Stream(relay) => Body::from_stream(relay),
    };

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("content-encoding")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    let mut out: Headers = Vec::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.push((name.as_str().to_string(), v.to_string()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_and_header_keys_are_both_collected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("from-header"));
        assert_eq!(
            extract_user_keys(&headers, Some("alt=sse&key=from-query")),
            vec!["from-query", "from-header"]
        );
        assert_eq!(
            extract_user_keys(&headers, Some("alt=sse")),
            vec!["from-header"]
        );
        assert!(extract_user_keys(&HeaderMap::new(), Some("key=%20")).is_empty());
        assert!(extract_user_keys(&HeaderMap::new(), None).is_empty());
    }

    #[test]
    fn key_is_removed_from_query() {
        let mut uri: axum::http::Uri = "/v1beta/models/m:generateContent?key=s&alt=sse"
            .parse()
            .unwrap();
        strip_downstream_auth_query(&mut uri);
        assert_eq!(uri.query(), Some("alt=sse"));

        let mut uri: axum::http::Uri = "/v1beta/models/m:generateContent?key=s".parse().unwrap();
        strip_downstream_auth_query(&mut uri);
        assert_eq!(uri.query(), None);
    }

    #[test]
    fn model_and_action_are_split_on_the_last_colon() {
        let req = inbound_request(
            "tunedModels/x:1:generateContent",
            None,
            &HeaderMap::new(),
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(req.model, "tunedModels/x:1");
        assert_eq!(req.action, "generateContent");

        assert!(inbound_request("gemini-2.5-pro", None, &HeaderMap::new(), Bytes::new()).is_err());
        assert!(
            inbound_request(":generateContent", None, &HeaderMap::new(), Bytes::new()).is_err()
        );
    }
}
