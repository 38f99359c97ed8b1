use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use wreq::{Client, Method, Proxy};

use vxproxy_common::GlobalConfig;
use vxproxy_provider_core::{
    ByteStream, Headers, HttpMethod, StreamError, StreamItem, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind,
};

/// Performs backend IO. Non-2xx answers come back as `Ok` with a buffered body;
/// only transport problems are `Err`.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Deadline for response headers.
    pub call_timeout: Duration,
    /// Longest silence tolerated between two stream chunks.
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            proxy: global.proxy.clone(),
            connect_timeout: Duration::from_secs(10),
            call_timeout: global.call_timeout,
            stream_idle_timeout: global.stream_idle_timeout,
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = normalize_proxy(config.proxy.clone());
        let client = build_client(&config, proxy.as_deref())?;
        Ok(Self { config, client })
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.stream_idle_timeout);

    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let method = http_method_to_wreq(req.method);
            let mut builder = self.client.request(method, &req.url);

            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }

            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = match tokio::time::timeout(self.config.call_timeout, builder.send()).await
            {
                Ok(result) => result.map_err(map_wreq_error)?,
                Err(_) => {
                    return Err(UpstreamFailure::Transport {
                        kind: UpstreamTransportErrorKind::Timeout,
                        message: format!(
                            "no response headers within {}s",
                            self.config.call_timeout.as_secs()
                        ),
                    });
                }
            };
            convert_response(resp, req.is_stream, self.config.stream_idle_timeout).await
        })
    }
}

fn http_method_to_wreq(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let rx = spawn_stream_pump(resp.bytes_stream(), stream_idle_timeout, |err| {
        if classify_wreq_error(&err) == UpstreamTransportErrorKind::ReadTimeout {
            StreamError::ReadTimeout
        } else {
            StreamError::Transport(err.to_string())
        }
    });

    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

/// Forwards a backend body stream into a channel from a spawned task.
///
/// The task stops at the end of the stream, after the first error, after
/// `idle_timeout` without a chunk, or as soon as the receiver is dropped. Stopping
/// drops `stream`, which releases the backend connection.
pub fn spawn_stream_pump<S, E, F>(stream: S, idle_timeout: Duration, map_err: F) -> ByteStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
    F: Fn(E) -> StreamError + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<StreamItem>(16);
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            let next = tokio::select! {
                _ = tx.closed() => break,
                next = tokio::time::timeout(idle_timeout, stream.next()) => next,
            };
            let item = match next {
                Ok(Some(Ok(chunk))) => Ok(chunk),
                Ok(Some(Err(err))) => {
                    let _ = tx.send(Err(map_err(err))).await;
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    let _ = tx.send(Err(StreamError::ReadTimeout)).await;
                    break;
                }
            };
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    let kind = classify_wreq_error(&err);
    UpstreamFailure::Transport {
        kind,
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return UpstreamTransportErrorKind::ReadTimeout;
        }
        return UpstreamTransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return UpstreamTransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return UpstreamTransportErrorKind::Tls;
        }
        return UpstreamTransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return UpstreamTransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return UpstreamTransportErrorKind::Tls;
    }
    UpstreamTransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_proxy_is_ignored() {
        assert_eq!(normalize_proxy(Some("  ".to_string())), None);
        assert_eq!(
            normalize_proxy(Some(" http://127.0.0.1:8080 ".to_string())).as_deref(),
            Some("http://127.0.0.1:8080")
        );
    }

    #[test]
    fn config_follows_global_timeouts() {
        let global = vxproxy_common::GlobalConfigPatch {
            backend_keys: Some(vec!["k".to_string()]),
            call_timeout: Some(Duration::from_secs(7)),
            ..Default::default()
        }
        .into_config()
        .unwrap();
        let config = UpstreamClientConfig::from_global(&global);
        assert_eq!(config.call_timeout, Duration::from_secs(7));
        assert_eq!(config.stream_idle_timeout, Duration::from_secs(300));
    }
}
