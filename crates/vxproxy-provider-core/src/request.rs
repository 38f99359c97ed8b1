use bytes::Bytes;

use crate::{Headers, HttpMethod};

pub const STREAM_ACTION: &str = "streamGenerateContent";

/// A caller request after routing: `/v1beta/models/{model}:{action}`.
///
/// Downstream auth material has already been stripped from `headers` and `query`.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: HttpMethod,
    pub model: String,
    pub action: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn is_stream(&self) -> bool {
        self.action == STREAM_ACTION
    }
}
