use bytes::Bytes;

use vxproxy_provider_core::{Headers, InboundRequest};

use crate::relay::RelayStream;

/// One routed caller request.
#[derive(Debug, Clone)]
pub struct ProxyCall {
    pub trace_id: String,
    /// Keys the caller presented to the gateway (query first, then header),
    /// already removed from `request`.
    pub presented_keys: Vec<String>,
    pub request: InboundRequest,
}

#[derive(Debug)]
pub enum ProxyBody {
    Bytes(Bytes),
    Stream(RelayStream),
}

/// What goes back to the caller: a backend answer or a gateway error.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: ProxyBody,
}

impl ProxyResponse {
    pub fn buffered(status: u16, headers: Headers, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body: ProxyBody::Bytes(body),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.body, ProxyBody::Stream(_))
    }
}
