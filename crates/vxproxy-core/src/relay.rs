use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tracing::warn;

use vxproxy_provider_core::{ByteStream, StreamError};

use crate::error::StreamTruncated;

/// Waits for the first chunk of a backend stream.
///
/// The stream is only handed to the caller once a chunk exists, so a backend
/// that fails or closes before sending anything can still be retried with
/// another credential.
pub async fn open(
    mut rx: ByteStream,
    trace_id: impl Into<String>,
) -> Result<RelayStream, StreamError> {
    match rx.recv().await {
        Some(Ok(first)) => Ok(RelayStream {
            trace_id: trace_id.into(),
            first: Some(first),
            rx,
            done: false,
        }),
        Some(Err(err)) => Err(err),
        None => Err(StreamError::Transport(
            "stream closed before the first chunk".to_string(),
        )),
    }
}

/// Backend chunks in arrival order, byte for byte.
///
/// Ends when the backend closes. A backend error ends it with one
/// `StreamTruncated` item, which aborts the caller's body.
pub struct RelayStream {
    trace_id: String,
    first: Option<Bytes>,
    rx: ByteStream,
    done: bool,
}

impl Stream for RelayStream {
    type Item = Result<Bytes, StreamTruncated>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(first) = this.first.take() {
            return Poll::Ready(Some(Ok(first)));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(err))) => {
                this.done = true;
                warn!(
                    event = "stream_truncated",
                    trace_id = %this.trace_id,
                    error = %err,
                );
                Poll::Ready(Some(Err(StreamTruncated(err))))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayStream")
            .field("trace_id", &self.trace_id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
