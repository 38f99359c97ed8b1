use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use tokio::sync::oneshot;
use tokio::time::timeout;

use vxproxy_core::spawn_stream_pump;
use vxproxy_provider_core::StreamError;

/// One chunk, then silence. `released` resolves when the stream is dropped.
fn chunk_then_silence() -> (
    impl futures_util::Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
    oneshot::Receiver<()>,
) {
    let (guard, released) = oneshot::channel::<()>();
    let body = stream::once(async { Ok(Bytes::from_static(b"data: 1\n\n")) })
        .chain(stream::pending())
        .map(move |item| {
            let _held = &guard;
            item
        });
    (body, released)
}

fn unreachable_error(never: Infallible) -> StreamError {
    match never {}
}

#[tokio::test]
async fn dropped_receiver_releases_a_silent_backend() {
    let (body, released) = chunk_then_silence();
    let mut rx = spawn_stream_pump(body, Duration::from_secs(300), unreachable_error);

    let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(first.unwrap().unwrap(), Bytes::from_static(b"data: 1\n\n"));

    drop(rx);
    // The backend never sends another chunk, so only the receiver closing can end the task.
    let dropped = timeout(Duration::from_secs(1), released).await;
    assert!(dropped.is_ok(), "backend stream still held after the caller left");
}

#[tokio::test]
async fn silence_past_the_idle_timeout_is_a_read_timeout() {
    let (body, released) = chunk_then_silence();
    let mut rx = spawn_stream_pump(body, Duration::from_millis(50), unreachable_error);

    assert!(rx.recv().await.unwrap().is_ok());
    assert!(matches!(rx.recv().await, Some(Err(StreamError::ReadTimeout))));
    assert!(rx.recv().await.is_none());
    assert!(timeout(Duration::from_secs(1), released).await.is_ok());
}

#[tokio::test]
async fn chunks_and_errors_are_forwarded_in_order() {
    let body = stream::iter(vec![
        Ok(Bytes::from_static(b"a")),
        Ok(Bytes::from_static(b"b")),
        Err("reset"),
        Ok(Bytes::from_static(b"never")),
    ]);
    let mut rx = spawn_stream_pump(body, Duration::from_secs(5), |err: &str| {
        StreamError::Transport(err.to_string())
    });

    assert_eq!(rx.recv().await.unwrap().unwrap(), "a");
    assert_eq!(rx.recv().await.unwrap().unwrap(), "b");
    assert!(matches!(
        rx.recv().await,
        Some(Err(StreamError::Transport(ref msg))) if msg == "reset"
    ));
    assert!(rx.recv().await.is_none());
}
