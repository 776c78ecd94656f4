//! Stream bridge: forward Anthropic SSE to the client while collecting usage.
//!
//! [`tee_usage_stream`] spawns a pump task that:
//! 1. Forwards every upstream chunk to the client through an mpsc channel
//! 2. Feeds the same bytes to a [`StreamingUsageCollector`]
//! 3. Resolves a [`StreamOutcome`] when the upstream ends or the client leaves
//!
//! The pump owns the upstream, so usage seen before a disconnect is still
//! reported.

use std::time::Instant;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::models::messages::Usage;
use crate::proxy::adapter::{ByteStream, StreamError};
use crate::proxy::converse::stream::to_sse;
use crate::proxy::streaming_usage::StreamingUsageCollector;

/// What the pump saw by the time it stopped.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub usage: Option<Usage>,
    pub ttft_ms: Option<u64>,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub client_disconnected: bool,
    pub upstream_error: Option<String>,
}

/// Anthropic `error` event sent when the upstream fails mid-stream; the
/// status line is already gone by then.
fn error_event(err: &StreamError) -> Bytes {
    let error_type = match err {
        StreamError::Exception { kind, .. } if kind.contains("throttling") => "rate_limit_error",
        _ => "api_error",
    };
    to_sse(&json!({
        "type": "error",
        "error": { "type": error_type, "message": err.to_string() },
    }))
}

/// Tee `upstream` into a response body and a usage outcome.
///
/// `start` is the request start, used for time-to-first-byte.
pub fn tee_usage_stream(
    mut upstream: ByteStream,
    start: Instant,
    request_id: String,
) -> (Body, oneshot::Receiver<StreamOutcome>) {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(1024);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut collector = StreamingUsageCollector::new();
        let mut outcome = StreamOutcome::default();

        while let Some(item) = upstream.next().await {
            match item {
                Ok(bytes) => {
                    if outcome.ttft_ms.is_none() {
                        outcome.ttft_ms = Some(start.elapsed().as_millis() as u64);
                    }
                    collector.feed(&bytes);
                    let len = bytes.len() as u64;

                    if tx.send(Ok(bytes)).await.is_err() {
                        outcome.client_disconnected = true;
                        tracing::info!(
                            request_id = %request_id,
                            chunks_sent = outcome.chunks_sent,
                            bytes_sent = outcome.bytes_sent,
                            "streaming_client_disconnected"
                        );
                        break;
                    }
                    outcome.chunks_sent += 1;
                    outcome.bytes_sent += len;
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        error = %e,
                        chunks_sent = outcome.chunks_sent,
                        "streaming_upstream_error"
                    );
                    let _ = tx.send(Ok(error_event(&e))).await;
                    outcome.upstream_error = Some(e.to_string());
                    break;
                }
            }
        }

        outcome.usage = collector.get_usage();
        let _ = done_tx.send(outcome);
    });

    (Body::from_stream(ReceiverStream::new(rx)), done_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn sse(parts: &[&str]) -> ByteStream {
        let items: Vec<Result<Bytes, StreamError>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_forwards_bytes_and_collects_usage() {
        let upstream = sse(&[
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12}}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n\n",
        ]);
        let (body, done) = tee_usage_stream(upstream, Instant::now(), "req_test".into());

        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("message_delta"));

        let outcome = done.await.unwrap();
        let usage = outcome.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(outcome.chunks_sent, 2);
        assert!(!outcome.client_disconnected);
        assert!(outcome.ttft_ms.is_some());
    }

    #[tokio::test]
    async fn test_upstream_error_becomes_error_event() {
        let items: Vec<Result<Bytes, StreamError>> = vec![
            Ok(Bytes::from_static(b"event: ping\ndata: {\"type\":\"ping\"}\n\n")),
            Err(StreamError::Exception {
                kind: "throttlingException".into(),
                message: "slow down".into(),
            }),
        ];
        let (body, done) = tee_usage_stream(stream::iter(items).boxed(), Instant::now(), "req_e".into());

        let text = String::from_utf8(axum::body::to_bytes(body, usize::MAX).await.unwrap().to_vec()).unwrap();
        assert!(text.contains("event: error"));
        assert!(text.contains("rate_limit_error"));

        let outcome = done.await.unwrap();
        assert!(outcome.usage.is_none());
        assert!(outcome.upstream_error.is_some());
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_pump() {
        let upstream = sse(&[
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3}}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":1}}\n\n",
        ]);
        let (body, done) = tee_usage_stream(upstream, Instant::now(), "req_d".into());
        drop(body);

        let outcome = done.await.unwrap();
        assert!(outcome.client_disconnected);
        assert_eq!(outcome.chunks_sent, 0);
        assert!(outcome.usage.is_none());
    }
}
