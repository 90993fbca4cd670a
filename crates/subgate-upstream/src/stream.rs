use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use subgate_common::CacheTtlOverride;
use subgate_protocol::{
    ClaudeUsage, SseEvent, SseParser, StreamUsageEvent, encode_sse_event, is_done_marker,
    rewrite_event_cache_buckets, usage_from_stream_event,
};

use crate::client::StreamHandle;

/// Why the relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamReason {
    Completed,
    Timeout,
    ReadError,
    Overflow,
}

impl StreamReason {
    /// Fixed reason codes allowed to leak into the client-visible error
    /// frame. Raw upstream error text never does.
    fn code(self) -> &'static str {
        match self {
            StreamReason::Completed => "stream_end",
            StreamReason::Timeout => "stream_timeout",
            StreamReason::ReadError => "stream_read_error",
            StreamReason::Overflow => "response_too_large",
        }
    }
}

#[derive(Debug)]
pub(crate) struct StreamStats {
    pub usage: ClaudeUsage,
    pub first_token_ms: Option<u64>,
    pub client_disconnect: bool,
    pub reason: StreamReason,
}

pub(crate) struct StreamParams {
    pub sink: mpsc::Sender<Bytes>,
    pub cache_ttl: CacheTtlOverride,
    pub idle_timeout: Duration,
    pub line_buffer_max: usize,
}

/// Writer loop: consume the reader fiber's channel, decode events, track
/// usage and first-token latency, enforce the idle watchdog, and relay
/// whole event blocks to the client.
///
/// A client write failure flips `client_disconnect` but never stops the
/// drain: usage accounting needs the rest of the upstream stream.
pub(crate) async fn relay_stream(handle: StreamHandle, params: StreamParams) -> StreamStats {
    let StreamHandle {
        mut rx,
        last_read_ms,
        started,
    } = handle;
    let mut parser = SseParser::new(params.line_buffer_max);
    let mut usage = ClaudeUsage::default();
    let mut first_token_ms: Option<u64> = None;
    let mut client_disconnect = false;

    let mut ticker = tokio::time::interval(watchdog_period(params.idle_timeout));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let reason = loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(Ok(chunk)) => {
                    let events = match parser.feed(&chunk) {
                        Ok(events) => events,
                        Err(overflow) => {
                            debug!(max = overflow.max, "sse line buffer overflow");
                            break StreamReason::Overflow;
                        }
                    };
                    for event in events {
                        process_event(
                            event,
                            &params,
                            started,
                            &mut usage,
                            &mut first_token_ms,
                            &mut client_disconnect,
                        )
                        .await;
                    }
                }
                Some(Err(err)) => {
                    debug!(error = %err, "upstream stream read failed");
                    break StreamReason::ReadError;
                }
                None => {
                    for event in parser.finish() {
                        process_event(
                            event,
                            &params,
                            started,
                            &mut usage,
                            &mut first_token_ms,
                            &mut client_disconnect,
                        )
                        .await;
                    }
                    break StreamReason::Completed;
                }
            },
            _ = ticker.tick() => {
                let last_read = last_read_ms.load(Ordering::Relaxed);
                let now = started.elapsed().as_millis() as u64;
                if now.saturating_sub(last_read) > params.idle_timeout.as_millis() as u64 {
                    break StreamReason::Timeout;
                }
            }
        }
    };

    if reason != StreamReason::Completed && !client_disconnect {
        let frame = error_frame(reason);
        let _ = params.sink.send(frame).await;
    }

    // The billed struct gets the same collapse the event JSON got.
    usage.apply_cache_ttl_override(params.cache_ttl);

    StreamStats {
        usage,
        first_token_ms,
        client_disconnect,
        reason,
    }
}

fn watchdog_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).max(Duration::from_millis(250))
}

async fn process_event(
    event: SseEvent,
    params: &StreamParams,
    started: tokio::time::Instant,
    usage: &mut ClaudeUsage,
    first_token_ms: &mut Option<u64>,
    client_disconnect: &mut bool,
) {
    let mut event = event;

    if !event.data.is_empty() && !is_done_marker(&event.data) {
        if first_token_ms.is_none() {
            *first_token_ms = Some((started.elapsed().as_millis() as u64).max(1));
        }

        if let Ok(mut value) = serde_json::from_str::<Value>(&event.data) {
            match usage_from_stream_event(&value) {
                Some(StreamUsageEvent::MessageStart(wire)) => usage.overwrite_from_start(&wire),
                Some(StreamUsageEvent::MessageDelta(wire)) => usage.merge_delta(&wire),
                None => {}
            }
            // Keep the client-visible buckets in agreement with billing.
            if rewrite_event_cache_buckets(&mut value, params.cache_ttl) {
                event.data = value.to_string();
            }
        }
    }

    if !*client_disconnect {
        let encoded = Bytes::from(encode_sse_event(&event));
        if params.sink.send(encoded).await.is_err() {
            // Client went away; keep draining upstream for usage.
            *client_disconnect = true;
        }
    }
}

fn error_frame(reason: StreamReason) -> Bytes {
    let event = SseEvent {
        event: Some("error".to_string()),
        data: serde_json::json!({
            "type": "error",
            "error": {"type": "api_error", "message": reason.code()},
        })
        .to_string(),
    };
    Bytes::from(encode_sse_event(&event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use tokio::time::Instant;

    fn handle(rx: mpsc::Receiver<Result<Bytes, crate::TransportError>>) -> StreamHandle {
        StreamHandle {
            rx,
            last_read_ms: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    fn params(sink: mpsc::Sender<Bytes>, ttl: CacheTtlOverride) -> StreamParams {
        StreamParams {
            sink,
            cache_ttl: ttl,
            idle_timeout: Duration::from_secs(5),
            line_buffer_max: 1024 * 1024,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> String {
        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn relays_events_and_accumulates_usage() {
        let (up_tx, up_rx) = mpsc::channel(8);
        let (down_tx, down_rx) = mpsc::channel(8);

        let relay = tokio::spawn(relay_stream(
            handle(up_rx),
            params(down_tx, CacheTtlOverride::None),
        ));

        let start = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":50,\"output_tokens\":1}}}\n\n";
        let delta = "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":9,\"input_tokens\":0}}\n\n";
        up_tx.send(Ok(Bytes::from(start))).await.unwrap();
        up_tx.send(Ok(Bytes::from(delta))).await.unwrap();
        drop(up_tx);

        let stats = relay.await.unwrap();
        assert_eq!(stats.reason, StreamReason::Completed);
        // message_delta zeros never clobber message_start counters.
        assert_eq!(stats.usage.input_tokens, 50);
        assert_eq!(stats.usage.output_tokens, 9);
        assert!(stats.first_token_ms.is_some());
        assert!(!stats.client_disconnect);

        let body = drain(down_rx).await;
        assert!(body.contains("message_start"));
        assert!(body.contains("message_delta"));
    }

    #[tokio::test]
    async fn client_disconnect_keeps_draining_for_usage() {
        let (up_tx, up_rx) = mpsc::channel(8);
        let (down_tx, down_rx) = mpsc::channel(8);
        drop(down_rx); // client gone before the first event

        let relay = tokio::spawn(relay_stream(
            handle(up_rx),
            params(down_tx, CacheTtlOverride::None),
        ));

        let start = "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":7}}}\n\n";
        let delta = "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":3}}\n\n";
        up_tx.send(Ok(Bytes::from(start))).await.unwrap();
        up_tx.send(Ok(Bytes::from(delta))).await.unwrap();
        drop(up_tx);

        let stats = relay.await.unwrap();
        assert!(stats.client_disconnect);
        assert_eq!(stats.usage.input_tokens, 7);
        assert_eq!(stats.usage.output_tokens, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_emits_fixed_reason_code() {
        let (_up_tx, up_rx) = mpsc::channel::<Result<Bytes, crate::TransportError>>(8);
        let (down_tx, down_rx) = mpsc::channel(8);
        let mut p = params(down_tx, CacheTtlOverride::None);
        p.idle_timeout = Duration::from_millis(400);

        let relay = tokio::spawn(relay_stream(handle(up_rx), p));
        tokio::time::advance(Duration::from_secs(2)).await;

        let stats = relay.await.unwrap();
        assert_eq!(stats.reason, StreamReason::Timeout);
        let body = drain(down_rx).await;
        assert!(body.contains("stream_timeout"));
        // Sanitized: only the fixed code, no upstream text.
        assert!(body.contains("event: error"));
    }

    #[tokio::test]
    async fn ttl_override_rewrites_event_json_in_flight() {
        let (up_tx, up_rx) = mpsc::channel(8);
        let (down_tx, down_rx) = mpsc::channel(8);

        let relay = tokio::spawn(relay_stream(
            handle(up_rx),
            params(down_tx, CacheTtlOverride::OneHour),
        ));

        let start = "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":1,\"cache_creation_input_tokens\":30}}}\n\n";
        up_tx.send(Ok(Bytes::from(start))).await.unwrap();
        drop(up_tx);

        let stats = relay.await.unwrap();
        assert_eq!(stats.usage.cache_creation_input_tokens, 30);
        assert_eq!(stats.usage.cache_creation_1h_tokens, 30);
        assert_eq!(stats.usage.cache_creation_5m_tokens, 0);
        let body = drain(down_rx).await;
        assert!(body.contains("\"ephemeral_1h_input_tokens\":30"));
    }

    #[tokio::test]
    async fn done_marker_does_not_stamp_first_token() {
        let (up_tx, up_rx) = mpsc::channel(8);
        let (down_tx, down_rx) = mpsc::channel(8);

        let relay = tokio::spawn(relay_stream(
            handle(up_rx),
            params(down_tx, CacheTtlOverride::None),
        ));
        up_tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await.unwrap();
        drop(up_tx);

        let stats = relay.await.unwrap();
        assert_eq!(stats.first_token_ms, None);
        let body = drain(down_rx).await;
        assert!(body.contains("[DONE]"));
    }
}
