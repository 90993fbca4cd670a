use serde_json::Value;

use subgate_common::CacheTtlOverride;

use crate::usage::WireUsage;

/// Usage-bearing stream events the billing path cares about. Everything
/// else passes through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUsageEvent {
    MessageStart(WireUsage),
    MessageDelta(WireUsage),
}

/// Pull the usage object out of a decoded stream event, if it carries one.
///
/// `message_start` nests usage under `message.usage`; `message_delta`
/// carries it at the top level.
pub fn usage_from_stream_event(event: &Value) -> Option<StreamUsageEvent> {
    match event.get("type").and_then(Value::as_str)? {
        "message_start" => {
            let usage = event.get("message")?.get("usage")?;
            let wire: WireUsage = serde_json::from_value(usage.clone()).ok()?;
            Some(StreamUsageEvent::MessageStart(wire))
        }
        "message_delta" => {
            let usage = event.get("usage")?;
            let wire: WireUsage = serde_json::from_value(usage.clone()).ok()?;
            Some(StreamUsageEvent::MessageDelta(wire))
        }
        _ => None,
    }
}

/// Usage from a buffered non-streaming response body.
pub fn response_usage(body: &Value) -> Option<WireUsage> {
    let usage = body.get("usage")?;
    serde_json::from_value(usage.clone()).ok()
}

/// Rewrite the cache-creation buckets inside an event (or response) JSON to
/// match a cache-TTL override, so what the client sees agrees with what gets
/// billed. Returns true when anything changed.
pub fn rewrite_event_cache_buckets(event: &mut Value, ttl: CacheTtlOverride) -> bool {
    if ttl == CacheTtlOverride::None {
        return false;
    }
    let usage = match event.get("type").and_then(Value::as_str) {
        Some("message_start") => event.get_mut("message").and_then(|m| m.get_mut("usage")),
        Some("message_delta") => event.get_mut("usage"),
        _ => event.get_mut("usage"),
    };
    let Some(Value::Object(usage)) = usage else {
        return false;
    };

    let aggregate = usage
        .get("cache_creation_input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let (five_m, one_h) = match usage.get("cache_creation") {
        Some(cc) => (
            cc.get("ephemeral_5m_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cc.get("ephemeral_1h_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        ),
        None => (aggregate, 0),
    };
    let total = (five_m + one_h).max(aggregate);
    if total == 0 {
        return false;
    }

    let (five_m, one_h) = match ttl {
        CacheTtlOverride::None => unreachable!(),
        CacheTtlOverride::FiveMinute => (total, 0),
        CacheTtlOverride::OneHour => (0, total),
    };
    usage.insert("cache_creation_input_tokens".to_string(), total.into());
    usage.insert(
        "cache_creation".to_string(),
        serde_json::json!({
            "ephemeral_5m_input_tokens": five_m,
            "ephemeral_1h_input_tokens": one_h,
        }),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_start_usage_is_nested() {
        let event = json!({
            "type": "message_start",
            "message": {"usage": {"input_tokens": 12, "output_tokens": 1}},
        });
        let Some(StreamUsageEvent::MessageStart(wire)) = usage_from_stream_event(&event) else {
            panic!("expected message_start usage");
        };
        assert_eq!(wire.input_tokens, 12);
    }

    #[test]
    fn message_delta_usage_is_top_level() {
        let event = json!({"type": "message_delta", "usage": {"output_tokens": 7}});
        let Some(StreamUsageEvent::MessageDelta(wire)) = usage_from_stream_event(&event) else {
            panic!("expected message_delta usage");
        };
        assert_eq!(wire.output_tokens, 7);
    }

    #[test]
    fn ttl_rewrite_collapses_buckets_in_event_json() {
        let mut event = json!({
            "type": "message_start",
            "message": {"usage": {
                "cache_creation_input_tokens": 30,
                "cache_creation": {"ephemeral_5m_input_tokens": 10, "ephemeral_1h_input_tokens": 20},
            }},
        });
        assert!(rewrite_event_cache_buckets(
            &mut event,
            CacheTtlOverride::OneHour
        ));
        let usage = &event["message"]["usage"];
        assert_eq!(usage["cache_creation"]["ephemeral_1h_input_tokens"], 30);
        assert_eq!(usage["cache_creation"]["ephemeral_5m_input_tokens"], 0);

        // Second application is a no-op in effect.
        let before = event.clone();
        rewrite_event_cache_buckets(&mut event, CacheTtlOverride::OneHour);
        assert_eq!(event, before);
    }

    #[test]
    fn ttl_rewrite_skips_usage_free_events() {
        let mut event = json!({"type": "content_block_delta", "delta": {"text": "hi"}});
        assert!(!rewrite_event_cache_buckets(
            &mut event,
            CacheTtlOverride::FiveMinute
        ));
    }
}
