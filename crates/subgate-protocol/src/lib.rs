mod request;
mod sse;
mod stream;
mod usage;

pub use request::{ParsedRequest, ProtocolError, SessionContext};
pub use sse::{SseEvent, SseOverflow, SseParser, encode_sse_event, is_done_marker};
pub use stream::{
    StreamUsageEvent, response_usage, rewrite_event_cache_buckets, usage_from_stream_event,
};
pub use usage::{ClaudeUsage, WireCacheCreation, WireUsage};
