mod classify;
mod client;
mod count_tokens;
mod forward;
mod recovery;
mod stream;

pub use classify::{
    implicates_tools, is_compat_400, is_failover_status, is_retryable_on_same_account,
    is_thinking_signature_400,
};
pub use client::{
    StreamHandle, TransportError, TransportErrorKind, UpstreamBody, UpstreamClient,
    UpstreamRequest, UpstreamResponse, WreqClient, count_tokens_endpoint, messages_endpoint,
};
pub use count_tokens::forward_count_tokens;
pub use forward::{
    ForwardError, ForwardOutcome, ForwardResult, ForwardTask, Forwarder, UpstreamFailover,
};
pub use recovery::{downgrade_thinking_blocks, downgrade_tool_blocks};
pub use stream::StreamReason;
