use bytes::Bytes;

use crate::client::{UpstreamBody, UpstreamClient, UpstreamRequest};
use crate::forward::ForwardError;
use subgate_rewrite::Headers;

/// Simplified forward for the count-tokens endpoint: non-streaming, no
/// usage recording, and a 404-as-fallback policy — upstreams without the
/// endpoint get a zero count so clients fall back to local estimation.
pub async fn forward_count_tokens(
    client: &dyn UpstreamClient,
    url: String,
    headers: Headers,
    body: Bytes,
    tls_fingerprint: bool,
) -> Result<(u16, Bytes), ForwardError> {
    let request = UpstreamRequest {
        url,
        headers,
        body,
        stream: false,
        tls_fingerprint,
    };
    let response = client
        .send(request)
        .await
        .map_err(|err| ForwardError::Transport(err.to_string()))?;

    if response.status == 404 {
        return Ok((200, Bytes::from_static(b"{\"input_tokens\": 0}")));
    }

    let body = match response.body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(_) => Bytes::new(),
    };
    Ok((response.status, body))
}
