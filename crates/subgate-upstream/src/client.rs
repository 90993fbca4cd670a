use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use wreq::Client;
use wreq_util::Emulation;

use subgate_core::Account;
use subgate_rewrite::Headers;

const DEFAULT_API_BASE_URL: &str = "https://api.anthropic.com";
/// Per-account base-url overrides must resolve to a known upstream family.
const ALLOWED_BASE_HOST_SUFFIXES: &[&str] = &[
    "anthropic.com",
    "googleapis.com",
    "google.com",
    "openai.com",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream transport failure: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    pub stream: bool,
    /// Dispatch through the browser-emulated client (OAuth CLI disguise).
    pub tls_fingerprint: bool,
}

/// Live upstream byte stream plus the shared read-recency stamp the idle
/// watchdog observes.
#[derive(Debug)]
pub struct StreamHandle {
    pub rx: mpsc::Receiver<Result<Bytes, TransportError>>,
    /// Milliseconds since `started` of the most recent upstream read.
    pub last_read_ms: Arc<AtomicU64>,
    pub started: Instant,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(StreamHandle),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>>;
}

/// wreq-backed upstream dispatcher. Two prebuilt clients: a plain one and a
/// Chrome-emulated one whose TLS/JA3 surface matches a real browser for
/// accounts flagged with fingerprinting.
pub struct WreqClient {
    plain: Client,
    emulated: Client,
    stream_channel_capacity: usize,
}

impl WreqClient {
    pub fn new(stream_channel_capacity: usize) -> Result<Self, wreq::Error> {
        let connect_timeout = Duration::from_secs(10);
        let plain = Client::builder().connect_timeout(connect_timeout).build()?;
        let emulated = Client::builder()
            .connect_timeout(connect_timeout)
            .emulation(Emulation::Chrome133)
            .build()?;
        Ok(Self {
            plain,
            emulated,
            stream_channel_capacity,
        })
    }
}

impl UpstreamClient for WreqClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let client = if req.tls_fingerprint {
                &self.emulated
            } else {
                &self.plain
            };
            let mut builder = client.post(&req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            builder = builder.body(req.body);

            let resp = builder.send().await.map_err(map_wreq_error)?;
            let status = resp.status().as_u16();
            let headers = headers_from_wreq(resp.headers());

            let is_success = (200..300).contains(&status);
            if !is_success || !req.stream {
                let body = resp.bytes().await.map_err(map_wreq_error)?;
                return Ok(UpstreamResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                });
            }

            // Dedicated reader fiber: pump chunks into a bounded channel and
            // stamp read recency for the idle watchdog downstream.
            let started = Instant::now();
            let last_read_ms = Arc::new(AtomicU64::new(0));
            let stamp = last_read_ms.clone();
            let (tx, rx) = mpsc::channel(self.stream_channel_capacity);
            tokio::spawn(async move {
                let mut body = resp.bytes_stream();
                while let Some(item) = body.next().await {
                    stamp.store(
                        started.elapsed().as_millis() as u64,
                        std::sync::atomic::Ordering::Relaxed,
                    );
                    match item {
                        Ok(chunk) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(map_wreq_error(err))).await;
                            return;
                        }
                    }
                }
            });

            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Stream(StreamHandle {
                    rx,
                    last_read_ms,
                    started,
                }),
            })
        })
    }
}

pub fn messages_endpoint(account: &Account) -> String {
    format!("{}/v1/messages?beta=true", resolve_base_url(account))
}

pub fn count_tokens_endpoint(account: &Account) -> String {
    format!(
        "{}/v1/messages/count_tokens?beta=true",
        resolve_base_url(account)
    )
}

fn resolve_base_url(account: &Account) -> String {
    match account.base_url.as_deref() {
        Some(url) if base_url_allowed(url) => url.trim_end_matches('/').to_string(),
        Some(url) => {
            tracing::warn!(account = account.id, url, "base url not allowlisted; using default");
            DEFAULT_API_BASE_URL.to_string()
        }
        None => DEFAULT_API_BASE_URL.to_string(),
    }
}

fn base_url_allowed(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("https://") else {
        return false;
    };
    let host = rest.split(['/', ':', '?']).next().unwrap_or("");
    ALLOWED_BASE_HOST_SUFFIXES
        .iter()
        .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(v) = value.to_str() {
            out.push((name.as_str().to_string(), v.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> TransportError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    let kind = if err.is_timeout() {
        if lowered.contains("read") || lowered.contains("idle") {
            TransportErrorKind::ReadTimeout
        } else {
            TransportErrorKind::Timeout
        }
    } else if err.is_connect() {
        if lowered.contains("dns") || lowered.contains("resolve") {
            TransportErrorKind::Dns
        } else if lowered.contains("tls") || lowered.contains("ssl") {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if lowered.contains("tls") || lowered.contains("ssl") {
        TransportErrorKind::Tls
    } else {
        TransportErrorKind::Other
    };
    TransportError { kind, message }
}
