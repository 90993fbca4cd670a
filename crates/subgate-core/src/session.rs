use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;
use xxhash_rust::xxh64::xxh64;

use subgate_common::{AccountId, GroupId};
use subgate_protocol::ParsedRequest;
use subgate_store::CacheStore;

const STICKY_TTL: Duration = Duration::from_secs(60 * 60);

/// Stable identifier for the logical conversation behind a request.
///
/// Derivation, first match wins:
/// 1. a `session_<uuid>` marker inside `metadata.user_id` (Claude-CLI
///    clients embed one);
/// 2. xxh64 over the ephemeral-cached content blocks (strongest cross-SDK
///    signal), base-36;
/// 3. xxh64 over session context + prompt text. The context suffix keeps
///    identical prompts from colliding across tenants.
///
/// Returns None when nothing identifies the conversation; stickiness is
/// disabled for such requests.
pub fn derive_session_hash(req: &ParsedRequest) -> Option<String> {
    if let Some(user_id) = req.metadata_user_id.as_deref()
        && let Some(uuid) = embedded_session_uuid(user_id)
    {
        return Some(uuid.to_string());
    }

    let ephemeral = req.ephemeral_cached_text();
    if !ephemeral.is_empty() {
        return Some(to_base36(xxh64(ephemeral.as_bytes(), 0)));
    }

    let system = req.system_text();
    let messages = req.message_texts();
    if system.is_empty() && messages.is_empty() {
        return None;
    }
    let composite = format!(
        "{}:{}:{}|{}{}",
        req.session.client_ip, req.session.user_agent, req.session.api_key_id, system, messages
    );
    Some(to_base36(xxh64(composite.as_bytes(), 0)))
}

/// Find `session_<36-char-uuid>` inside a metadata user id.
fn embedded_session_uuid(user_id: &str) -> Option<&str> {
    let mut rest = user_id;
    while let Some(pos) = rest.find("session_") {
        let candidate = &rest[pos + "session_".len()..];
        if candidate.len() >= 36 && is_uuid(&candidate[..36]) {
            return Some(&candidate[..36]);
        }
        rest = &rest[pos + "session_".len()..];
    }
    None
}

fn is_uuid(value: &str) -> bool {
    if value.len() != 36 {
        return false;
    }
    value.bytes().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Deterministic per-(account, conversation) UUID in RFC-4122 v4 layout,
/// used when synthesizing `metadata.user_id` for impersonated requests.
pub fn session_uuid_for_account(account_id: AccountId, session_hash: &str) -> String {
    let digest = Sha256::digest(format!("{account_id}::{session_hash}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    uuid::Uuid::from_bytes(bytes).to_string()
}

/// Lookup key for the digest-chain fallback index: the running digest of the
/// conversation prefix plus the digest of the first prompt block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChainKey {
    pub prefix_hash: String,
    pub chain: String,
}

/// Sticky session-to-account bindings plus the digest-chain recovery index.
///
/// Everything here is advisory: cache errors degrade to "no binding" and the
/// scheduler simply selects fresh.
pub struct SessionStore {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            ttl: STICKY_TTL,
        }
    }

    fn sticky_key(group: Option<GroupId>, session_hash: &str) -> String {
        format!("sticky:{}:{session_hash}", group.unwrap_or(0))
    }

    fn digest_key(group: Option<GroupId>, key: &DigestChainKey) -> String {
        format!(
            "digest:{}:{}:{}",
            group.unwrap_or(0),
            key.prefix_hash,
            key.chain
        )
    }

    /// Bound account for a session, refreshing the TTL on hit.
    pub async fn bound_account(
        &self,
        group: Option<GroupId>,
        session_hash: &str,
    ) -> Option<AccountId> {
        if session_hash.is_empty() {
            return None;
        }
        let key = Self::sticky_key(group, session_hash);
        let value = match self.cache.get(&key).await {
            Ok(value) => value?,
            Err(err) => {
                warn!(error = %err, "sticky lookup failed; selecting fresh");
                return None;
            }
        };
        let account = value.parse::<AccountId>().ok()?;
        let _ = self
            .cache
            .set(&key, &value, Some(self.ttl))
            .await
            .map_err(|err| warn!(error = %err, "sticky ttl refresh failed"));
        Some(account)
    }

    pub async fn bind(&self, group: Option<GroupId>, session_hash: &str, account: AccountId) {
        if session_hash.is_empty() {
            return;
        }
        let key = Self::sticky_key(group, session_hash);
        if let Err(err) = self
            .cache
            .set(&key, &account.to_string(), Some(self.ttl))
            .await
        {
            warn!(error = %err, account, "sticky bind failed");
        }
    }

    /// Idempotent: concurrent evictions of the same binding are fine.
    pub async fn unbind(&self, group: Option<GroupId>, session_hash: &str) {
        if session_hash.is_empty() {
            return;
        }
        let key = Self::sticky_key(group, session_hash);
        if let Err(err) = self.cache.delete(&key).await {
            warn!(error = %err, "sticky unbind failed");
        }
    }

    /// Fallback recovery for clients that cannot carry a sticky key: match
    /// the conversation by its content-digest chain.
    pub async fn digest_lookup(
        &self,
        group: Option<GroupId>,
        key: &DigestChainKey,
    ) -> Option<(String, AccountId)> {
        let cache_key = Self::digest_key(group, key);
        let value = match self.cache.get(&cache_key).await {
            Ok(value) => value?,
            Err(err) => {
                warn!(error = %err, "digest-chain lookup failed");
                return None;
            }
        };
        let (uuid, account) = value.split_once('|')?;
        let account = account.parse::<AccountId>().ok()?;
        Some((uuid.to_string(), account))
    }

    /// Save the advanced chain, retiring the previous chain key so the index
    /// tracks the latest turn only.
    pub async fn digest_save(
        &self,
        group: Option<GroupId>,
        key: &DigestChainKey,
        old_chain: Option<&str>,
        session_uuid: &str,
        account: AccountId,
    ) {
        if let Some(old_chain) = old_chain {
            let old_key = Self::digest_key(
                group,
                &DigestChainKey {
                    prefix_hash: key.prefix_hash.clone(),
                    chain: old_chain.to_string(),
                },
            );
            let _ = self.cache.delete(&old_key).await;
        }
        let cache_key = Self::digest_key(group, key);
        let value = format!("{session_uuid}|{account}");
        if let Err(err) = self.cache.set(&cache_key, &value, Some(self.ttl)).await {
            warn!(error = %err, "digest-chain save failed");
        }
    }
}

/// Running digest chain over the message texts: `prefix_hash` identifies the
/// opening prompt, `chain` folds every turn so far. The previous turn's
/// chain (`messages[..len-1]`) is what a lookup for an ongoing conversation
/// should use.
pub fn digest_chain_for_messages(texts: &[String]) -> Option<DigestChainKey> {
    let first = texts.first().filter(|t| !t.is_empty())?;
    let prefix_hash = to_base36(xxh64(first.as_bytes(), 0));
    let mut chain = 0u64;
    for text in texts {
        let mut seed = chain.to_be_bytes().to_vec();
        seed.extend_from_slice(text.as_bytes());
        chain = xxh64(&seed, 0);
    }
    Some(DigestChainKey {
        prefix_hash,
        chain: to_base36(chain),
    })
}
