use std::sync::Arc;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::warn;

use subgate_common::AccountId;
use subgate_store::CacheStore;

/// Persistent per-account client identity used when impersonating the
/// official CLI: a stable random client id plus a pinned header set. The
/// same account must always present the same identity upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub client_id: String,
    pub user_agent: String,
    pub x_app: String,
    pub stainless: Vec<(String, String)>,
}

const CLI_VERSIONS: &[&str] = &["2.0.76", "2.1.2", "2.1.14", "2.1.27"];
const OS_CHOICES: &[(&str, &str)] = &[("Linux", "x64"), ("Darwin", "arm64"), ("Windows", "x64")];
const NODE_VERSIONS: &[&str] = &["v20.18.1", "v22.9.0", "v22.14.0"];

fn generate() -> Fingerprint {
    let mut rng = rand::rng();
    let mut id_bytes = [0u8; 16];
    rng.fill_bytes(&mut id_bytes);
    let client_id: String = id_bytes.iter().map(|b| format!("{b:02x}")).collect();

    let version = CLI_VERSIONS[rng.random_range(0..CLI_VERSIONS.len())];
    let (os, arch) = OS_CHOICES[rng.random_range(0..OS_CHOICES.len())];
    let node = NODE_VERSIONS[rng.random_range(0..NODE_VERSIONS.len())];

    Fingerprint {
        client_id,
        user_agent: format!("claude-cli/{version} (external, cli)"),
        x_app: "cli".to_string(),
        stainless: vec![
            ("x-stainless-lang".to_string(), "js".to_string()),
            ("x-stainless-package-version".to_string(), "0.70.1".to_string()),
            ("x-stainless-os".to_string(), os.to_string()),
            ("x-stainless-arch".to_string(), arch.to_string()),
            ("x-stainless-runtime".to_string(), "node".to_string()),
            ("x-stainless-runtime-version".to_string(), node.to_string()),
        ],
    }
}

/// Cache-backed fingerprint registry. Generation is lazy; once persisted an
/// account keeps its identity for life.
pub struct FingerprintStore {
    cache: Arc<dyn CacheStore>,
}

impl FingerprintStore {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    fn key(account: AccountId) -> String {
        format!("fingerprint:{account}")
    }

    pub async fn for_account(&self, account: AccountId) -> Fingerprint {
        let key = Self::key(account);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => {
                if let Ok(fingerprint) = serde_json::from_str::<Fingerprint>(&raw) {
                    return fingerprint;
                }
            }
            Ok(None) => {}
            Err(err) => {
                // A transient identity beats no identity; it converges back
                // to the stored one when the cache returns.
                warn!(error = %err, account, "fingerprint lookup failed");
                return generate();
            }
        }

        let fresh = generate();
        if let Ok(raw) = serde_json::to_string(&fresh)
            && let Err(err) = self.cache.set(&key, &raw, None).await
        {
            warn!(error = %err, account, "fingerprint persist failed");
        }
        fresh
    }
}
