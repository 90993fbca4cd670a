use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use subgate_common::{ApiKeyId, BillingKind, UserId};
use subgate_core::{Account, Group};
use subgate_protocol::ClaudeUsage;
use subgate_upstream::ForwardResult;

use crate::cost::{CostBreakdown, CostModel};
use crate::last_used::LastUsedBatcher;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("usage log insert failed: {0}")]
    UsageLog(String),
    #[error("ledger update failed: {0}")]
    Ledger(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// `(account_id, request_id)` already recorded; the debit is skipped.
    Duplicate,
}

/// Append-only usage row with the full cache breakdown.
#[derive(Debug, Clone)]
pub struct UsageLogRow {
    pub account_id: i64,
    pub request_id: Option<String>,
    pub user_id: UserId,
    pub api_key_id: ApiKeyId,
    pub model: String,
    pub stream: bool,
    pub duration_ms: u64,
    pub first_token_ms: Option<u64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_5m_tokens: u64,
    pub cache_creation_1h_tokens: u64,
    pub cache_ttl_overridden: bool,
    pub account_rate_multiplier: f64,
    pub billing_type: BillingKind,
    pub cost_total: f64,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait UsageLogStore: Send + Sync {
    /// Must dedupe on `(account_id, request_id)` when a request id exists.
    async fn insert(&self, row: UsageLogRow) -> Result<InsertOutcome, BillingError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn debit_balance(&self, user: UserId, amount: f64) -> Result<(), BillingError>;
    async fn add_subscription_usage(&self, subscription: i64, amount: f64)
    -> Result<(), BillingError>;
    async fn add_key_quota_usage(&self, api_key: ApiKeyId, amount: f64)
    -> Result<(), BillingError>;
}

#[derive(Debug, Clone)]
pub struct UserRef {
    pub id: UserId,
    /// User-specific override of the group rate, when configured.
    pub group_rate_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionRef {
    pub id: i64,
}

pub struct BillingInput {
    pub result: ForwardResult,
    pub account: Arc<Account>,
    pub group: Option<Arc<Group>>,
    pub user: UserRef,
    pub api_key_id: ApiKeyId,
    pub key_quota_enabled: bool,
    pub subscription: Option<SubscriptionRef>,
    /// The sticky session served this conversation from a different account
    /// than the previous turn.
    pub sticky_account_flipped: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordOutcome {
    pub breakdown: CostBreakdown,
    pub charged: f64,
    pub deduplicated: bool,
}

/// Applies the post-forward billing sequence: force-cache conversion,
/// cache-TTL collapse, multiplier resolution, cost breakdown, deduplicated
/// usage insert, debit, batched last-used update.
pub struct BillingRecorder {
    usage_log: Arc<dyn UsageLogStore>,
    ledger: Arc<dyn LedgerStore>,
    cost_model: Arc<dyn CostModel>,
    last_used: Arc<LastUsedBatcher>,
    system_rate_multiplier: f64,
}

impl BillingRecorder {
    pub fn new(
        usage_log: Arc<dyn UsageLogStore>,
        ledger: Arc<dyn LedgerStore>,
        cost_model: Arc<dyn CostModel>,
        last_used: Arc<LastUsedBatcher>,
    ) -> Self {
        Self {
            usage_log,
            ledger,
            cost_model,
            last_used,
            system_rate_multiplier: 1.0,
        }
    }

    pub async fn record(&self, input: BillingInput) -> Result<RecordOutcome, BillingError> {
        let account = &input.account;
        let mut usage = input.result.usage;

        // Force-cache billing: the flipped account re-read context the
        // client already considers cached.
        if input.sticky_account_flipped && usage.input_tokens > 0 {
            usage.cache_read_input_tokens += usage.input_tokens;
            usage.input_tokens = 0;
        }

        usage.apply_cache_ttl_override(account.cache_ttl_override);

        let rate_multiplier = input
            .user
            .group_rate_multiplier
            .or(input.group.as_ref().and_then(|g| g.rate_multiplier))
            .unwrap_or(self.system_rate_multiplier);
        let account_multiplier = account.billing_rate_multiplier.unwrap_or(1.0);

        let media = media_for(&input.result, input.group.as_deref());
        let breakdown = self
            .cost_model
            .compute(&input.result.model, &usage, media);
        let pre_multiplier = breakdown.total() * account_multiplier;
        let charged = pre_multiplier * rate_multiplier;

        let billing_type = input
            .group
            .as_ref()
            .map(|g| g.billing_kind)
            .unwrap_or(BillingKind::Balance);
        let row = build_row(
            &input,
            &usage,
            account_multiplier,
            billing_type,
            pre_multiplier,
        );
        if self.usage_log.insert(row).await? == InsertOutcome::Duplicate {
            debug!(
                account = account.id,
                request_id = input.result.request_id.as_deref().unwrap_or(""),
                "duplicate usage row; skipping debit"
            );
            return Ok(RecordOutcome {
                breakdown,
                charged: 0.0,
                deduplicated: true,
            });
        }

        match (billing_type, input.subscription) {
            (BillingKind::Subscription, Some(subscription)) => {
                // Subscriptions meter raw consumption, pre rate multiplier.
                self.ledger
                    .add_subscription_usage(subscription.id, pre_multiplier)
                    .await?;
            }
            _ => {
                self.ledger.debit_balance(input.user.id, charged).await?;
                if input.key_quota_enabled {
                    self.ledger
                        .add_key_quota_usage(input.api_key_id, charged)
                        .await?;
                }
            }
        }

        self.last_used.note(account.id).await;

        Ok(RecordOutcome {
            breakdown,
            charged,
            deduplicated: false,
        })
    }
}

fn media_for<'a>(
    result: &'a ForwardResult,
    group: Option<&'a Group>,
) -> Option<(&'a str, u32, &'a subgate_core::MediaPrices)> {
    let media_type = result.media_type.as_deref()?;
    let prices = group?.media_prices.as_ref()?;
    Some((media_type, result.image_count.unwrap_or(1), prices))
}

fn build_row(
    input: &BillingInput,
    usage: &ClaudeUsage,
    account_multiplier: f64,
    billing_type: BillingKind,
    cost_total: f64,
) -> UsageLogRow {
    UsageLogRow {
        account_id: input.account.id,
        request_id: input.result.request_id.clone(),
        user_id: input.user.id,
        api_key_id: input.api_key_id,
        model: input.result.model.clone(),
        stream: input.result.stream,
        duration_ms: input.result.duration.as_millis() as u64,
        first_token_ms: input.result.first_token_ms,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_creation_tokens: usage.cache_creation_input_tokens,
        cache_read_tokens: usage.cache_read_input_tokens,
        cache_creation_5m_tokens: usage.cache_creation_5m_tokens,
        cache_creation_1h_tokens: usage.cache_creation_1h_tokens,
        cache_ttl_overridden: input.account.cache_ttl_override
            != subgate_common::CacheTtlOverride::None,
        account_rate_multiplier: account_multiplier,
        billing_type,
        cost_total,
        created_at: OffsetDateTime::now_utc(),
    }
}
