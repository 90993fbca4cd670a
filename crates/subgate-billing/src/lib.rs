mod cost;
mod last_used;
mod recorder;

pub use cost::{CostBreakdown, CostModel, TokenPriceModel};
pub use last_used::{AccountTouchStore, LastUsedBatcher, NullTouchStore};
pub use recorder::{
    BillingError, BillingInput, BillingRecorder, InsertOutcome, LedgerStore, RecordOutcome,
    SubscriptionRef, UsageLogRow, UsageLogStore, UserRef,
};
