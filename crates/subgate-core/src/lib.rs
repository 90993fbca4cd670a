pub use subgate_common::{AccountId, GroupId};

mod account;
mod fingerprint;
mod limits;
mod model;
mod pool;
mod recover;
mod registry;
mod sched;
mod session;

pub use account::{Account, Group, MediaPrices, ModelRoute};
pub use fingerprint::{Fingerprint, FingerprintStore};
pub use limits::{
    QueryError, SessionAdmission, SessionLimitGate, UsageWindowQuery, WindowCostDecision,
    WindowCostGate,
};
pub use model::{antigravity_upstream_model, normalize_anthropic_model};
pub use pool::{AccountLoad, ConcurrencyPool, SlotGuard, WaitError};
pub use recover::DeadlineQueue;
pub use registry::{AccountRegistry, AccountState, FailureDisposition};
pub use sched::{
    Acquired, ClientInfo, ScheduleError, ScheduleRequest, Scheduler, Selection, WaitPlan,
    is_claude_cli_client,
};
pub use session::{
    DigestChainKey, SessionStore, derive_session_hash, digest_chain_for_messages,
    session_uuid_for_account,
};
