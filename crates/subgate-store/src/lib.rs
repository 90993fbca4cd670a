mod cache;
mod memory;

pub use cache::{CacheError, CacheResult, CacheStore, SetMemberOutcome};
pub use memory::MemoryCache;
