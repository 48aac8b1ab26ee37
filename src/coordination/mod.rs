// # Coordination Store
//
// A small shared key-value store offering an atomic compare-and-set, used
// exclusively for query state machines and execution error slots. All
// mutations shared between workers go through `compare_and_set`; plain `set`
// exists only for slots with a single writer (error text).

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of a compare-and-set attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expected value matched and the new value was written.
    Applied,
    /// The key held a different value; nothing was written. Carries the
    /// value observed at decision time.
    Conflict(Option<String>),
}

impl CasOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// Atomic string key-value store shared by all workers.
///
/// Implementations must linearize `compare_and_set` calls on the same key;
/// this is the primitive the query state machine builds its transition
/// atomicity on.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically replace the value at `key` with `new` if the current value
    /// equals `expected` (`None` meaning the key is absent).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<CasOutcome>;

    /// Unconditional write. Single-writer slots only.
    async fn set_value(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}
