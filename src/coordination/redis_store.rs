// Redis-backed coordination store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{CasOutcome, CoordinationStore};
use crate::error::Result;

// Compare-and-set as a single server-side script so the read and write are
// one atomic step. An empty ARGV[1] stands for "key absent".
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then current = '' end
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return ''
end
return current
"#;

/// Coordination store on a shared Redis instance, one connection manager per
/// worker process.
pub struct RedisStore {
    manager: ConnectionManager,
    cas: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            cas: Script::new(CAS_SCRIPT),
        })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<CasOutcome> {
        let mut conn = self.manager.clone();
        let observed: String = self
            .cas
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        if observed.is_empty() {
            // Either the write applied, or the key held the empty string we
            // asked for; state strings are never empty so both mean success.
            Ok(CasOutcome::Applied)
        } else {
            Ok(CasOutcome::Conflict(Some(observed)))
        }
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
