// In-process coordination store for embedded deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CasOutcome, CoordinationStore};
use crate::error::Result;

/// DashMap-backed store. CAS atomicity comes from the map's per-shard entry
/// lock, which is held across the read-compare-write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<CasOutcome> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if Some(entry.get().as_str()) == expected {
                    entry.insert(new.to_string());
                    Ok(CasOutcome::Applied)
                } else {
                    Ok(CasOutcome::Conflict(Some(entry.get().clone())))
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(new.to_string());
                    Ok(CasOutcome::Applied)
                } else {
                    Ok(CasOutcome::Conflict(None))
                }
            }
        }
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
