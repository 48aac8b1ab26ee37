// # Warehouse
//
// The warehouse is the single source of truth for cache contents: the
// `cache.cached` catalog, the dependency edges, the configuration table, the
// touch counter, and the materialized tables themselves. All mutations go
// through warehouse transactions.
//
// Two backends implement the same contract: `PgWarehouse` against Postgres,
// and `MemoryWarehouse` for embedded deployments and the test suite. Both
// use the scoring arithmetic in this module, so scores are consistent across
// workers and backends.

mod memory;
mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::Result;
use crate::identity::QueryId;

/// Catalog class tag for raw base tables. Raw tables anchor dependency
/// edges but never participate in scoring or eviction.
pub const TABLE_CLASS: &str = "Table";

/// Schema that materialized query outputs live under.
pub const CACHE_SCHEMA: &str = "cache";

/// Configuration keys persisted in `cache.cache_config`.
pub const CONFIG_HALF_LIFE: &str = "half_life";
pub const CONFIG_CACHE_SIZE: &str = "cache_size";

/// One row of a streamed result: column name to JSON value.
pub type JsonRow = serde_json::Map<String, serde_json::Value>;

/// Lazy, consumer-paced sequence of result rows.
pub type RowStream = Pin<Box<dyn Stream<Item = Result<JsonRow>> + Send>>;

/// A snapshot of one `cache.cached` row.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub qid: QueryId,
    /// `Table` for raw base tables, else the query class tag.
    pub class: String,
    pub schema: String,
    pub table_name: String,
    /// Version-tagged descriptor blob, sufficient to reconstruct the query.
    pub obj: Vec<u8>,
    pub compute_time_ms: i64,
    pub access_count: i64,
    pub last_accessed: DateTime<Utc>,
    pub cache_score_multiplier: f64,
    /// Touch-counter value at the most recent score update.
    pub last_touch: i64,
    pub created_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn is_table(&self) -> bool {
        self.class == TABLE_CLASS
    }

    /// Schema-qualified name of the materialized output.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table_name)
    }
}

/// Fields supplied by the executor when a materialization completes.
#[derive(Debug, Clone)]
pub struct NewCacheRecord {
    pub qid: QueryId,
    pub class: String,
    pub schema: String,
    pub table_name: String,
    pub obj: Vec<u8>,
    pub compute_time_ms: i64,
}

/// Weight added to the multiplier for a touch `delta_ticks` after the
/// previous one. The half-life is measured in touch-counter units.
pub fn touch_weight(delta_ticks: i64, half_life: f64) -> f64 {
    2f64.powf(delta_ticks as f64 / half_life)
}

/// Score of a record: lower means less worth keeping.
pub fn cache_score(multiplier: f64, compute_time_ms: i64, size_bytes: u64) -> f64 {
    multiplier * ((compute_time_ms as f64 / 1000.0) / size_bytes as f64)
}

/// Catalog, configuration, materialization, and retrieval operations against
/// the warehouse. All operations are strongly consistent with a single
/// warehouse instance.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Snapshot of a catalog row, or `None` when the qid is not cached.
    async fn lookup(&self, qid: &QueryId) -> Result<Option<CacheRecord>>;

    /// Insert the record for a freshly materialized query along with its
    /// dependency edges `(child = record.qid, parent)`. The insert counts as
    /// the record's first touch: non-`Table` records start with multiplier 1
    /// at the current counter tick. Fails if the qid is already present.
    async fn insert_record(&self, record: NewCacheRecord, parents: &[QueryId]) -> Result<()>;

    /// Touch a record: bump access count and last-accessed, advance the
    /// touch counter, recompute the multiplier, and return the new score.
    /// `Table` records get the access-count and timestamp bump only, do not
    /// advance the counter, and always score 0.
    async fn touch(&self, qid: &QueryId) -> Result<f64>;

    /// Total bytes used by non-`Table` cache tables.
    async fn size_of_cache(&self) -> Result<u64>;

    /// Physical size of a table per the warehouse catalog.
    async fn size_of_table(&self, table: &str, schema: &str) -> Result<u64>;

    /// Compute time of a cached query in seconds.
    async fn compute_time(&self, qid: &QueryId) -> Result<f64>;

    /// Current score of a cached query.
    async fn score(&self, qid: &QueryId) -> Result<f64>;

    /// `(qid, size_bytes)` of every non-`Table` record, ascending score.
    async fn records_by_score(&self) -> Result<Vec<(QueryId, u64)>>;

    /// Queries whose dependency edges list `qid` as parent.
    async fn children_of(&self, qid: &QueryId) -> Result<Vec<QueryId>>;

    /// Every qid in the catalog, `Table` records included.
    async fn cached_qids(&self) -> Result<Vec<QueryId>>;

    /// Remove a record: its catalog row, every edge naming it as child or
    /// parent, and (when `drop_table`) the materialized table itself.
    async fn delete_record(&self, qid: &QueryId, drop_table: bool) -> Result<()>;

    /// Cheap probe: does a catalog row exist for this qid?
    async fn cache_table_exists(&self, qid: &QueryId) -> Result<bool>;

    /// Drop all non-`Table` materialized tables, truncate the catalog and
    /// dependency relations, and reset the touch counter to 1. Atomic within
    /// a single warehouse transaction.
    async fn reset(&self) -> Result<()>;

    async fn max_cache_size(&self) -> Result<u64>;

    async fn set_max_cache_size(&self, bytes: u64) -> Result<()>;

    async fn half_life(&self) -> Result<f64>;

    async fn set_half_life(&self, half_life: f64) -> Result<()>;

    /// Run the query and persist its output as `schema.table`.
    async fn materialize(&self, schema: &str, table: &str, sql: &str) -> Result<()>;

    /// Does a relation exist in the warehouse (catalogued or not)?
    async fn relation_exists(&self, table: &str, schema: &str) -> Result<bool>;

    /// Open a server-side cursor for `sql` inside a read-only transaction
    /// and stream its rows lazily. Each active retrieval holds exactly one
    /// open transaction; the consumer controls the pace.
    async fn stream_rows(&self, sql: &str) -> Result<RowStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_weight_half_life() {
        // One half-life's worth of ticks doubles the weight.
        assert!((touch_weight(10, 10.0) - 2.0).abs() < 1e-12);
        assert!((touch_weight(0, 10.0) - 1.0).abs() < 1e-12);
        assert!((touch_weight(1, 10.0) - 2f64.powf(0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_cache_score_shape() {
        // Slow-to-compute, small tables score high; cheap, large ones low.
        let expensive = cache_score(1.0, 60_000, 1024);
        let cheap = cache_score(1.0, 10, 1024 * 1024 * 1024);
        assert!(expensive > cheap);
    }

    #[test]
    fn test_record_class_probe() {
        let record = CacheRecord {
            qid: QueryId::new("ab"),
            class: TABLE_CLASS.to_string(),
            schema: "events".into(),
            table_name: "calls".into(),
            obj: Vec::new(),
            compute_time_ms: 0,
            access_count: 1,
            last_accessed: Utc::now(),
            cache_score_multiplier: 0.0,
            last_touch: 0,
            created_at: Utc::now(),
        };
        assert!(record.is_table());
        assert_eq!(record.qualified_name(), "events.calls");
    }
}
