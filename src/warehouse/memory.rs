// In-process warehouse backend for embedded deployments and tests.
//
// Implements the same catalog semantics as the Postgres backend, including
// the touch-counter logical clock and the exponential score multiplier, so
// the cache manager and the test suite exercise identical arithmetic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use super::{
    cache_score, touch_weight, CacheRecord, JsonRow, NewCacheRecord, RowStream, Warehouse,
    CONFIG_CACHE_SIZE, CONFIG_HALF_LIFE, TABLE_CLASS,
};
use crate::error::{FlowError, Result};
use crate::identity::QueryId;

const DEFAULT_HALF_LIFE: f64 = 1000.0;
const DEFAULT_CACHE_SIZE: u64 = 1024 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct MemTable {
    rows: Vec<JsonRow>,
    size_bytes: u64,
}

/// DashMap-free single-process warehouse. Plain mutexes are enough here:
/// no lock is held across an await point.
pub struct MemoryWarehouse {
    records: Mutex<HashMap<String, CacheRecord>>,
    tables: Mutex<HashMap<(String, String), MemTable>>,
    edges: Mutex<HashSet<(String, String)>>,
    config: Mutex<HashMap<String, String>>,
    // Last issued touch-counter value; ticks are last + 1.
    counter: AtomicI64,
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        let mut config = HashMap::new();
        config.insert(CONFIG_HALF_LIFE.to_string(), DEFAULT_HALF_LIFE.to_string());
        config.insert(CONFIG_CACHE_SIZE.to_string(), DEFAULT_CACHE_SIZE.to_string());
        Self {
            records: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            edges: Mutex::new(HashSet::new()),
            config: Mutex::new(config),
            counter: AtomicI64::new(0),
        }
    }
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_tick(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn config_f64(&self, key: &str, fallback: f64) -> f64 {
        self.config
            .lock()
            .expect("config lock")
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(fallback)
    }

    /// Seed a physical table, e.g. raw events or geography fixtures.
    pub fn create_table(&self, schema: &str, table: &str, rows: Vec<JsonRow>, size_bytes: u64) {
        self.tables.lock().expect("tables lock").insert(
            (schema.to_string(), table.to_string()),
            MemTable { rows, size_bytes },
        );
    }

    /// Override the reported physical size of a table. Mirrors what warehouse
    /// maintenance (vacuum, bloat) does to real sizes out from under the
    /// catalog; tests use it to steer eviction order.
    pub fn set_table_size(&self, schema: &str, table: &str, size_bytes: u64) {
        if let Some(table) = self
            .tables
            .lock()
            .expect("tables lock")
            .get_mut(&(schema.to_string(), table.to_string()))
        {
            table.size_bytes = size_bytes;
        }
    }

    /// Overwrite a record's score multiplier directly. Test steering only.
    pub fn set_multiplier(&self, qid: &QueryId, multiplier: f64) {
        if let Some(record) = self
            .records
            .lock()
            .expect("records lock")
            .get_mut(qid.as_str())
        {
            record.cache_score_multiplier = multiplier;
        }
    }

    fn table_size_inner(&self, schema: &str, table: &str) -> Option<u64> {
        self.tables
            .lock()
            .expect("tables lock")
            .get(&(schema.to_string(), table.to_string()))
            .map(|t| t.size_bytes)
    }

    /// Deterministic placeholder output for a materialization. The embedded
    /// backend has no SQL engine; it records that the table exists, gives it
    /// a size derived from the statement, and synthesizes a handful of rows
    /// under the statement's output columns so retrieval paths stream the
    /// shape the real warehouse would.
    fn synthesize_table(sql: &str) -> MemTable {
        let digest = Sha256::digest(sql.as_bytes());
        let seed = u64::from(digest[0]) << 8 | u64::from(digest[1]);
        let columns = select_list_columns(sql);
        let rows = (0..3)
            .map(|i| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(j, column)| {
                        (
                            column.clone(),
                            serde_json::Value::from((seed + i + j as u64) % 1000),
                        )
                    })
                    .collect()
            })
            .collect();
        MemTable {
            rows,
            size_bytes: 8192 + (sql.len() as u64) * 32,
        }
    }
}

/// Output column names of a generated SELECT: the alias after `AS`, or the
/// last path segment of the expression. Tracks quotes and parens so commas
/// inside function calls and string literals do not split items.
fn select_list_columns(sql: &str) -> Vec<String> {
    let list = sql.strip_prefix("SELECT ").unwrap_or(sql);

    let mut depth = 0usize;
    let mut in_quote = false;
    let mut items = Vec::new();
    let mut item_start = 0;
    let mut list_end = list.len();
    for (idx, ch) in list.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth = depth.saturating_sub(1),
            ',' if !in_quote && depth == 0 => {
                items.push(&list[item_start..idx]);
                item_start = idx + 1;
            }
            _ => {}
        }
        if !in_quote && depth == 0 && list[idx..].starts_with(" FROM ") {
            list_end = idx;
            break;
        }
    }
    items.push(&list[item_start..list_end.max(item_start)]);

    let columns: Vec<String> = items
        .iter()
        .filter_map(|item| {
            let item = item.trim();
            let name = match item.rfind(" AS ") {
                Some(pos) => &item[pos + 4..],
                None => item.rsplit(char::is_whitespace).next().unwrap_or(item),
            };
            let name = name.trim().trim_matches('"');
            let name = name.rsplit('.').next().unwrap_or(name);
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect();
    if columns.is_empty() {
        vec!["value".to_string()]
    } else {
        columns
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn lookup(&self, qid: &QueryId) -> Result<Option<CacheRecord>> {
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .get(qid.as_str())
            .cloned())
    }

    async fn insert_record(&self, record: NewCacheRecord, parents: &[QueryId]) -> Result<()> {
        let now = Utc::now();
        let is_table = record.class == TABLE_CLASS;

        {
            let mut records = self.records.lock().expect("records lock");
            if records.contains_key(record.qid.as_str()) {
                return Err(FlowError::Warehouse(format!(
                    "query {} is already cached",
                    record.qid
                )));
            }
            let tick = if is_table { 0 } else { self.next_tick() };
            records.insert(
                record.qid.as_str().to_string(),
                CacheRecord {
                    qid: record.qid.clone(),
                    class: record.class,
                    schema: record.schema,
                    table_name: record.table_name,
                    obj: record.obj,
                    compute_time_ms: record.compute_time_ms,
                    access_count: 1,
                    last_accessed: now,
                    cache_score_multiplier: if is_table { 0.0 } else { 1.0 },
                    last_touch: tick,
                    created_at: now,
                },
            );
        }

        let mut edges = self.edges.lock().expect("edges lock");
        for parent in parents {
            edges.insert((
                record.qid.as_str().to_string(),
                parent.as_str().to_string(),
            ));
        }
        Ok(())
    }

    async fn touch(&self, qid: &QueryId) -> Result<f64> {
        let half_life = self.config_f64(CONFIG_HALF_LIFE, DEFAULT_HALF_LIFE);

        let (schema, table, multiplier, compute_time_ms, is_table) = {
            let mut records = self.records.lock().expect("records lock");
            let record = records
                .get_mut(qid.as_str())
                .ok_or_else(|| FlowError::NotFound(format!("query {qid} is not in cache")))?;

            record.access_count += 1;
            record.last_accessed = Utc::now();
            if record.is_table() {
                (String::new(), String::new(), 0.0, 0, true)
            } else {
                let tick = self.next_tick();
                let delta = tick - record.last_touch;
                record.cache_score_multiplier += touch_weight(delta, half_life);
                record.last_touch = tick;
                (
                    record.schema.clone(),
                    record.table_name.clone(),
                    record.cache_score_multiplier,
                    record.compute_time_ms,
                    false,
                )
            }
        };

        if is_table {
            return Ok(0.0);
        }
        let size = self
            .table_size_inner(&schema, &table)
            .ok_or_else(|| FlowError::NotFound(format!("table {schema}.{table} does not exist")))?;
        Ok(cache_score(multiplier, compute_time_ms, size))
    }

    async fn size_of_cache(&self) -> Result<u64> {
        let records = self.records.lock().expect("records lock");
        let tables = self.tables.lock().expect("tables lock");
        Ok(records
            .values()
            .filter(|r| !r.is_table())
            .filter_map(|r| {
                tables
                    .get(&(r.schema.clone(), r.table_name.clone()))
                    .map(|t| t.size_bytes)
            })
            .sum())
    }

    async fn size_of_table(&self, table: &str, schema: &str) -> Result<u64> {
        self.table_size_inner(schema, table)
            .ok_or_else(|| FlowError::NotFound(format!("table {schema}.{table} does not exist")))
    }

    async fn compute_time(&self, qid: &QueryId) -> Result<f64> {
        let records = self.records.lock().expect("records lock");
        let record = records
            .get(qid.as_str())
            .ok_or_else(|| FlowError::NotFound(format!("query {qid} is not in cache")))?;
        Ok(record.compute_time_ms as f64 / 1000.0)
    }

    async fn score(&self, qid: &QueryId) -> Result<f64> {
        let record = self
            .lookup(qid)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("query {qid} is not in cache")))?;
        if record.is_table() {
            return Ok(0.0);
        }
        let size = self
            .table_size_inner(&record.schema, &record.table_name)
            .ok_or_else(|| {
                FlowError::NotFound(format!("table {} does not exist", record.qualified_name()))
            })?;
        Ok(cache_score(
            record.cache_score_multiplier,
            record.compute_time_ms,
            size,
        ))
    }

    async fn records_by_score(&self) -> Result<Vec<(QueryId, u64)>> {
        let mut scored: Vec<(QueryId, u64, f64)> = {
            let records = self.records.lock().expect("records lock");
            let tables = self.tables.lock().expect("tables lock");
            records
                .values()
                .filter(|r| !r.is_table())
                .filter_map(|r| {
                    let size = tables
                        .get(&(r.schema.clone(), r.table_name.clone()))?
                        .size_bytes;
                    let score = cache_score(r.cache_score_multiplier, r.compute_time_ms, size);
                    Some((r.qid.clone(), size, score))
                })
                .collect()
        };
        scored.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().map(|(qid, size, _)| (qid, size)).collect())
    }

    async fn children_of(&self, qid: &QueryId) -> Result<Vec<QueryId>> {
        Ok(self
            .edges
            .lock()
            .expect("edges lock")
            .iter()
            .filter(|(_, parent)| parent == qid.as_str())
            .map(|(child, _)| QueryId::new(child.clone()))
            .collect())
    }

    async fn cached_qids(&self) -> Result<Vec<QueryId>> {
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .keys()
            .cloned()
            .map(QueryId::new)
            .collect())
    }

    async fn delete_record(&self, qid: &QueryId, drop_table: bool) -> Result<()> {
        let removed = self
            .records
            .lock()
            .expect("records lock")
            .remove(qid.as_str());
        if let Some(record) = removed {
            if drop_table && !record.is_table() {
                self.tables
                    .lock()
                    .expect("tables lock")
                    .remove(&(record.schema, record.table_name));
            }
        }
        self.edges
            .lock()
            .expect("edges lock")
            .retain(|(child, parent)| child != qid.as_str() && parent != qid.as_str());
        Ok(())
    }

    async fn cache_table_exists(&self, qid: &QueryId) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .contains_key(qid.as_str()))
    }

    async fn reset(&self) -> Result<()> {
        let mut records = self.records.lock().expect("records lock");
        let mut tables = self.tables.lock().expect("tables lock");
        for record in records.values().filter(|r| !r.is_table()) {
            tables.remove(&(record.schema.clone(), record.table_name.clone()));
        }
        records.clear();
        self.edges.lock().expect("edges lock").clear();
        self.counter.store(1, Ordering::SeqCst);
        Ok(())
    }

    async fn max_cache_size(&self) -> Result<u64> {
        Ok(self.config_f64(CONFIG_CACHE_SIZE, DEFAULT_CACHE_SIZE as f64) as u64)
    }

    async fn set_max_cache_size(&self, bytes: u64) -> Result<()> {
        self.config
            .lock()
            .expect("config lock")
            .insert(CONFIG_CACHE_SIZE.to_string(), bytes.to_string());
        Ok(())
    }

    async fn half_life(&self) -> Result<f64> {
        Ok(self.config_f64(CONFIG_HALF_LIFE, DEFAULT_HALF_LIFE))
    }

    async fn set_half_life(&self, half_life: f64) -> Result<()> {
        self.config
            .lock()
            .expect("config lock")
            .insert(CONFIG_HALF_LIFE.to_string(), half_life.to_string());
        Ok(())
    }

    async fn materialize(&self, schema: &str, table: &str, sql: &str) -> Result<()> {
        let key = (schema.to_string(), table.to_string());
        let mut tables = self.tables.lock().expect("tables lock");
        if tables.contains_key(&key) {
            return Err(FlowError::Warehouse(format!(
                "relation {schema}.{table} already exists"
            )));
        }
        tables.insert(key, Self::synthesize_table(sql));
        Ok(())
    }

    async fn relation_exists(&self, table: &str, schema: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .expect("tables lock")
            .contains_key(&(schema.to_string(), table.to_string())))
    }

    async fn stream_rows(&self, sql: &str) -> Result<RowStream> {
        // The embedded backend streams exactly the `SELECT * FROM s.t` shape
        // the retrieval paths generate.
        let from = sql
            .split(" FROM ")
            .nth(1)
            .map(|rest| rest.split_whitespace().next().unwrap_or(""))
            .unwrap_or("");
        let mut parts = from.trim().trim_matches('"').splitn(2, '.');
        let schema = parts.next().unwrap_or("").trim_matches('"').to_string();
        let table = parts.next().unwrap_or("").trim_matches('"').to_string();

        let rows = self
            .tables
            .lock()
            .expect("tables lock")
            .get(&(schema.clone(), table.clone()))
            .map(|t| t.rows.clone())
            .ok_or_else(|| FlowError::Warehouse(format!("relation {schema}.{table} does not exist")))?;

        Ok(Box::pin(futures::stream::iter(rows.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(qid: &str, class: &str, table: &str) -> NewCacheRecord {
        NewCacheRecord {
            qid: QueryId::new(qid),
            class: class.to_string(),
            schema: if class == TABLE_CLASS { "events" } else { "cache" }.to_string(),
            table_name: table.to_string(),
            obj: vec![1, 2, 3],
            compute_time_ms: 5000,
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let wh = MemoryWarehouse::new();
        wh.materialize("cache", "x_a", "SELECT 1").await.unwrap();
        wh.insert_record(record("a", "daily_location", "x_a"), &[])
            .await
            .unwrap();

        let rec = wh.lookup(&QueryId::new("a")).await.unwrap().unwrap();
        assert_eq!(rec.access_count, 1);
        assert_eq!(rec.cache_score_multiplier, 1.0);
        assert_eq!(rec.last_touch, 1);
        assert!(wh.cache_table_exists(&QueryId::new("a")).await.unwrap());

        // Double insert must fail.
        assert!(wh
            .insert_record(record("a", "daily_location", "x_a"), &[])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_touch_updates_score_and_counter() {
        let wh = MemoryWarehouse::new();
        wh.set_half_life(10.0).await.unwrap();
        wh.materialize("cache", "x_b", "SELECT 2").await.unwrap();
        wh.insert_record(record("b", "daily_location", "x_b"), &[])
            .await
            .unwrap();

        // Insert was tick 1 with weight 1; this touch is tick 2.
        wh.touch(&QueryId::new("b")).await.unwrap();
        let rec = wh.lookup(&QueryId::new("b")).await.unwrap().unwrap();
        assert_eq!(rec.access_count, 2);
        assert_eq!(rec.last_touch, 2);
        let expected = 1.0 + touch_weight(1, 10.0);
        assert!((rec.cache_score_multiplier - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_touch_on_table_record_is_scoreless() {
        let wh = MemoryWarehouse::new();
        wh.create_table("events", "calls", Vec::new(), 1 << 20);
        wh.insert_record(record("t", TABLE_CLASS, "calls"), &[])
            .await
            .unwrap();

        let score = wh.touch(&QueryId::new("t")).await.unwrap();
        assert_eq!(score, 0.0);

        let rec = wh.lookup(&QueryId::new("t")).await.unwrap().unwrap();
        assert_eq!(rec.access_count, 2);
        assert_eq!(rec.last_touch, 0);
        assert_eq!(rec.cache_score_multiplier, 0.0);
        // The counter must not have advanced.
        assert_eq!(wh.counter.load(Ordering::SeqCst), 0);
        assert_eq!(wh.score(&QueryId::new("t")).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_missing_records_raise_not_found() {
        let wh = MemoryWarehouse::new();
        let missing = QueryId::new("nope");
        assert!(matches!(
            wh.touch(&missing).await,
            Err(FlowError::NotFound(_))
        ));
        assert!(matches!(
            wh.compute_time(&missing).await,
            Err(FlowError::NotFound(_))
        ));
        assert!(matches!(
            wh.score(&missing).await,
            Err(FlowError::NotFound(_))
        ));
        assert!(matches!(
            wh.size_of_table("nope", "cache").await,
            Err(FlowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_size_of_cache_excludes_tables() {
        let wh = MemoryWarehouse::new();
        wh.create_table("events", "calls", Vec::new(), 1 << 30);
        wh.insert_record(record("t", TABLE_CLASS, "calls"), &[])
            .await
            .unwrap();
        wh.materialize("cache", "x_c", "SELECT 3").await.unwrap();
        wh.set_table_size("cache", "x_c", 4096);
        wh.insert_record(record("c", "flows", "x_c"), &[])
            .await
            .unwrap();

        assert_eq!(wh.size_of_cache().await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn test_reset_clears_catalog_and_counter() {
        let wh = MemoryWarehouse::new();
        wh.materialize("cache", "x_d", "SELECT 4").await.unwrap();
        wh.insert_record(record("d", "flows", "x_d"), &[QueryId::new("p")])
            .await
            .unwrap();

        wh.reset().await.unwrap();
        assert!(!wh.cache_table_exists(&QueryId::new("d")).await.unwrap());
        assert!(!wh.relation_exists("x_d", "cache").await.unwrap());
        assert_eq!(wh.size_of_cache().await.unwrap(), 0);
        // Counter restarts at 1: the next tick is 2.
        assert_eq!(wh.next_tick(), 2);

        // Idempotent.
        wh.reset().await.unwrap();
        assert_eq!(wh.size_of_cache().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dependency_edges() {
        let wh = MemoryWarehouse::new();
        wh.materialize("cache", "x_p", "SELECT 5").await.unwrap();
        wh.insert_record(record("p", "daily_location", "x_p"), &[])
            .await
            .unwrap();
        wh.materialize("cache", "x_q", "SELECT 6").await.unwrap();
        wh.insert_record(record("q", "flows", "x_q"), &[QueryId::new("p")])
            .await
            .unwrap();

        let children = wh.children_of(&QueryId::new("p")).await.unwrap();
        assert_eq!(children, vec![QueryId::new("q")]);

        // Deleting the parent removes the edge but not the child record.
        wh.delete_record(&QueryId::new("p"), true).await.unwrap();
        assert!(wh.children_of(&QueryId::new("p")).await.unwrap().is_empty());
        assert!(wh.cache_table_exists(&QueryId::new("q")).await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_rows_from_materialized_table() {
        use futures::StreamExt;

        let wh = MemoryWarehouse::new();
        wh.materialize(
            "cache",
            "x_s",
            "SELECT calls.subscriber, cells.admin3pcod AS pcod \
             FROM events.calls AS calls JOIN infrastructure.cells AS cells \
             ON calls.location_id = cells.id",
        )
        .await
        .unwrap();
        let mut stream = wh.stream_rows("SELECT * FROM cache.x_s").await.unwrap();
        let mut count = 0;
        while let Some(row) = stream.next().await {
            let row = row.unwrap();
            assert!(row.contains_key("subscriber"));
            assert!(row.contains_key("pcod"));
            count += 1;
        }
        assert_eq!(count, 3);

        assert!(wh.stream_rows("SELECT * FROM cache.missing").await.is_err());
    }

    #[test]
    fn test_select_list_columns() {
        assert_eq!(
            select_list_columns(
                "SELECT pcod, count(*) AS total FROM cache.xabc GROUP BY pcod"
            ),
            vec!["pcod", "total"]
        );
        assert_eq!(
            select_list_columns(
                "SELECT cells.admin3pcod AS pcod, \
                 date_trunc('day', events.datetime) AS interval_start, \
                 count(*) AS total FROM (SELECT 1) AS events"
            ),
            vec!["pcod", "interval_start", "total"]
        );
        assert_eq!(
            select_list_columns(
                "SELECT DISTINCT ON (subscriber) subscriber, admin3pcod AS pcod \
                 FROM cache.xdef ORDER BY subscriber, event_time DESC"
            ),
            vec!["subscriber", "pcod"]
        );
    }
}
