// Postgres warehouse backend.
//
// The catalog lives in the `cache` schema; scoring runs inside the
// `touch_cache` server-side function so concurrent touches from many workers
// serialize on the row lock and the touch-counter sequence. Result retrieval
// uses a named server-side cursor inside a read-only transaction.

use std::str::FromStr;

use async_stream::try_stream;
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Type;
use tokio_postgres::{NoTls, Row};

use super::{
    CacheRecord, JsonRow, NewCacheRecord, RowStream, Warehouse, CONFIG_CACHE_SIZE,
    CONFIG_HALF_LIFE, TABLE_CLASS,
};
use crate::error::{FlowError, Result};
use crate::identity::QueryId;

const SCHEMA_DDL: &str = include_str!("schema.sql");

/// Warehouse backed by a pooled Postgres connection.
pub struct PgWarehouse {
    pool: Pool,
    fetch_batch_size: usize,
}

impl PgWarehouse {
    /// Connect to `url` and apply the cache schema DDL idempotently.
    pub async fn connect(url: &str, pool_size: usize, fetch_batch_size: usize) -> Result<Self> {
        let pg_config = tokio_postgres::Config::from_str(url)
            .map_err(|e| FlowError::Configuration(format!("invalid warehouse url: {e}")))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| FlowError::Configuration(format!("pool construction failed: {e}")))?;

        let warehouse = Self {
            pool,
            fetch_batch_size,
        };
        warehouse.ensure_schema().await?;
        Ok(warehouse)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA_DDL).await?;
        Ok(())
    }

    fn record_from_row(row: &Row) -> Result<CacheRecord> {
        Ok(CacheRecord {
            qid: QueryId::new(row.try_get::<_, String>("query_id")?),
            class: row.try_get("class")?,
            schema: row.try_get("schema")?,
            table_name: row.try_get("tablename")?,
            obj: row.try_get("obj")?,
            compute_time_ms: row.try_get("compute_time")?,
            access_count: row.try_get("access_count")?,
            last_accessed: row.try_get("last_accessed")?,
            cache_score_multiplier: row.try_get("cache_score_multiplier")?,
            last_touch: row.try_get("last_touch")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Quote an SQL identifier, doubling any embedded quotes.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Convert one cursor row into a JSON object, using the same JSON
/// encoder/decoder for JSON-typed columns as the response envelope.
fn row_to_json(row: &Row) -> Result<JsonRow> {
    use serde_json::Value;

    let mut object = JsonRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?
                .map_or(Value::Null, Value::Bool)
        } else if *ty == Type::INT2 {
            number(row.try_get::<_, Option<i16>>(idx)?.map(i64::from))
        } else if *ty == Type::INT4 {
            number(row.try_get::<_, Option<i32>>(idx)?.map(i64::from))
        } else if *ty == Type::INT8 {
            number(row.try_get::<_, Option<i64>>(idx)?)
        } else if *ty == Type::FLOAT4 {
            float(row.try_get::<_, Option<f32>>(idx)?.map(f64::from))
        } else if *ty == Type::FLOAT8 {
            float(row.try_get::<_, Option<f64>>(idx)?)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<Value>>(idx)?.unwrap_or(Value::Null)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<chrono::NaiveDate>>(idx)?
                .map_or(Value::Null, |d| {
                    Value::String(d.format("%Y-%m-%d").to_string())
                })
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
                .map_or(Value::Null, |t| Value::String(t.to_rfc3339()))
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
                .map_or(Value::Null, |t| Value::String(t.to_string()))
        } else {
            row.try_get::<_, Option<String>>(idx)
                .unwrap_or(None)
                .map_or(Value::Null, Value::String)
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(object)
}

fn number(value: Option<i64>) -> serde_json::Value {
    value.map_or(serde_json::Value::Null, |v| v.into())
}

fn float(value: Option<f64>) -> serde_json::Value {
    serde_json::Number::from_f64(value.unwrap_or(f64::NAN))
        .map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Errors raised by catalog functions for absent rows or relations.
fn not_found(err: &tokio_postgres::Error, what: String) -> Option<FlowError> {
    let db = err.as_db_error()?;
    if db.message().contains("is not in cache") || db.message().contains("does not exist") {
        Some(FlowError::NotFound(what))
    } else {
        None
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn lookup(&self, qid: &QueryId) -> Result<Option<CacheRecord>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM cache.cached WHERE query_id = $1",
                &[&qid.as_str()],
            )
            .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn insert_record(&self, record: NewCacheRecord, parents: &[QueryId]) -> Result<()> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;

        let insert = if record.class == TABLE_CLASS {
            "INSERT INTO cache.cached \
             (query_id, class, schema, tablename, obj, compute_time, \
              access_count, cache_score_multiplier, last_touch) \
             VALUES ($1, $2, $3, $4, $5, $6, 1, 0, 0)"
        } else {
            // The insert is the record's first touch: weight 1 at the
            // current tick.
            "INSERT INTO cache.cached \
             (query_id, class, schema, tablename, obj, compute_time, \
              access_count, cache_score_multiplier, last_touch) \
             VALUES ($1, $2, $3, $4, $5, $6, 1, 1.0, \
                     nextval('cache.cache_touches'))"
        };
        txn.execute(
            insert,
            &[
                &record.qid.as_str(),
                &record.class,
                &record.schema,
                &record.table_name,
                &record.obj,
                &record.compute_time_ms,
            ],
        )
        .await
        .map_err(|e| {
            if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                FlowError::Warehouse(format!("query {} is already cached", record.qid))
            } else {
                e.into()
            }
        })?;

        for parent in parents {
            txn.execute(
                "INSERT INTO cache.dependencies (child, parent) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
                &[&record.qid.as_str(), &parent.as_str()],
            )
            .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    async fn touch(&self, qid: &QueryId) -> Result<f64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one("SELECT touch_cache($1)", &[&qid.as_str()])
            .await
            .map_err(|e| {
                not_found(&e, format!("query {qid} is not in cache")).unwrap_or_else(|| e.into())
            })?;
        Ok(row.try_get(0)?)
    }

    async fn size_of_cache(&self) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COALESCE(SUM(table_size(tablename, schema)), 0)::BIGINT \
                 FROM cache.cached WHERE class <> 'Table'",
                &[],
            )
            .await?;
        Ok(row.try_get::<_, i64>(0)? as u64)
    }

    async fn size_of_table(&self, table: &str, schema: &str) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one("SELECT table_size($1, $2)", &[&table, &schema])
            .await
            .map_err(|e| {
                not_found(&e, format!("table {schema}.{table} does not exist"))
                    .unwrap_or_else(|| e.into())
            })?;
        Ok(row.try_get::<_, i64>(0)? as u64)
    }

    async fn compute_time(&self, qid: &QueryId) -> Result<f64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT compute_time FROM cache.cached WHERE query_id = $1",
                &[&qid.as_str()],
            )
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("query {qid} is not in cache")))?;
        Ok(row.try_get::<_, i64>(0)? as f64 / 1000.0)
    }

    async fn score(&self, qid: &QueryId) -> Result<f64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT cache_score_multiplier \
                 * ((compute_time::DOUBLE PRECISION / 1000) \
                    / table_size(tablename, schema)) \
                 FROM cache.cached WHERE query_id = $1",
                &[&qid.as_str()],
            )
            .await
            .map_err(|e| {
                not_found(&e, format!("query {qid} is not in cache")).unwrap_or_else(|| e.into())
            })?
            .ok_or_else(|| FlowError::NotFound(format!("query {qid} is not in cache")))?;
        Ok(row.try_get(0)?)
    }

    async fn records_by_score(&self) -> Result<Vec<(QueryId, u64)>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT query_id, table_size(tablename, schema) AS table_size \
                 FROM cache.cached WHERE class <> 'Table' \
                 ORDER BY cache_score_multiplier \
                 * ((compute_time::DOUBLE PRECISION / 1000) \
                    / table_size(tablename, schema)) ASC",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    QueryId::new(row.try_get::<_, String>(0)?),
                    row.try_get::<_, i64>(1)? as u64,
                ))
            })
            .collect()
    }

    async fn children_of(&self, qid: &QueryId) -> Result<Vec<QueryId>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT child FROM cache.dependencies WHERE parent = $1",
                &[&qid.as_str()],
            )
            .await?;
        rows.iter()
            .map(|row| Ok(QueryId::new(row.try_get::<_, String>(0)?)))
            .collect()
    }

    async fn cached_qids(&self) -> Result<Vec<QueryId>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT query_id FROM cache.cached", &[])
            .await?;
        rows.iter()
            .map(|row| Ok(QueryId::new(row.try_get::<_, String>(0)?)))
            .collect()
    }

    async fn delete_record(&self, qid: &QueryId, drop_table: bool) -> Result<()> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;

        let row = txn
            .query_opt(
                "SELECT schema, tablename, class FROM cache.cached WHERE query_id = $1",
                &[&qid.as_str()],
            )
            .await?;
        if let Some(row) = row {
            let schema: String = row.try_get(0)?;
            let table: String = row.try_get(1)?;
            let class: String = row.try_get(2)?;
            if drop_table && class != TABLE_CLASS {
                txn.execute(
                    &format!("DROP TABLE IF EXISTS {} CASCADE", qualified(&schema, &table)),
                    &[],
                )
                .await?;
            }
        }
        txn.execute(
            "DELETE FROM cache.dependencies WHERE child = $1 OR parent = $1",
            &[&qid.as_str()],
        )
        .await?;
        txn.execute(
            "DELETE FROM cache.cached WHERE query_id = $1",
            &[&qid.as_str()],
        )
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn cache_table_exists(&self, qid: &QueryId) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM cache.cached WHERE query_id = $1)",
                &[&qid.as_str()],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn reset(&self) -> Result<()> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;

        let rows = txn
            .query(
                "SELECT schema, tablename FROM cache.cached WHERE class <> 'Table'",
                &[],
            )
            .await?;
        for row in &rows {
            let schema: String = row.try_get(0)?;
            let table: String = row.try_get(1)?;
            txn.execute(
                &format!("DROP TABLE IF EXISTS {} CASCADE", qualified(&schema, &table)),
                &[],
            )
            .await?;
        }
        txn.execute("TRUNCATE cache.cached CASCADE", &[]).await?;
        txn.execute("TRUNCATE cache.dependencies CASCADE", &[])
            .await?;
        txn.execute("SELECT setval('cache.cache_touches', 1)", &[])
            .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn max_cache_size(&self) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client.query_one("SELECT cache_max_size()", &[]).await?;
        Ok(row.try_get::<_, i64>(0)? as u64)
    }

    async fn set_max_cache_size(&self, bytes: u64) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE cache.cache_config SET value = $1 WHERE key = $2",
                &[&bytes.to_string(), &CONFIG_CACHE_SIZE],
            )
            .await?;
        Ok(())
    }

    async fn half_life(&self) -> Result<f64> {
        let client = self.pool.get().await?;
        let row = client.query_one("SELECT cache_half_life()", &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn set_half_life(&self, half_life: f64) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE cache.cache_config SET value = $1 WHERE key = $2",
                &[&half_life.to_string(), &CONFIG_HALF_LIFE],
            )
            .await?;
        Ok(())
    }

    async fn materialize(&self, schema: &str, table: &str, sql: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                &format!("CREATE TABLE {} AS ({})", qualified(schema, table), sql),
                &[],
            )
            .await?;
        Ok(())
    }

    async fn relation_exists(&self, table: &str, schema: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT to_regclass($1) IS NOT NULL",
                &[&format!("{schema}.{table}")],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn stream_rows(&self, sql: &str) -> Result<RowStream> {
        let pool = self.pool.clone();
        let batch = self.fetch_batch_size;
        let sql = sql.to_string();

        let stream = try_stream! {
            let mut client = pool.get().await?;
            let txn = client.build_transaction().read_only(true).start().await?;
            txn.execute(
                &format!("DECLARE eventflow_cursor NO SCROLL CURSOR FOR {sql}"),
                &[],
            )
            .await?;
            let fetch = format!("FETCH {batch} FROM eventflow_cursor");
            loop {
                let rows = txn.query(&fetch, &[]).await?;
                if rows.is_empty() {
                    break;
                }
                for row in &rows {
                    yield row_to_json(row)?;
                }
            }
            txn.commit().await?;
        };
        Ok(Box::pin(stream))
    }
}
