// Query descriptors: the capability surface the rest of the server sees.
//
// A descriptor knows its identity, the SQL that materializes it, the
// dependencies that must be materialized first, and (for location kinds)
// how to derive its spatial aggregate. Descriptors are reconstructable from
// the version-tagged blob stored on the cache record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::identity::{fingerprint, QueryId};
use crate::warehouse::{CACHE_SCHEMA, TABLE_CLASS};

/// Blob format version written to `cache.cached.obj`.
const BLOB_VERSION: u16 = 1;

/// Class tag recorded for spatial aggregates derived via
/// [`QueryDescriptor::aggregate`].
pub const SPATIAL_AGGREGATE: &str = "spatial_aggregate";

/// A validated, buildable query.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    kind: String,
    params: Value,
    qid: QueryId,
    schema: String,
    table_name: String,
    sql: String,
    dependencies: Vec<QueryDescriptor>,
    aggregatable: bool,
}

impl QueryDescriptor {
    /// Descriptor for a derived query materialized under the cache schema.
    pub fn derived(
        kind: &str,
        params: Value,
        sql: String,
        dependencies: Vec<QueryDescriptor>,
        aggregatable: bool,
    ) -> Self {
        let qid = fingerprint(kind, &params);
        let table_name = format!("x{qid}");
        Self {
            kind: kind.to_string(),
            params,
            qid,
            schema: CACHE_SCHEMA.to_string(),
            table_name,
            sql,
            dependencies,
            aggregatable,
        }
    }

    /// Descriptor for a raw base table that already exists in the warehouse.
    pub fn raw_table(params: Value, schema: &str, table_name: &str) -> Self {
        let qid = fingerprint(super::RAW_TABLE_KIND, &params);
        Self {
            kind: super::RAW_TABLE_KIND.to_string(),
            params,
            qid,
            schema: schema.to_string(),
            table_name: table_name.to_string(),
            sql: String::new(),
            dependencies: Vec::new(),
            aggregatable: false,
        }
    }

    pub fn qid(&self) -> &QueryId {
        &self.qid
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Catalog class tag: `Table` for raw tables, else the kind tag.
    pub fn class(&self) -> &str {
        if self.kind == super::RAW_TABLE_KIND {
            TABLE_CLASS
        } else {
            &self.kind
        }
    }

    pub fn is_table(&self) -> bool {
        self.kind == super::RAW_TABLE_KIND
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table_name)
    }

    /// The SELECT that materializes this query. Empty for raw tables, which
    /// already exist.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn dependencies(&self) -> &[QueryDescriptor] {
        &self.dependencies
    }

    /// Whether this query exposes a spatial aggregate.
    pub fn supports_aggregation(&self) -> bool {
        self.aggregatable
    }

    /// Spatial aggregate of this query: row counts per location unit, built
    /// from this query's materialized table. Only location kinds carry the
    /// capability.
    pub fn aggregate(&self) -> Result<QueryDescriptor> {
        if !self.aggregatable {
            return Err(FlowError::AggregationNotSupported(self.kind.clone()));
        }
        let params = serde_json::json!({
            "kind": self.kind,
            "params": self.params,
        });
        let sql = format!(
            "SELECT pcod, count(*) AS total FROM {} GROUP BY pcod",
            self.qualified_name()
        );
        Ok(QueryDescriptor::derived(
            SPATIAL_AGGREGATE,
            params,
            sql,
            vec![self.clone()],
            false,
        ))
    }

    /// Encode the version-tagged blob stored on the cache record.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let stored = StoredQuery {
            version: BLOB_VERSION,
            kind: self.kind.clone(),
            params: self.params.clone(),
        };
        Ok(rmp_serde::to_vec_named(&stored)?)
    }

    /// Rebuild a descriptor from a stored blob via the kind registry.
    pub fn from_blob(blob: &[u8]) -> Result<QueryDescriptor> {
        let stored: StoredQuery = rmp_serde::from_slice(blob)?;
        if stored.version != BLOB_VERSION {
            return Err(FlowError::Serialization(format!(
                "unsupported descriptor blob version {}",
                stored.version
            )));
        }
        if stored.kind == SPATIAL_AGGREGATE {
            let kind = stored.params["kind"]
                .as_str()
                .ok_or_else(|| {
                    FlowError::Serialization("malformed spatial aggregate blob".to_string())
                })?
                .to_string();
            let parent = super::build_canonical(&kind, stored.params["params"].clone())?;
            return parent.aggregate();
        }
        super::build_canonical(&stored.kind, stored.params)
    }
}

/// Self-describing serialized form of a descriptor: enough to reconstruct
/// the query object through the registry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredQuery {
    version: u16,
    kind: String,
    params: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plain(kind: &str, aggregatable: bool) -> QueryDescriptor {
        QueryDescriptor::derived(
            kind,
            json!({"start": "2016-01-01", "stop": "2016-01-07"}),
            "SELECT 1".to_string(),
            Vec::new(),
            aggregatable,
        )
    }

    #[test]
    fn test_table_name_is_qid_derived() {
        let descriptor = plain("subscriber_locations", false);
        assert_eq!(
            descriptor.table_name(),
            format!("x{}", descriptor.qid())
        );
        assert_eq!(descriptor.schema(), CACHE_SCHEMA);
    }

    #[test]
    fn test_aggregate_capability_gating() {
        let unsupported = plain("subscriber_locations", false);
        assert!(matches!(
            unsupported.aggregate(),
            Err(FlowError::AggregationNotSupported(_))
        ));

        let supported = plain("daily_location", true);
        let aggregate = supported.aggregate().unwrap();
        assert_eq!(aggregate.kind(), SPATIAL_AGGREGATE);
        assert_eq!(aggregate.dependencies().len(), 1);
        assert_eq!(aggregate.dependencies()[0].qid(), supported.qid());
        assert!(aggregate.sql().contains(&supported.qualified_name()));
    }

    #[test]
    fn test_aggregate_qid_differs_from_parent() {
        let parent = plain("daily_location", true);
        let aggregate = parent.aggregate().unwrap();
        assert_ne!(aggregate.qid(), parent.qid());
    }

    #[test]
    fn test_blob_version_gate() {
        let stored = StoredQuery {
            version: 99,
            kind: "daily_location".to_string(),
            params: json!({}),
        };
        let blob = rmp_serde::to_vec_named(&stored).unwrap();
        assert!(matches!(
            QueryDescriptor::from_blob(&blob),
            Err(FlowError::Serialization(_))
        ));
    }
}
