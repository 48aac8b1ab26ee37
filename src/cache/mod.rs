// # Cache Manager
//
// Policy layer over the warehouse catalog: scoring-driven eviction under a
// size budget, invalidation (optionally cascading along dependency edges),
// full reset, and the half-life / max-size configuration. Raw-table records
// never participate in eviction; their score is pinned at zero and the
// ordering the eviction loop consumes excludes them at the source.

use std::sync::Arc;

use tracing::{info, warn};

use crate::coordination::CoordinationStore;
use crate::error::{FlowError, Result};
use crate::identity::QueryId;
use crate::queries::QueryDescriptor;
use crate::state::{QueryState, QueryStateMachine};
use crate::warehouse::Warehouse;

/// Eviction, invalidation, and configuration over one warehouse and one
/// coordination store.
#[derive(Clone)]
pub struct CacheManager {
    warehouse: Arc<dyn Warehouse>,
    coordination: Arc<dyn CoordinationStore>,
}

impl CacheManager {
    pub fn new(warehouse: Arc<dyn Warehouse>, coordination: Arc<dyn CoordinationStore>) -> Self {
        Self {
            warehouse,
            coordination,
        }
    }

    fn state_machine(&self, qid: &QueryId) -> QueryStateMachine {
        QueryStateMachine::new(Arc::clone(&self.coordination), qid.clone())
    }

    /// Remove the lowest-scoring cached query, or report it without removing
    /// when `dry_run`. Returns the evicted qid and the bytes it freed, or
    /// `None` when the cache holds no evictable records.
    pub async fn shrink_one(&self, dry_run: bool) -> Result<Option<(QueryId, u64)>> {
        let ordered = self.warehouse.records_by_score().await?;
        let Some((qid, size)) = ordered.into_iter().next() else {
            return Ok(None);
        };

        info!(
            qid = %qid,
            size_bytes = size,
            "{} remove lowest-scoring cache record",
            if dry_run { "would" } else { "will" }
        );
        if !dry_run {
            self.invalidate(&qid, false).await?;
        }
        Ok(Some((qid, size)))
    }

    /// Evict in ascending score order until the cache is at or below
    /// `threshold` bytes. Returns the evicted qids, in eviction order.
    ///
    /// Each non-dry iteration strictly decreases the cache size, so the loop
    /// terminates; a dry run walks a pre-materialized ordering snapshot
    /// without mutating anything.
    pub async fn shrink_below_size(&self, threshold: u64, dry_run: bool) -> Result<Vec<QueryId>> {
        let initial = self.warehouse.size_of_cache().await?;
        info!(
            current_bytes = initial,
            threshold_bytes = threshold,
            dry_run,
            "shrinking cache"
        );

        let mut removed = Vec::new();
        if dry_run {
            let mut projected = initial;
            for (qid, size) in self.warehouse.records_by_score().await? {
                if projected <= threshold {
                    break;
                }
                removed.push(qid);
                projected = projected.saturating_sub(size);
            }
            return Ok(removed);
        }

        while self.warehouse.size_of_cache().await? > threshold {
            match self.shrink_one(false).await? {
                Some((qid, _)) => removed.push(qid),
                None => break,
            }
        }
        Ok(removed)
    }

    /// Purge one cached query: cancel it if in flight, bracket the removal
    /// in RESET / FINISH_RESET, drop the materialized table, and delete the
    /// catalog row and every edge naming it. With `cascade`, children (the
    /// queries built from this one's table) are invalidated first; without,
    /// the edges are removed but the children stay materialized.
    pub async fn invalidate(&self, qid: &QueryId, cascade: bool) -> Result<()> {
        let machine = self.state_machine(qid);

        let state = machine.current_state().await?;
        if matches!(state, QueryState::Queued | QueryState::Executing) {
            machine.cancel().await?;
        }

        let (state, resetting) = machine.reset().await?;
        if !resetting && state != QueryState::Resetting {
            // Nothing ran for this qid; there may still be a stale catalog
            // row if a previous reset died half-way.
            if !self.warehouse.cache_table_exists(qid).await? {
                return Ok(());
            }
            warn!(qid = %qid, state = %state, "removing catalog row without a reset bracket");
        }

        if cascade {
            for child in self.warehouse.children_of(qid).await? {
                Box::pin(self.invalidate(&child, true)).await?;
            }
        }

        self.warehouse.delete_record(qid, true).await?;
        machine.clear_error().await?;
        machine.finish_reset().await?;
        info!(qid = %qid, cascade, "invalidated cache record");
        Ok(())
    }

    /// Drop every non-`Table` materialized table, truncate the catalog and
    /// dependency relations, reset the touch counter, and return every
    /// affected state machine to KNOWN. Idempotent.
    pub async fn reset_cache(&self) -> Result<()> {
        let qids = self.warehouse.cached_qids().await?;
        self.warehouse.reset().await?;
        for qid in qids {
            let machine = self.state_machine(&qid);
            machine.reset().await?;
            machine.clear_error().await?;
            machine.finish_reset().await?;
        }
        info!("cache reset");
        Ok(())
    }

    /// Cheap probe: is there a catalog row for this qid?
    pub async fn cache_table_exists(&self, qid: &QueryId) -> Result<bool> {
        self.warehouse.cache_table_exists(qid).await
    }

    /// Reconstruct the stored query object for a cached qid from its
    /// descriptor blob.
    pub async fn query_by_id(&self, qid: &QueryId) -> Result<QueryDescriptor> {
        let record = self
            .warehouse
            .lookup(qid)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("query {qid} is not in cache")))?;
        QueryDescriptor::from_blob(&record.obj)
    }

    pub async fn get_cache_size(&self) -> Result<u64> {
        self.warehouse.max_cache_size().await
    }

    pub async fn set_cache_size(&self, bytes: u64) -> Result<()> {
        self.warehouse.set_max_cache_size(bytes).await
    }

    pub async fn get_half_life(&self) -> Result<f64> {
        self.warehouse.half_life().await
    }

    /// Change the score half-life. Historical multipliers are not rewritten,
    /// so scores accumulated before the change mix only approximately with
    /// scores accumulated after it.
    pub async fn set_half_life(&self, half_life: f64) -> Result<()> {
        if half_life <= 0.0 {
            return Err(FlowError::Configuration(
                "half_life must be positive".to_string(),
            ));
        }
        self.warehouse.set_half_life(half_life).await
    }
}
