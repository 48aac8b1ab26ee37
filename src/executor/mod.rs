// # Executor
//
// Detached materialization of query descriptors. Submission enqueues the
// query's state machine and spawns a worker task; the worker races the
// EXECUTE transition against every other worker sharing the coordination
// store, and exactly one proceeds to run the warehouse statement. Losers
// wait on the state machine instead of re-running the work: that is the
// whole de-duplication story.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::coordination::CoordinationStore;
use crate::error::{FlowError, Result};
use crate::queries::QueryDescriptor;
use crate::state::QueryStateMachine;
use crate::warehouse::{NewCacheRecord, Warehouse};

/// Runs descriptors to completion against the warehouse.
#[derive(Clone)]
pub struct QueryRunner {
    warehouse: Arc<dyn Warehouse>,
    coordination: Arc<dyn CoordinationStore>,
    permits: Arc<Semaphore>,
}

impl QueryRunner {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        coordination: Arc<dyn CoordinationStore>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            warehouse,
            coordination,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    fn state_machine(&self, descriptor: &QueryDescriptor) -> QueryStateMachine {
        QueryStateMachine::new(Arc::clone(&self.coordination), descriptor.qid().clone())
    }

    /// Enqueue and run in the background. Returns once the QUEUE transition
    /// has been attempted; the heavy work happens in a detached task.
    pub async fn submit(&self, descriptor: QueryDescriptor) -> Result<()> {
        let machine = self.state_machine(&descriptor);
        let (_, newly_queued) = machine.enqueue().await?;
        if !newly_queued {
            // Already queued, running, or finished elsewhere. Idempotent.
            return Ok(());
        }

        let runner = self.clone();
        tokio::spawn(async move {
            let qid = descriptor.qid().clone();
            if let Err(err) = runner.run_to_completion(&descriptor).await {
                warn!(qid = %qid, error = %err, "query execution failed");
            }
        });
        Ok(())
    }

    /// Execute a descriptor to completion. Intended for the detached path
    /// but callable inline (tests, warm-up).
    pub async fn run_to_completion(&self, descriptor: &QueryDescriptor) -> Result<()> {
        self.ensure_stored(descriptor).await
    }

    /// Make sure a descriptor's output exists in cache, materializing its
    /// dependency closure first. Re-entrant across workers: each node of the
    /// closure is guarded by its own state machine.
    fn ensure_stored<'a>(&'a self, descriptor: &'a QueryDescriptor) -> BoxFuture<'a, Result<()>> {
        async move {
            let qid = descriptor.qid();
            if self.warehouse.cache_table_exists(qid).await? {
                return Ok(());
            }

            let machine = self.state_machine(descriptor);
            machine.enqueue().await?;
            let (_, sole_executor) = machine.execute().await?;
            if !sole_executor {
                // Another worker owns this query; wait for its verdict.
                if machine.block_while_executing(None).await? {
                    return Ok(());
                }
                return Err(FlowError::ExecutionFailed(format!(
                    "query {qid} failed in another worker"
                )));
            }

            match self.materialize(descriptor, &machine).await {
                Ok(true) => {
                    machine.finish().await?;
                    info!(qid = %qid, kind = descriptor.kind(), "materialized");
                    Ok(())
                }
                Ok(false) => {
                    info!(qid = %qid, "execution cancelled before completion");
                    Err(FlowError::ExecutionFailed(format!(
                        "query {qid} was cancelled"
                    )))
                }
                Err(err) => {
                    error!(qid = %qid, error = %err, "materialization failed");
                    machine.record_error(&err.to_string()).await?;
                    machine.error().await?;
                    Err(FlowError::ExecutionFailed(err.to_string()))
                }
            }
        }
        .boxed()
    }

    /// Returns `false` when a cancel was observed before the statement ran;
    /// nothing is inserted in that case.
    async fn materialize(
        &self,
        descriptor: &QueryDescriptor,
        machine: &QueryStateMachine,
    ) -> Result<bool> {
        for dependency in descriptor.dependencies() {
            if machine.is_cancelled().await? {
                return Ok(false);
            }
            self.ensure_stored(dependency).await?;
        }

        // A cancel between the dependency walk and the statement is the last
        // point we can cheaply observe it.
        if machine.is_cancelled().await? {
            return Ok(false);
        }

        let started = Instant::now();
        if descriptor.is_table() {
            if !self
                .warehouse
                .relation_exists(descriptor.table_name(), descriptor.schema())
                .await?
            {
                return Err(FlowError::ExecutionFailed(format!(
                    "raw table {} does not exist",
                    descriptor.qualified_name()
                )));
            }
        } else {
            // The permit bounds concurrent warehouse statements only; it is
            // not held across dependency waits, which would deadlock a small
            // pool.
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| FlowError::ExecutionFailed("executor is shut down".to_string()))?;
            self.warehouse
                .materialize(descriptor.schema(), descriptor.table_name(), descriptor.sql())
                .await?;
        }
        // Sub-millisecond builds still cost one tick of compute time so
        // their score stays positive.
        let compute_time_ms = if descriptor.is_table() {
            0
        } else {
            (started.elapsed().as_millis() as i64).max(1)
        };

        let parents = descriptor
            .dependencies()
            .iter()
            .map(|dep| dep.qid().clone())
            .collect::<Vec<_>>();
        self.warehouse
            .insert_record(
                NewCacheRecord {
                    qid: descriptor.qid().clone(),
                    class: descriptor.class().to_string(),
                    schema: descriptor.schema().to_string(),
                    table_name: descriptor.table_name().to_string(),
                    obj: descriptor.to_blob()?,
                    compute_time_ms,
                },
                &parents,
            )
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use crate::queries;
    use crate::state::QueryState;
    use crate::warehouse::MemoryWarehouse;
    use serde_json::json;

    fn runner() -> (QueryRunner, Arc<MemoryWarehouse>, Arc<MemoryStore>) {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.create_table("events", "calls", Vec::new(), 1 << 20);
        warehouse.create_table("events", "sms", Vec::new(), 1 << 20);
        warehouse.create_table("events", "mds", Vec::new(), 1 << 20);
        warehouse.create_table("events", "topups", Vec::new(), 1 << 20);
        let coordination = Arc::new(MemoryStore::new());
        let runner = QueryRunner::new(
            Arc::clone(&warehouse) as Arc<dyn Warehouse>,
            Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
            2,
        );
        (runner, warehouse, coordination)
    }

    fn daily_location() -> QueryDescriptor {
        queries::make_descriptor(
            "daily_location",
            &json!({
                "date": "2016-01-01",
                "daily_location_method": "most-common",
                "aggregation_unit": "admin3",
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_materializes_dependency_closure() {
        let (runner, warehouse, _) = runner();
        let descriptor = daily_location();

        runner.run_to_completion(&descriptor).await.unwrap();

        assert!(warehouse.cache_table_exists(descriptor.qid()).await.unwrap());
        let trace = &descriptor.dependencies()[0];
        assert!(warehouse.cache_table_exists(trace.qid()).await.unwrap());
        // The raw table got a catalog record too.
        let calls = &trace.dependencies()[0];
        let record = warehouse.lookup(calls.qid()).await.unwrap().unwrap();
        assert!(record.is_table());
        assert_eq!(record.compute_time_ms, 0);
    }

    #[tokio::test]
    async fn test_run_records_dependency_edges() {
        let (runner, warehouse, _) = runner();
        let descriptor = daily_location();
        runner.run_to_completion(&descriptor).await.unwrap();

        let trace = &descriptor.dependencies()[0];
        let children = warehouse.children_of(trace.qid()).await.unwrap();
        assert_eq!(children, vec![descriptor.qid().clone()]);
    }

    #[tokio::test]
    async fn test_run_walks_state_machine_to_executed() {
        let (runner, _, coordination) = runner();
        let descriptor = daily_location();
        runner.run_to_completion(&descriptor).await.unwrap();

        let machine = QueryStateMachine::new(
            Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
            descriptor.qid().clone(),
        );
        assert_eq!(machine.current_state().await.unwrap(), QueryState::Executed);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let (runner, warehouse, _) = runner();
        let descriptor = daily_location();
        runner.run_to_completion(&descriptor).await.unwrap();
        runner.run_to_completion(&descriptor).await.unwrap();
        assert!(warehouse.cache_table_exists(descriptor.qid()).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_raw_table_errors_the_machine() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let coordination = Arc::new(MemoryStore::new());
        let runner = QueryRunner::new(
            Arc::clone(&warehouse) as Arc<dyn Warehouse>,
            Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
            2,
        );
        let descriptor = queries::make_descriptor(
            "subscriber_locations",
            &json!({"start": "2016-01-01", "stop": "2016-01-02"}),
        )
        .unwrap();

        let err = runner.run_to_completion(&descriptor).await.unwrap_err();
        assert!(matches!(err, FlowError::ExecutionFailed(_)));

        // The raw-table dependency machine carries the error state and text.
        let calls = &descriptor.dependencies()[0];
        let machine = QueryStateMachine::new(
            Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
            calls.qid().clone(),
        );
        assert_eq!(machine.current_state().await.unwrap(), QueryState::Errored);
        assert!(machine
            .execution_error()
            .await
            .unwrap()
            .unwrap()
            .contains("does not exist"));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_single_execution() {
        let (runner, warehouse, coordination) = runner();
        let descriptor = daily_location();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let runner = runner.clone();
            let descriptor = descriptor.clone();
            handles.push(tokio::spawn(async move {
                runner.run_to_completion(&descriptor).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(warehouse.cache_table_exists(descriptor.qid()).await.unwrap());
        // One materialization means one insert: access_count is exactly 1.
        let record = warehouse.lookup(descriptor.qid()).await.unwrap().unwrap();
        assert_eq!(record.access_count, 1);

        let machine = QueryStateMachine::new(
            Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
            descriptor.qid().clone(),
        );
        assert_eq!(machine.current_state().await.unwrap(), QueryState::Executed);
    }

    #[tokio::test]
    async fn test_cancel_before_execute_skips_materialization() {
        let (runner, warehouse, coordination) = runner();
        let descriptor = daily_location();
        let machine = QueryStateMachine::new(
            Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
            descriptor.qid().clone(),
        );
        machine.enqueue().await.unwrap();
        machine.cancel().await.unwrap();

        // EXECUTE from CANCELLED is inapplicable; the worker backs off and
        // block_while_executing returns immediately.
        runner.run_to_completion(&descriptor).await.unwrap_err();
        assert!(!warehouse.cache_table_exists(descriptor.qid()).await.unwrap());
    }
}
