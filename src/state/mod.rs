// # Query State Machine
//
// Per-query lifecycle automaton shared by every worker through the
// coordination store. Transitions are compare-and-set operations on the
// `{qid}-state` key, so exactly one of any set of racing workers observes a
// successful transition. That single point of atomicity is what de-duplicates
// concurrent executions of the same logical query.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::coordination::CoordinationStore;
use crate::error::Result;
use crate::identity::QueryId;

/// Poll interval for `block_while_executing`. The contract bounds this at 2s.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Possible states for a query to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    /// Created but never run.
    Known,
    /// Scheduled to execute in the future.
    Queued,
    /// Currently materializing in the warehouse.
    Executing,
    /// Finished running successfully; its table is in cache.
    Executed,
    /// Ran but failed.
    Errored,
    /// Execution terminated by the user.
    Cancelled,
    /// Being purged from cache.
    Resetting,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Known => "known",
            QueryState::Queued => "queued",
            QueryState::Executing => "executing",
            QueryState::Executed => "executed",
            QueryState::Errored => "errored",
            QueryState::Cancelled => "cancelled",
            QueryState::Resetting => "resetting",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "known" => Some(QueryState::Known),
            "queued" => Some(QueryState::Queued),
            "executing" => Some(QueryState::Executing),
            "executed" => Some(QueryState::Executed),
            "errored" => Some(QueryState::Errored),
            "cancelled" => Some(QueryState::Cancelled),
            "resetting" => Some(QueryState::Resetting),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that trigger a transition to a new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEvent {
    Queue,
    Execute,
    Finish,
    Error,
    Cancel,
    Reset,
    FinishReset,
}

/// The full transition table. Any (event, state) pair not listed is a no-op
/// that reports `changed = false`.
const TRANSITIONS: &[(QueryEvent, QueryState, QueryState)] = &[
    (QueryEvent::Queue, QueryState::Known, QueryState::Queued),
    (QueryEvent::Execute, QueryState::Queued, QueryState::Executing),
    (QueryEvent::Finish, QueryState::Executing, QueryState::Executed),
    (QueryEvent::Error, QueryState::Executing, QueryState::Errored),
    (QueryEvent::Cancel, QueryState::Queued, QueryState::Cancelled),
    (QueryEvent::Cancel, QueryState::Executing, QueryState::Cancelled),
    (QueryEvent::Reset, QueryState::Cancelled, QueryState::Resetting),
    (QueryEvent::Reset, QueryState::Errored, QueryState::Resetting),
    (QueryEvent::Reset, QueryState::Executed, QueryState::Resetting),
    (QueryEvent::FinishReset, QueryState::Resetting, QueryState::Known),
];

fn next_state(event: QueryEvent, from: QueryState) -> Option<QueryState> {
    TRANSITIONS
        .iter()
        .find(|(e, f, _)| *e == event && *f == from)
        .map(|(_, _, to)| *to)
}

/// Handle on one query's state machine.
///
/// Cheap to construct; holds only the store handle and the key. Workers on
/// different machines construct their own handles over the same store and
/// observe a single linearized state history per query.
#[derive(Clone)]
pub struct QueryStateMachine {
    store: Arc<dyn CoordinationStore>,
    qid: QueryId,
}

impl QueryStateMachine {
    pub fn new(store: Arc<dyn CoordinationStore>, qid: QueryId) -> Self {
        Self { store, qid }
    }

    pub fn qid(&self) -> &QueryId {
        &self.qid
    }

    /// Read the current state. An absent key means the query is only known.
    pub async fn current_state(&self) -> Result<QueryState> {
        let raw = self.store.get(&self.qid.state_key()).await?;
        Ok(raw
            .as_deref()
            .and_then(QueryState::parse)
            .unwrap_or(QueryState::Known))
    }

    /// Apply `event`, returning the resulting state and whether the state
    /// actually changed.
    ///
    /// Inapplicable events are not errors: the current state comes back with
    /// `false`, and callers branch on the flag. Lost CAS races re-evaluate
    /// against the freshly observed state, so a worker can never apply a
    /// transition from a state the store no longer holds.
    pub async fn trigger(&self, event: QueryEvent) -> Result<(QueryState, bool)> {
        let key = self.qid.state_key();
        loop {
            let observed = self.store.get(&key).await?;
            let current = observed
                .as_deref()
                .and_then(QueryState::parse)
                .unwrap_or(QueryState::Known);

            let Some(target) = next_state(event, current) else {
                return Ok((current, false));
            };

            let outcome = self
                .store
                .compare_and_set(&key, observed.as_deref(), target.as_str())
                .await?;
            if outcome.applied() {
                return Ok((target, true));
            }
            // Someone else moved the machine between our read and write; loop
            // and re-evaluate the event against the new state.
        }
    }

    pub async fn enqueue(&self) -> Result<(QueryState, bool)> {
        self.trigger(QueryEvent::Queue).await
    }

    pub async fn execute(&self) -> Result<(QueryState, bool)> {
        self.trigger(QueryEvent::Execute).await
    }

    pub async fn finish(&self) -> Result<(QueryState, bool)> {
        self.trigger(QueryEvent::Finish).await
    }

    pub async fn error(&self) -> Result<(QueryState, bool)> {
        self.trigger(QueryEvent::Error).await
    }

    pub async fn cancel(&self) -> Result<(QueryState, bool)> {
        self.trigger(QueryEvent::Cancel).await
    }

    pub async fn reset(&self) -> Result<(QueryState, bool)> {
        self.trigger(QueryEvent::Reset).await
    }

    pub async fn finish_reset(&self) -> Result<(QueryState, bool)> {
        self.trigger(QueryEvent::FinishReset).await
    }

    pub async fn is_executing(&self) -> Result<bool> {
        Ok(self.current_state().await? == QueryState::Executing)
    }

    pub async fn is_queued(&self) -> Result<bool> {
        Ok(self.current_state().await? == QueryState::Queued)
    }

    pub async fn is_cancelled(&self) -> Result<bool> {
        Ok(self.current_state().await? == QueryState::Cancelled)
    }

    /// Finished running, successfully or not.
    pub async fn is_finished(&self) -> Result<bool> {
        Ok(matches!(
            self.current_state().await?,
            QueryState::Executed | QueryState::Errored
        ))
    }

    pub async fn is_executed_without_error(&self) -> Result<bool> {
        Ok(self.current_state().await? == QueryState::Executed)
    }

    /// Record the warehouse error text for this query. The cache record has
    /// no error slot, so the coordination store carries it for `/poll`.
    pub async fn record_error(&self, message: &str) -> Result<()> {
        self.store.set_value(&self.qid.error_key(), message).await
    }

    pub async fn execution_error(&self) -> Result<Option<String>> {
        self.store.get(&self.qid.error_key()).await
    }

    pub async fn clear_error(&self) -> Result<()> {
        self.store.delete(&self.qid.error_key()).await
    }

    /// Wait while the query is queued, executing, or resetting.
    ///
    /// Returns `true` iff the query ends in `Executed`. An optional
    /// cancellation signal makes the wait return `false` immediately without
    /// touching the machine.
    pub async fn block_while_executing(
        &self,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<bool> {
        loop {
            match self.current_state().await? {
                QueryState::Executed => return Ok(true),
                QueryState::Errored => return Ok(false),
                QueryState::Queued | QueryState::Executing | QueryState::Resetting => {}
                // Known or cancelled: nothing is coming; don't spin.
                QueryState::Known | QueryState::Cancelled => return Ok(false),
            }

            match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() {
                                return Ok(false);
                            }
                        }
                    }
                }
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;

    fn machine(store: &Arc<MemoryStore>, qid: &str) -> QueryStateMachine {
        let store: Arc<dyn CoordinationStore> = Arc::clone(store) as _;
        QueryStateMachine::new(store, QueryId::new(qid))
    }

    #[tokio::test]
    async fn test_initial_state_is_known() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(&store, "a1");
        assert_eq!(sm.current_state().await.unwrap(), QueryState::Known);
    }

    #[tokio::test]
    async fn test_happy_path_walk() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(&store, "a2");

        assert_eq!(sm.enqueue().await.unwrap(), (QueryState::Queued, true));
        assert_eq!(sm.execute().await.unwrap(), (QueryState::Executing, true));
        assert_eq!(sm.finish().await.unwrap(), (QueryState::Executed, true));
        assert_eq!(sm.reset().await.unwrap(), (QueryState::Resetting, true));
        assert_eq!(sm.finish_reset().await.unwrap(), (QueryState::Known, true));
    }

    #[tokio::test]
    async fn test_inapplicable_event_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(&store, "a3");

        // Finish from Known does nothing.
        assert_eq!(sm.finish().await.unwrap(), (QueryState::Known, false));
        // Queue twice: the second attempt reports the queued state unchanged.
        assert_eq!(sm.enqueue().await.unwrap(), (QueryState::Queued, true));
        assert_eq!(sm.enqueue().await.unwrap(), (QueryState::Queued, false));
    }

    #[tokio::test]
    async fn test_cancel_paths() {
        let store = Arc::new(MemoryStore::new());

        let sm = machine(&store, "a4");
        sm.enqueue().await.unwrap();
        assert_eq!(sm.cancel().await.unwrap(), (QueryState::Cancelled, true));
        assert_eq!(sm.reset().await.unwrap(), (QueryState::Resetting, true));

        let sm = machine(&store, "a5");
        sm.enqueue().await.unwrap();
        sm.execute().await.unwrap();
        assert_eq!(sm.cancel().await.unwrap(), (QueryState::Cancelled, true));
    }

    #[tokio::test]
    async fn test_error_path_records_message() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(&store, "a6");
        sm.enqueue().await.unwrap();
        sm.execute().await.unwrap();
        assert_eq!(sm.error().await.unwrap(), (QueryState::Errored, true));
        sm.record_error("relation does not exist").await.unwrap();
        assert_eq!(
            sm.execution_error().await.unwrap().as_deref(),
            Some("relation does not exist")
        );
    }

    #[tokio::test]
    async fn test_concurrent_execute_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(&store, "a7");
        sm.enqueue().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..12 {
            let sm = sm.clone();
            handles.push(tokio::spawn(async move {
                sm.execute().await.unwrap().1
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(sm.current_state().await.unwrap(), QueryState::Executing);
    }

    #[tokio::test]
    async fn test_block_while_executing_sees_finish() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(&store, "a8");
        sm.enqueue().await.unwrap();
        sm.execute().await.unwrap();

        let waiter = sm.clone();
        let handle = tokio::spawn(async move { waiter.block_while_executing(None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        sm.finish().await.unwrap();
        assert!(handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_block_while_executing_cancellation_signal() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(&store, "a9");
        sm.enqueue().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let waiter = sm.clone();
        let handle = tokio::spawn(async move { waiter.block_while_executing(Some(rx)).await });

        tx.send(true).unwrap();
        assert!(!handle.await.unwrap().unwrap());
        // The wait must not have mutated state.
        assert_eq!(sm.current_state().await.unwrap(), QueryState::Queued);
    }

    #[tokio::test]
    async fn test_block_returns_false_on_error() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(&store, "aa");
        sm.enqueue().await.unwrap();
        sm.execute().await.unwrap();
        sm.error().await.unwrap();
        assert!(!sm.block_while_executing(None).await.unwrap());
    }
}
