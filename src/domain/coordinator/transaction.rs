//! Three-phase multi-participant transactions

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::{LoadTracker, Transaction, TransactionOperation, TransactionResult, TransactionState};
use crate::shared::errors::{CoordinationError, InvokeError};
use crate::shared::utils::generate_id;

/// Participant key used for faults not attributable to a server
const COORDINATOR: &str = "coordinator";

/// Runs Prepare, Execute, then Commit or Rollback over an ordered list of
/// participant operations. Phases call participants one at a time in list
/// order; rollback walks the executed participants in reverse.
pub struct TransactionCoordinator {
    tracker: Arc<LoadTracker>,
    timeout_ms: u64,
    active: RwLock<HashMap<String, Transaction>>,
    shutting_down: AtomicBool,
}

impl TransactionCoordinator {
    pub fn new(tracker: Arc<LoadTracker>, timeout_ms: u64) -> Self {
        Self {
            tracker,
            timeout_ms,
            active: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Refuse new transactions; in-flight ones keep their last recorded state
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shutting_down.store(false, Ordering::SeqCst);
    }

    pub async fn active_transactions(&self) -> Vec<Transaction> {
        let mut transactions: Vec<Transaction> = self.active.read().await.values().cloned().collect();
        transactions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        transactions
    }

    pub async fn transaction(&self, id: &str) -> Result<Transaction, CoordinationError> {
        self.active
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoordinationError::UnknownTransaction(id.to_string()))
    }

    /// Run a transaction to a terminal state. Never returns an error;
    /// every failure lands in the result's error map.
    pub async fn coordinate(&self, operations: Vec<TransactionOperation>) -> TransactionResult {
        let started = Instant::now();
        let id = generate_id();

        if self.shutting_down.load(Ordering::SeqCst) {
            let mut errors = BTreeMap::new();
            errors.insert(COORDINATOR.to_string(), CoordinationError::Cancelled.to_string());
            return Self::result(&id, TransactionState::Failed, BTreeMap::new(), errors, Vec::new(), started);
        }

        if operations.is_empty() {
            let mut errors = BTreeMap::new();
            errors.insert(COORDINATOR.to_string(), "transaction has no operations".to_string());
            return Self::result(&id, TransactionState::Failed, BTreeMap::new(), errors, Vec::new(), started);
        }

        let keys = participant_keys(&operations);
        self.active.write().await.insert(
            id.clone(),
            Transaction {
                id: id.clone(),
                operations: operations.clone(),
                state: TransactionState::Preparing,
                results: BTreeMap::new(),
                errors: BTreeMap::new(),
                created_at: Utc::now(),
                timeout_ms: self.timeout_ms,
            },
        );
        info!("🔐 Transaction {} started with {} participants", id, operations.len());

        let mut results = BTreeMap::new();
        let mut errors = BTreeMap::new();
        let mut rolled_back = Vec::new();

        let final_state = match self
            .run_phases(&id, &operations, &keys, started, &mut results, &mut errors, &mut rolled_back)
            .await
        {
            Ok(state) => state,
            Err(fault) => {
                error!("❌ Transaction {} fault: {}", id, fault);
                errors.insert(COORDINATOR.to_string(), fault.to_string());
                TransactionState::Failed
            }
        };

        self.active.write().await.remove(&id);
        match final_state {
            TransactionState::Committed => info!("✅ Transaction {} committed", id),
            TransactionState::RolledBack => warn!("↩️  Transaction {} rolled back: {:?}", id, rolled_back),
            _ => warn!("❌ Transaction {} ended {}", id, final_state),
        }

        Self::result(&id, final_state, results, errors, rolled_back, started)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        id: &str,
        operations: &[TransactionOperation],
        keys: &[String],
        started: Instant,
        results: &mut BTreeMap<String, Value>,
        errors: &mut BTreeMap<String, String>,
        rolled_back: &mut Vec<String>,
    ) -> Result<TransactionState, CoordinationError> {
        // Prepare
        for (operation, key) in operations.iter().zip(keys) {
            if let Err(e) = self.call(id, operation, "prepare", started).await {
                let failure = CoordinationError::PrepareFailure {
                    server: operation.server_id.clone(),
                    reason: e.to_string(),
                };
                errors.insert(key.clone(), failure.to_string());
                self.record(id, TransactionState::Failed, results, errors).await?;
                return Ok(TransactionState::Failed);
            }
        }
        self.record(id, TransactionState::Prepared, results, errors).await?;

        // Execute
        self.record(id, TransactionState::Executing, results, errors).await?;
        let mut executed = Vec::new();
        for (index, (operation, key)) in operations.iter().zip(keys).enumerate() {
            match self.call(id, operation, &operation.action, started).await {
                Ok(value) => {
                    results.insert(key.clone(), value);
                    executed.push(index);
                }
                Err(e) => {
                    let failure = CoordinationError::ExecuteFailure {
                        server: operation.server_id.clone(),
                        reason: e.to_string(),
                    };
                    errors.insert(key.clone(), failure.to_string());
                }
            }
        }

        if !errors.is_empty() {
            self.record(id, TransactionState::RollingBack, results, errors).await?;
            let mut undelivered = 0;
            for index in executed.into_iter().rev() {
                let operation = &operations[index];
                let key = &keys[index];
                match self.compensate(id, operation).await {
                    Ok(_) => rolled_back.push(key.clone()),
                    Err(e) => {
                        error!("❌ Rollback of {} in transaction {} failed: {}", key, id, e);
                        errors.insert(format!("{}:rollback", key), e.to_string());
                        undelivered += 1;
                    }
                }
            }

            // An executed participant that never saw its rollback is not undone
            let state = if undelivered == 0 {
                TransactionState::RolledBack
            } else {
                TransactionState::Failed
            };
            self.record(id, state, results, errors).await?;
            return Ok(state);
        }

        // Commit
        self.record(id, TransactionState::Committing, results, errors).await?;
        for (operation, key) in operations.iter().zip(keys) {
            if let Err(e) = self.call(id, operation, "commit", started).await {
                let failure = CoordinationError::CommitFailure {
                    server: operation.server_id.clone(),
                    reason: e.to_string(),
                };
                errors.insert(key.clone(), failure.to_string());
            }
        }

        let state = if errors.is_empty() {
            TransactionState::Committed
        } else {
            TransactionState::Failed
        };
        self.record(id, state, results, errors).await?;
        Ok(state)
    }

    /// One participant call bounded by the smaller of the invoke timeout
    /// and what is left of the transaction timeout
    async fn call(
        &self,
        id: &str,
        operation: &TransactionOperation,
        name: &str,
        started: Instant,
    ) -> Result<Value, InvokeError> {
        let elapsed = started.elapsed().as_millis() as u64;
        let remaining = self.timeout_ms.saturating_sub(elapsed);
        if remaining == 0 {
            return Err(InvokeError::Timeout(self.timeout_ms));
        }

        self.send(id, operation, name, remaining.min(self.tracker.invoke_timeout_ms()))
            .await
    }

    /// Rollback call with its own invoke timeout, outside the transaction
    /// budget
    async fn compensate(&self, id: &str, operation: &TransactionOperation) -> Result<Value, InvokeError> {
        self.send(id, operation, "rollback", self.tracker.invoke_timeout_ms())
            .await
    }

    async fn send(
        &self,
        id: &str,
        operation: &TransactionOperation,
        name: &str,
        timeout_ms: u64,
    ) -> Result<Value, InvokeError> {
        let arguments = json!({
            "transaction_id": id,
            "action": operation.action,
            "parameters": operation.parameters,
        });
        self.tracker
            .invoke(&operation.server_id, name, arguments, timeout_ms)
            .await
    }

    async fn record(
        &self,
        id: &str,
        state: TransactionState,
        results: &BTreeMap<String, Value>,
        errors: &BTreeMap<String, String>,
    ) -> Result<(), CoordinationError> {
        let mut active = self.active.write().await;
        let transaction = active
            .get_mut(id)
            .ok_or_else(|| CoordinationError::UnknownTransaction(id.to_string()))?;
        transaction.state = state;
        transaction.results = results.clone();
        transaction.errors = errors.clone();
        Ok(())
    }

    fn result(
        id: &str,
        final_state: TransactionState,
        results: BTreeMap<String, Value>,
        errors: BTreeMap<String, String>,
        rolled_back: Vec<String>,
        started: Instant,
    ) -> TransactionResult {
        TransactionResult {
            transaction_id: id.to_string(),
            success: final_state == TransactionState::Committed,
            final_state,
            results,
            errors,
            rolled_back,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Server id per operation, or `server#index` when a server appears twice
fn participant_keys(operations: &[TransactionOperation]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for operation in operations {
        *counts.entry(operation.server_id.as_str()).or_insert(0) += 1;
    }

    operations
        .iter()
        .enumerate()
        .map(|(index, operation)| {
            if counts[operation.server_id.as_str()] > 1 {
                format!("{}#{}", operation.server_id, index)
            } else {
                operation.server_id.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::coordinator::LoadLimits;
    use crate::domain::registry::{Capability, ServerKind, ServerRecord};
    use crate::testing::{connected_registry, ScriptedInvoker};

    async fn coordinator(invoker: Arc<ScriptedInvoker>) -> TransactionCoordinator {
        coordinator_with(invoker, 1000, 200).await
    }

    async fn coordinator_with(invoker: Arc<ScriptedInvoker>, timeout_ms: u64, invoke_timeout_ms: u64) -> TransactionCoordinator {
        let records = ["a", "b", "c"]
            .iter()
            .map(|id| ServerRecord::new(*id, *id, ServerKind::Exchange).with_capability(Capability::new("exchange_data")))
            .collect();
        let registry = connected_registry(records).await;
        let tracker = Arc::new(LoadTracker::new(registry, invoker, LoadLimits::default(), invoke_timeout_ms));
        TransactionCoordinator::new(tracker, timeout_ms)
    }

    fn ops(servers: &[&str]) -> Vec<TransactionOperation> {
        servers
            .iter()
            .map(|s| TransactionOperation::new(*s, "swap", json!({ "amount": 1 })))
            .collect()
    }

    #[tokio::test]
    async fn test_all_participants_commit() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("b", "swap", json!({ "filled": 1 }));
        let tx = coordinator(invoker.clone()).await;

        let result = tx.coordinate(ops(&["a", "b", "c"])).await;

        assert!(result.success);
        assert_eq!(result.final_state, TransactionState::Committed);
        assert_eq!(result.results["b"], json!({ "filled": 1 }));
        assert_eq!(invoker.servers_called("commit"), vec!["a", "b", "c"]);
        assert!(tx.active_transactions().await.is_empty());

        let args = invoker.arguments_for("a", "prepare");
        assert_eq!(args[0]["transaction_id"], json!(result.transaction_id));
        assert_eq!(args[0]["action"], json!("swap"));
    }

    #[tokio::test]
    async fn test_execute_failure_rolls_back_in_reverse_order() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.fail("c", "swap", "insufficient liquidity");
        let tx = coordinator(invoker.clone()).await;

        let result = tx.coordinate(ops(&["a", "b", "c"])).await;

        assert!(!result.success);
        assert_eq!(result.final_state, TransactionState::RolledBack);
        assert_eq!(invoker.servers_called("rollback"), vec!["b", "a"]);
        assert_eq!(result.rolled_back, vec!["b", "a"]);
        assert!(result.errors["c"].contains("insufficient liquidity"));
        assert!(invoker.servers_called("commit").is_empty());
    }

    #[tokio::test]
    async fn test_prepare_failure_executes_nothing() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.fail("b", "prepare", "locked");
        let tx = coordinator(invoker.clone()).await;

        let result = tx.coordinate(ops(&["a", "b", "c"])).await;

        assert_eq!(result.final_state, TransactionState::Failed);
        assert!(invoker.servers_called("swap").is_empty());
        assert!(invoker.servers_called("rollback").is_empty());
        assert_eq!(invoker.servers_called("prepare"), vec!["a", "b"]);
        assert!(result.errors["b"].contains("Prepare failed"));
    }

    #[tokio::test]
    async fn test_commit_failure_ends_failed() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.fail("a", "commit", "disk full");
        let tx = coordinator(invoker.clone()).await;

        let result = tx.coordinate(ops(&["a", "b"])).await;

        assert_eq!(result.final_state, TransactionState::Failed);
        assert_eq!(invoker.servers_called("commit"), vec!["a", "b"]);
        assert!(result.errors["a"].contains("Commit failed"));
    }

    #[tokio::test]
    async fn test_execute_timeout_is_a_participant_failure() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.delay("b", "swap", 500, json!({}));
        let tx = coordinator(invoker.clone()).await;

        let result = tx.coordinate(ops(&["a", "b"])).await;

        assert_eq!(result.final_state, TransactionState::RolledBack);
        assert_eq!(result.rolled_back, vec!["a"]);
        assert!(result.errors["b"].contains("timed out"));
    }

    #[tokio::test]
    async fn test_rollback_still_delivered_after_budget_spent() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.delay("a", "swap", 150, json!({}));
        invoker.delay("b", "swap", 500, json!({}));
        let tx = coordinator_with(invoker.clone(), 300, 200).await;

        let result = tx.coordinate(ops(&["a", "b"])).await;

        assert_eq!(result.final_state, TransactionState::RolledBack);
        assert_eq!(invoker.servers_called("rollback"), vec!["a"]);
        assert_eq!(result.rolled_back, vec!["a"]);
        assert!(result.errors["b"].contains("timed out"));
        assert!(!result.errors.contains_key("a:rollback"));
    }

    #[tokio::test]
    async fn test_undelivered_rollback_ends_failed() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.fail("c", "swap", "slippage");
        invoker.fail("a", "rollback", "connection reset");
        let tx = coordinator(invoker.clone()).await;

        let result = tx.coordinate(ops(&["a", "b", "c"])).await;

        assert_eq!(result.final_state, TransactionState::Failed);
        assert_eq!(invoker.servers_called("rollback"), vec!["b", "a"]);
        assert_eq!(result.rolled_back, vec!["b"]);
        assert!(result.errors["a:rollback"].contains("connection reset"));
        assert!(tx.active_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_every_outcome_is_terminal() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.fail("c", "prepare", "nope");
        let tx = coordinator(invoker).await;

        for servers in [vec!["a"], vec!["a", "c"], vec![]] {
            let result = tx.coordinate(ops(&servers)).await;
            assert!(result.final_state.is_terminal());
        }

        tx.shutdown();
        let result = tx.coordinate(ops(&["a"])).await;
        assert_eq!(result.final_state, TransactionState::Failed);
        assert_eq!(result.errors[COORDINATOR], CoordinationError::Cancelled.to_string());
    }

    #[test]
    fn test_duplicate_servers_get_indexed_keys() {
        let keys = participant_keys(&ops(&["a", "b", "a"]));
        assert_eq!(keys, vec!["a#0", "b", "a#2"]);
    }
}
