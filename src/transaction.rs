//! Transaction Manager (§4.3): records mutating operations inside a
//! scope, supports nested scopes and named savepoints, and on failure
//! issues compensating operations against the transport.
//!
//! Grounded on `spanner::transaction_manager`'s and
//! `spanner::session_pool`'s `TransactionManager`/`ManagedSession`
//! pattern, generalized from "one session, one retry loop" to a registry of
//! concurrently active, independently scoped transactions. A dropped
//! scope cannot run an async compensating rollback, so `Drop` only
//! marks the transaction `Failed` and logs — see [`TransactionScope`]
//! (§4.3.1).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::TransactionManagerConfig;
use crate::error::ClientError;
use crate::session::CallContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Failed,
}

/// One mutating call recorded inside an active transaction (§3).
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub op_type: OperationType,
    pub model: String,
    pub record_ids: Vec<i64>,
    pub original_data: Option<Map<String, Value>>,
    pub created_ids: Vec<i64>,
    /// For deletes: the pre-delete row(s), a single object or a list.
    pub rollback_data: Option<Value>,
    pub context: CallContext,
    pub idempotency_key: Option<String>,
    pub rollback_status: RollbackStatus,
    pub rollback_error: Option<String>,
    pub created_at: Instant,
}

impl OperationRecord {
    pub fn can_rollback(&self) -> bool {
        match self.op_type {
            OperationType::Create => !self.created_ids.is_empty() || !self.record_ids.is_empty(),
            OperationType::Update => !self.record_ids.is_empty() && self.original_data.is_some(),
            OperationType::Delete => self.rollback_data.is_some() || self.original_data.is_some(),
        }
    }
}

/// A named marker at a given operation-log index (§3, §4.3).
#[derive(Debug, Clone)]
pub struct Savepoint {
    pub id: String,
    pub name: Option<String>,
    pub operation_index: usize,
    pub context_snapshot: CallContext,
    pub parent_savepoint_id: Option<String>,
    pub is_released: bool,
    pub rollback_count: u32,
    pub created_at: Instant,
}

/// Returns the cache keys registered for a single recorded operation
/// (§4.3 "Operation recording"): a model key, per-record keys in two
/// shapes, and the model's glob patterns.
fn invalidation_keys_for(model: &str, record_ids: &[i64], created_ids: &[i64]) -> (Vec<String>, Vec<String>) {
    let mut keys = vec![model.to_string()];
    for id in record_ids.iter().chain(created_ids.iter()) {
        keys.push(format!("{model}:{id}"));
        keys.push(format!("record:{model}:{id}"));
    }
    (keys, model_invalidation_patterns(model))
}

/// The glob patterns a model's cache entries live under (§4.3, reused
/// by [`crate::cache::MemoryCache::invalidate_model`] so the cache
/// backend stays free of model-specific logic per §4.6.1).
pub fn model_invalidation_patterns(model: &str) -> Vec<String> {
    vec![format!("{model}:*"), format!("query:{model}:*"), format!("search:{model}:*"), format!("list:{model}:*")]
}

struct TxState {
    state: TransactionState,
    operations: Vec<OperationRecord>,
    savepoints: Vec<Savepoint>,
    cache_keys: HashSet<String>,
    cache_patterns: HashSet<String>,
    cache_models: HashSet<String>,
    context: CallContext,
}

/// A scope's tracked operations, savepoints, and cache-invalidation
/// set. Owned by exactly one [`TransactionScope`]; nested transactions
/// hold an `Arc` to their parent (§3 "Ownership").
pub struct Transaction {
    pub id: String,
    parent: Option<Arc<Transaction>>,
    children: Mutex<Vec<Arc<Transaction>>>,
    state: Mutex<TxState>,
    pub created_at: Instant,
}

impl Transaction {
    fn new(id: String, parent: Option<Arc<Transaction>>, context: CallContext) -> Self {
        Transaction {
            id,
            parent,
            children: Mutex::new(Vec::new()),
            state: Mutex::new(TxState {
                state: TransactionState::Active,
                operations: Vec::new(),
                savepoints: Vec::new(),
                cache_keys: HashSet::new(),
                cache_patterns: HashSet::new(),
                cache_models: HashSet::new(),
                context,
            }),
            created_at: Instant::now(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn state(&self) -> TransactionState {
        self.state.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub fn operation_count(&self) -> usize {
        self.state.lock().operations.len()
    }

    pub fn context(&self) -> CallContext {
        self.state.lock().context.clone()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_operation(
        &self,
        op_type: OperationType,
        model: impl Into<String>,
        record_ids: Vec<i64>,
        original_data: Option<Map<String, Value>>,
        created_ids: Vec<i64>,
        rollback_data: Option<Value>,
        idempotency_key: Option<String>,
        context: CallContext,
    ) -> Result<(), TransactionError> {
        let model = model.into();
        let mut state = self.state.lock();
        if state.state != TransactionState::Active {
            return Err(TransactionError::NotActive(self.id.clone()));
        }
        let (keys, patterns) = invalidation_keys_for(&model, &record_ids, &created_ids);
        state.cache_models.insert(model.clone());
        state.cache_keys.extend(keys);
        state.cache_patterns.extend(patterns);
        state.operations.push(OperationRecord {
            op_type,
            model,
            record_ids,
            original_data,
            created_ids,
            rollback_data,
            context,
            idempotency_key,
            rollback_status: RollbackStatus::Pending,
            rollback_error: None,
            created_at: Instant::now(),
        });
        Ok(())
    }

    pub fn create_savepoint(&self, name: Option<String>, context: Option<CallContext>) -> Result<String, TransactionError> {
        let mut state = self.state.lock();
        if state.state != TransactionState::Active {
            return Err(TransactionError::NotActive(self.id.clone()));
        }
        let parent_savepoint_id = state.savepoints.iter().rev().find(|s| !s.is_released).map(|s| s.id.clone());
        let snapshot = match context {
            Some(c) => state.context.merged(&c),
            None => state.context.clone(),
        };
        let id = Uuid::new_v4().to_string();
        state.savepoints.push(Savepoint {
            id: id.clone(),
            name,
            operation_index: state.operations.len(),
            context_snapshot: snapshot,
            parent_savepoint_id,
            is_released: false,
            rollback_count: 0,
            created_at: Instant::now(),
        });
        Ok(id)
    }

    pub fn release_savepoint(&self, id: &str) -> Result<(), TransactionError> {
        let mut state = self.state.lock();
        let sp = state.savepoints.iter_mut().find(|s| s.id == id).ok_or_else(|| TransactionError::UnknownSavepoint(id.to_string()))?;
        sp.is_released = true;
        Ok(())
    }

    /// Truncates the operation log to `savepoint.operation_index`,
    /// releases every savepoint created after it, restores the context
    /// snapshot, and returns the operations removed (caller executes
    /// compensations for them, in reverse order).
    fn truncate_to_savepoint(&self, id: &str) -> Result<Vec<OperationRecord>, TransactionError> {
        let mut state = self.state.lock();
        let (index, snapshot) = {
            let sp = state.savepoints.iter().find(|s| s.id == id).ok_or_else(|| TransactionError::UnknownSavepoint(id.to_string()))?;
            (sp.operation_index, sp.context_snapshot.clone())
        };
        let removed = state.operations.split_off(index);
        for sp in state.savepoints.iter_mut() {
            if sp.operation_index >= index && sp.id != id {
                sp.is_released = true;
            }
        }
        if let Some(sp) = state.savepoints.iter_mut().find(|s| s.id == id) {
            sp.rollback_count += 1;
        }
        state.context = snapshot;
        Ok(removed)
    }

    fn mark(&self, new_state: TransactionState) {
        self.state.lock().state = new_state;
    }

    fn add_child(&self, child: Arc<Transaction>) {
        self.children.lock().push(child);
    }

    fn active_children(&self) -> Vec<Arc<Transaction>> {
        self.children.lock().iter().filter(|c| c.is_active()).cloned().collect()
    }

    fn invalidation_set(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let state = self.state.lock();
        (state.cache_keys.iter().cloned().collect(), state.cache_patterns.iter().cloned().collect(), state.cache_models.iter().cloned().collect())
    }

    fn set_rollback_status(&self, index: usize, status: RollbackStatus, error: Option<String>) {
        let mut state = self.state.lock();
        if let Some(op) = state.operations.get_mut(index) {
            op.rollback_status = status;
            op.rollback_error = error;
        }
    }

    fn operations_snapshot(&self) -> Vec<OperationRecord> {
        self.state.lock().operations.clone()
    }
}

/// The CRUD surface the Transaction Manager needs to issue
/// compensating operations, implemented by [`crate::client::Client`].
/// A trait (rather than a direct `Arc<Client>` dependency) avoids a
/// Client -> TransactionManager -> Client ownership cycle: the
/// executor is only borrowed for the duration of a commit/rollback
/// call, never stored inside the manager (§9 "mutable global-like
/// instance state").
#[async_trait]
pub trait CrudExecutor: Send + Sync {
    async fn rollback_create(&self, model: &str, ids: &[i64], context: &CallContext) -> Result<(), ClientError>;
    async fn rollback_update(&self, model: &str, ids: &[i64], data: &Map<String, Value>, context: &CallContext) -> Result<(), ClientError>;
    /// Recreates deleted rows from `rollback_data` (single object -> one
    /// create, array -> one create per element) and returns the new ids.
    async fn rollback_delete(&self, model: &str, rollback_data: &Value, context: &CallContext) -> Result<Vec<i64>, ClientError>;
}

#[derive(thiserror::Error, Debug)]
pub enum TransactionError {
    #[error("transaction {0} is not active")]
    NotActive(String),
    #[error("unknown savepoint {0}")]
    UnknownSavepoint(String),
    #[error("too many active transactions (limit {0})")]
    TooManyActive(usize),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("rollback failed with {} failure(s) (partial_rollback={partial_rollback})", failures.len())]
    Rollback { failures: Vec<(usize, String)>, partial_rollback: bool },
    #[error("transaction manager is not set up; call setup_transaction_manager() first")]
    NotConfigured,
    #[error("transaction {id} exceeded its {timeout:?} timeout and was marked failed")]
    Expired { id: String, timeout: std::time::Duration },
}

/// Registry of concurrently active, independently scoped transactions
/// (§4.3.1). Owns the transaction tree; each [`Transaction`] owns its
/// own operation log and savepoints.
pub struct TransactionManager {
    config: TransactionManagerConfig,
    cache: Option<Arc<dyn Cache>>,
    active: Mutex<HashMap<String, Arc<Transaction>>>,
    /// Explicit current-transaction stack. SPEC_FULL §4.3.1 suggests a
    /// `tokio::task_local!`, which fits a closure-scoped body; this crate's
    /// API instead returns an explicit [`TransactionScope`] guard per the
    /// same section, so "current transaction" is tracked as an ordinary
    /// locked stack rather than an ambient task-local (documented in
    /// DESIGN.md).
    stack: Mutex<Vec<Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(config: TransactionManagerConfig, cache: Option<Arc<dyn Cache>>) -> Arc<Self> {
        Arc::new(TransactionManager { config, cache, active: Mutex::new(HashMap::new()), stack: Mutex::new(Vec::new()) })
    }

    pub fn current(&self) -> Option<Arc<Transaction>> {
        self.stack.lock().last().cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Opens a new transaction scope (§4.3's "Scope contract"). The
    /// returned guard is active immediately; callers must explicitly
    /// `commit()` or `rollback()` it — dropping it without doing either
    /// just marks the transaction `Failed` (see [`TransactionScope`]).
    pub fn transaction(self: &Arc<Self>, id: Option<String>, auto_commit: bool) -> Result<TransactionScope, TransactionError> {
        let mut active = self.active.lock();
        if active.len() >= self.config.max_active_transactions {
            return Err(TransactionError::TooManyActive(self.config.max_active_transactions));
        }
        let parent = self.stack.lock().last().cloned();
        let context = parent.as_ref().map(|p| p.context()).unwrap_or_default();
        let tx = Arc::new(Transaction::new(id.unwrap_or_else(|| Uuid::new_v4().to_string()), parent.clone(), context));
        if let Some(p) = &parent {
            p.add_child(tx.clone());
        }
        active.insert(tx.id.clone(), tx.clone());
        drop(active);
        self.stack.lock().push(tx.clone());

        Ok(TransactionScope { manager: self.clone(), tx: Some(tx), auto_commit, finalized: false })
    }

    fn pop_if_top(&self, tx: &Arc<Transaction>) {
        let mut stack = self.stack.lock();
        if stack.last().map(|t| Arc::ptr_eq(t, tx)).unwrap_or(false) {
            stack.pop();
        }
    }

    fn finish(&self, tx: &Arc<Transaction>) {
        self.active.lock().remove(&tx.id);
        self.pop_if_top(tx);
    }

    /// Commits `tx`. Nested transactions just mark themselves committed
    /// — the root is the one that actually flushes and invalidates the
    /// cache (§4.3 "Commit semantics"). A transaction still open past
    /// `TransactionManagerConfig::default_timeout` is refused and marked
    /// `Failed` instead of committed, the same way the connection pool
    /// retires a connection once it outlives `connection_ttl`.
    ///
    /// Commit-time flushing policy (Open Question, resolved in
    /// DESIGN.md): operations already executed against the transport
    /// when the caller issued them, so commit never re-issues RPCs; it
    /// only logs the operation-count summary and publishes cache
    /// invalidation.
    pub async fn commit(&self, tx: &Arc<Transaction>) -> Result<(), TransactionError> {
        if !tx.is_active() {
            return Err(TransactionError::NotActive(tx.id.clone()));
        }
        if tx.created_at.elapsed() > self.config.default_timeout {
            tx.mark(TransactionState::Failed);
            self.finish(tx);
            return Err(TransactionError::Expired { id: tx.id.clone(), timeout: self.config.default_timeout });
        }
        if !tx.is_root() {
            tx.mark(TransactionState::Committed);
            self.finish(tx);
            return Ok(());
        }

        for child in tx.active_children() {
            Box::pin(self.commit(&child)).await?;
        }

        let op_count = tx.operation_count();
        tracing::debug!(transaction_id = %tx.id, operations = op_count, "committing transaction");

        tx.mark(TransactionState::Committed);
        self.finish(tx);
        self.publish_cache_invalidation(tx).await;
        Ok(())
    }

    async fn publish_cache_invalidation(&self, tx: &Arc<Transaction>) {
        let Some(cache) = &self.cache else { return };
        let (keys, patterns, models) = tx.invalidation_set();
        for key in keys {
            if let Err(e) = cache.delete(&key).await {
                tracing::warn!(error = %e, key, "cache invalidation failed on commit, ignoring");
            }
        }
        for pattern in patterns {
            if let Err(e) = cache.invalidate_pattern(&pattern).await {
                tracing::warn!(error = %e, pattern, "cache pattern invalidation failed on commit, ignoring");
            }
        }
        for model in models {
            if let Err(e) = cache.invalidate_model(&model).await {
                tracing::warn!(error = %e, model, "cache model invalidation failed on commit, ignoring");
            }
        }
    }

    /// Rolls back `tx`: children first, then this transaction's own
    /// operation log in reverse order via compensating calls (§4.3
    /// "Rollback semantics").
    pub async fn rollback(&self, tx: &Arc<Transaction>, executor: &dyn CrudExecutor) -> Result<(), TransactionError> {
        if !tx.is_active() {
            tracing::warn!(transaction_id = %tx.id, state = ?tx.state(), "rollback called on a non-active transaction, ignoring");
            return Ok(());
        }
        for child in tx.active_children() {
            let _ = Box::pin(self.rollback(&child, executor)).await;
        }

        let ops = tx.operations_snapshot();
        let result = execute_rollback_operations(tx, &ops, executor).await;
        self.finish(tx);
        match result {
            Ok(()) => {
                tx.mark(TransactionState::RolledBack);
                Ok(())
            }
            Err(failures) => {
                let partial_rollback = failures.len() < ops.iter().filter(|o| o.can_rollback()).count();
                tx.mark(TransactionState::Failed);
                Err(TransactionError::Rollback { failures, partial_rollback })
            }
        }
    }

    pub async fn rollback_to_savepoint(&self, tx: &Arc<Transaction>, savepoint_id: &str, executor: &dyn CrudExecutor) -> Result<(), TransactionError> {
        if !tx.is_active() {
            return Err(TransactionError::NotActive(tx.id.clone()));
        }
        let removed = tx.truncate_to_savepoint(savepoint_id)?;
        if let Err(failures) = execute_rollback_operations(tx, &removed, executor).await {
            return Err(TransactionError::Rollback { failures, partial_rollback: true });
        }
        Ok(())
    }
}

/// Executes compensating operations for `ops` in reverse order,
/// mutating `tx`'s per-operation rollback status in place. Returns
/// `Ok(())` if every record rolled back cleanly, else the list of
/// `(index, error)` failures (§4.3).
async fn execute_rollback_operations(tx: &Arc<Transaction>, ops: &[OperationRecord], executor: &dyn CrudExecutor) -> Result<(), Vec<(usize, String)>> {
    let mut failures = Vec::new();
    for (i, op) in ops.iter().enumerate().rev() {
        if !op.can_rollback() {
            tx.set_rollback_status(i, RollbackStatus::Skipped, Some("insufficient rollback data".to_string()));
            continue;
        }
        let outcome = match op.op_type {
            OperationType::Create => {
                let ids: Vec<i64> = if !op.created_ids.is_empty() { op.created_ids.clone() } else { op.record_ids.clone() };
                match executor.rollback_create(&op.model, &ids, &op.context).await {
                    Ok(()) => Ok(()),
                    Err(e) if is_already_absent(&e) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            }
            OperationType::Update => {
                let data = op.original_data.clone().unwrap_or_default();
                executor.rollback_update(&op.model, &op.record_ids, &data, &op.context).await.map(|_| ()).map_err(|e| e.to_string())
            }
            OperationType::Delete => {
                let data = op.rollback_data.clone().unwrap_or(Value::Null);
                executor.rollback_delete(&op.model, &data, &op.context).await.map(|_| ()).map_err(|e| e.to_string())
            }
        };
        match outcome {
            Ok(()) => tx.set_rollback_status(i, RollbackStatus::Success, None),
            Err(err) => {
                tx.set_rollback_status(i, RollbackStatus::Failed, Some(err.clone()));
                failures.push((i, err));
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}

fn is_already_absent(error: &ClientError) -> bool {
    let message = error.to_string().to_lowercase();
    matches!(error.kind(), crate::error::ErrorKind::Missing) || message.contains("does not exist") || message.contains("not found")
}

/// RAII-ish handle returned by [`TransactionManager::transaction`].
/// Callers should call [`TransactionScope::commit`] or
/// [`TransactionScope::rollback`] explicitly; if neither runs before
/// the guard drops and the transaction is still active, `Drop` marks it
/// `Failed` and logs a warning rather than silently discarding it —
/// compensating rollback needs an async `CrudExecutor` call that `Drop`
/// cannot perform, so there is no compensation to run here, only a
/// last-resort state transition mirroring `ManagedSession`'s
/// return-to-pool-on-drop safety net (see DESIGN.md).
pub struct TransactionScope {
    manager: Arc<TransactionManager>,
    tx: Option<Arc<Transaction>>,
    pub auto_commit: bool,
    finalized: bool,
}

impl TransactionScope {
    pub fn transaction(&self) -> &Arc<Transaction> {
        self.tx.as_ref().expect("transaction scope already finalized")
    }

    pub async fn commit(mut self) -> Result<(), TransactionError> {
        let tx = self.tx.take().expect("transaction scope already finalized");
        self.finalized = true;
        self.manager.commit(&tx).await
    }

    pub async fn rollback(mut self, executor: &dyn CrudExecutor) -> Result<(), TransactionError> {
        let tx = self.tx.take().expect("transaction scope already finalized");
        self.finalized = true;
        self.manager.rollback(&tx, executor).await
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        if let Some(tx) = self.tx.take() {
            if tx.is_active() {
                tracing::warn!(
                    transaction_id = %tx.id,
                    "transaction scope dropped without commit()/rollback(); marking failed (no executor available for compensation)"
                );
                tx.mark(TransactionState::Failed);
            }
            self.manager.finish(&tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingExecutor {
        fn new() -> Self {
            RecordingExecutor { calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl CrudExecutor for RecordingExecutor {
        async fn rollback_create(&self, model: &str, ids: &[i64], _context: &CallContext) -> Result<(), ClientError> {
            self.calls.lock().push(format!("unlink({model}, {ids:?})"));
            Ok(())
        }
        async fn rollback_update(&self, model: &str, ids: &[i64], data: &Map<String, Value>, _context: &CallContext) -> Result<(), ClientError> {
            self.calls.lock().push(format!("write({model}, {ids:?}, {data:?})"));
            Ok(())
        }
        async fn rollback_delete(&self, model: &str, _data: &Value, _context: &CallContext) -> Result<Vec<i64>, ClientError> {
            self.calls.lock().push(format!("create({model})"));
            Ok(vec![99])
        }
    }

    #[tokio::test]
    async fn rollback_executes_compensations_in_lifo_order_scenario_4() {
        let manager = TransactionManager::new(TransactionManagerConfig::default(), None);
        let scope = manager.transaction(None, true).unwrap();
        let tx = scope.transaction().clone();
        tx.add_operation(
            OperationType::Create,
            "res.partner",
            vec![1, 2],
            None,
            vec![1, 2],
            None,
            None,
            CallContext::new(),
        )
        .unwrap();
        let mut data = Map::new();
        data.insert("name".into(), Value::String("Old".into()));
        tx.add_operation(OperationType::Update, "res.partner", vec![3], Some(data), vec![], None, None, CallContext::new()).unwrap();

        let executor = RecordingExecutor::new();
        scope.rollback(&executor).await.unwrap();

        let calls = executor.calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("write(res.partner, [3]"));
        assert!(calls[1].starts_with("unlink(res.partner, [1, 2]"));
    }

    #[tokio::test]
    async fn commit_publishes_union_of_registered_invalidations() {
        struct CountingCache {
            deleted: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl Cache for CountingCache {
            async fn get(&self, _k: &str) -> Result<Option<Value>, crate::error::CacheError> {
                Ok(None)
            }
            async fn set(&self, _k: &str, _v: Value, _ttl: Option<std::time::Duration>) -> Result<(), crate::error::CacheError> {
                Ok(())
            }
            async fn delete(&self, k: &str) -> Result<(), crate::error::CacheError> {
                self.deleted.lock().push(k.to_string());
                Ok(())
            }
            async fn invalidate_pattern(&self, _p: &str) -> Result<usize, crate::error::CacheError> {
                Ok(0)
            }
            async fn invalidate_model(&self, _m: &str) -> Result<usize, crate::error::CacheError> {
                Ok(0)
            }
            async fn get_stats(&self) -> CacheStats {
                CacheStats::default()
            }
            async fn close(&self) {}
        }
        use crate::cache::CacheStats;

        let cache = Arc::new(CountingCache { deleted: Mutex::new(Vec::new()) });
        let manager = TransactionManager::new(TransactionManagerConfig::default(), Some(cache.clone() as Arc<dyn Cache>));
        let scope = manager.transaction(None, true).unwrap();
        let tx = scope.transaction().clone();
        tx.add_operation(OperationType::Create, "res.partner", vec![1], None, vec![1], None, None, CallContext::new()).unwrap();
        scope.commit().await.unwrap();

        let deleted = cache.deleted.lock();
        assert!(deleted.contains(&"res.partner".to_string()));
        assert!(deleted.contains(&"res.partner:1".to_string()));
        assert!(deleted.contains(&"record:res.partner:1".to_string()));
    }

    #[tokio::test]
    async fn rollback_to_savepoint_truncates_log_and_releases_later_savepoints() {
        let manager = TransactionManager::new(TransactionManagerConfig::default(), None);
        let scope = manager.transaction(None, true).unwrap();
        let tx = scope.transaction().clone();
        tx.add_operation(OperationType::Create, "m", vec![1], None, vec![1], None, None, CallContext::new()).unwrap();
        let sp = tx.create_savepoint(Some("sp1".into()), None).unwrap();
        tx.add_operation(OperationType::Create, "m", vec![2], None, vec![2], None, None, CallContext::new()).unwrap();
        let sp2 = tx.create_savepoint(Some("sp2".into()), None).unwrap();
        tx.add_operation(OperationType::Create, "m", vec![3], None, vec![3], None, None, CallContext::new()).unwrap();

        let executor = RecordingExecutor::new();
        manager.rollback_to_savepoint(&tx, &sp, &executor).await.unwrap();

        assert_eq!(tx.operation_count(), 1);
        assert_eq!(executor.calls.lock().len(), 2);
        // sp2 was implicitly released by the rollback; releasing it again
        // explicitly is idempotent, not an error (§4.3 "release_savepoint").
        assert!(tx.release_savepoint(&sp2).is_ok());
    }

    #[tokio::test]
    async fn exceeding_max_active_transactions_fails() {
        let config = TransactionManagerConfig { max_active_transactions: 1, ..Default::default() };
        let manager = TransactionManager::new(config, None);
        let _first = manager.transaction(None, true).unwrap();
        let second = manager.transaction(None, true);
        assert!(matches!(second, Err(TransactionError::TooManyActive(1))));
    }

    #[tokio::test]
    async fn nested_commit_defers_to_root() {
        let manager = TransactionManager::new(TransactionManagerConfig::default(), None);
        let outer = manager.transaction(None, true).unwrap();
        let outer_tx = outer.transaction().clone();
        {
            let inner = manager.transaction(None, true).unwrap();
            let inner_tx = inner.transaction().clone();
            assert!(!inner_tx.is_root());
            inner.commit().await.unwrap();
            assert_eq!(inner_tx.state(), TransactionState::Committed);
        }
        assert_eq!(outer_tx.state(), TransactionState::Active);
        outer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn commit_past_default_timeout_fails_and_marks_the_transaction_failed() {
        let config = TransactionManagerConfig { default_timeout: std::time::Duration::from_millis(20), ..Default::default() };
        let manager = TransactionManager::new(config, None);
        let scope = manager.transaction(None, true).unwrap();
        let tx = scope.transaction().clone();

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        let result = scope.commit().await;
        assert!(matches!(result, Err(TransactionError::Expired { .. })));
        assert_eq!(tx.state(), TransactionState::Failed);
        assert_eq!(manager.active_count(), 0);
    }
}
