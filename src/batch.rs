//! Batch Engine (§4.4): heterogeneous create/update/delete operations,
//! validated and chunked, executed through an injected [`BatchExecutor`]
//! with bounded concurrency, per-chunk fault isolation, progress
//! reporting, and aggregate statistics.
//!
//! `max_concurrency` is enforced with a [`tokio::sync::Semaphore`] and
//! chunk tasks are joined via [`futures::stream::FuturesUnordered`] for
//! completion-order processing — the async-Rust analogue of Python's
//! `asyncio.as_completed` (§4.4.1).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::BatchManagerConfig;
use crate::error::ClientError;
use crate::session::CallContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("batch validation failed: {0}")]
    Validation(String),
    #[error("batch execution failed: {0}")]
    Execution(String),
    #[error("batch size error: {0}")]
    Size(String),
    #[error("batch operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("batch has already been executed")]
    AlreadyExecuted,
    #[error("cannot execute an empty batch")]
    Empty,
    #[error("batch manager is not set up; call setup_batch_manager() first")]
    NotConfigured,
}

/// One accumulated create/update/delete request. `data`/`record_ids`
/// carry the payload; per-record update entries carry their id inline
/// in `data` (§4.4).
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Create { model: String, data: Vec<Map<String, Value>>, priority: i32, context: CallContext },
    /// `record_ids: None` means per-record form: each element of `data`
    /// must contain an `id` field plus at least one value field.
    Update { model: String, data: Vec<Map<String, Value>>, record_ids: Option<Vec<i64>>, priority: i32, context: CallContext },
    Delete { model: String, ids: Vec<i64>, priority: i32, context: CallContext },
}

impl BatchOperation {
    pub fn create(model: impl Into<String>, data: Vec<Map<String, Value>>) -> Self {
        BatchOperation::Create { model: model.into(), data, priority: 0, context: CallContext::new() }
    }

    /// Bulk-update form: the same `values` applied to every id in `record_ids`.
    pub fn update_bulk(model: impl Into<String>, record_ids: Vec<i64>, values: Map<String, Value>) -> Self {
        BatchOperation::Update { model: model.into(), data: vec![values], record_ids: Some(record_ids), priority: 0, context: CallContext::new() }
    }

    /// Per-record form: each entry must include its own `id`.
    pub fn update_per_record(model: impl Into<String>, data: Vec<Map<String, Value>>) -> Self {
        BatchOperation::Update { model: model.into(), data, record_ids: None, priority: 0, context: CallContext::new() }
    }

    pub fn delete(model: impl Into<String>, ids: Vec<i64>) -> Self {
        BatchOperation::Delete { model: model.into(), ids, priority: 0, context: CallContext::new() }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        match &mut self {
            BatchOperation::Create { priority: p, .. } | BatchOperation::Update { priority: p, .. } | BatchOperation::Delete { priority: p, .. } => *p = priority,
        }
        self
    }

    pub fn priority(&self) -> i32 {
        match self {
            BatchOperation::Create { priority, .. } | BatchOperation::Update { priority, .. } | BatchOperation::Delete { priority, .. } => *priority,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            BatchOperation::Create { model, .. } | BatchOperation::Update { model, .. } | BatchOperation::Delete { model, .. } => model,
        }
    }

    pub fn is_bulk_operation(&self) -> bool {
        matches!(self, BatchOperation::Update { record_ids: Some(_), .. } | BatchOperation::Create { .. } | BatchOperation::Delete { .. })
    }

    pub fn batch_size(&self) -> usize {
        match self {
            BatchOperation::Create { data, .. } => data.len(),
            BatchOperation::Update { record_ids: Some(ids), .. } => ids.len(),
            BatchOperation::Update { data, .. } => data.len(),
            BatchOperation::Delete { ids, .. } => ids.len(),
        }
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        match self {
            BatchOperation::Create { data, .. } => {
                if data.is_empty() {
                    return Err(BatchError::Validation("create batch must have at least one record".into()));
                }
                if data.iter().any(Map::is_empty) {
                    return Err(BatchError::Validation("create batch contains an empty record".into()));
                }
            }
            BatchOperation::Update { data, record_ids, .. } => match record_ids {
                Some(ids) => {
                    if ids.is_empty() {
                        return Err(BatchError::Validation("bulk update must have at least one record id".into()));
                    }
                    if data.len() != 1 || data[0].is_empty() {
                        return Err(BatchError::Validation("bulk update requires exactly one non-empty values map".into()));
                    }
                }
                None => {
                    if data.is_empty() {
                        return Err(BatchError::Validation("per-record update batch must have at least one record".into()));
                    }
                    for entry in data {
                        if !entry.contains_key("id") {
                            return Err(BatchError::Validation("per-record update entry missing 'id'".into()));
                        }
                        if entry.len() <= 1 {
                            return Err(BatchError::Validation("per-record update entry has no fields beyond 'id'".into()));
                        }
                    }
                }
            },
            BatchOperation::Delete { ids, .. } => {
                if ids.is_empty() {
                    return Err(BatchError::Validation("delete batch must have at least one id".into()));
                }
                if ids.iter().any(|id| *id <= 0) {
                    return Err(BatchError::Validation("delete batch ids must be positive".into()));
                }
            }
        }
        Ok(())
    }

    /// Splits into operations whose batch sizes sum to the original
    /// (§3, §8 "sum of chunk batch_sizes = original batch_size").
    pub fn split(&self, chunk_size: usize) -> Vec<BatchOperation> {
        assert!(chunk_size > 0, "chunk_size must be positive");
        match self {
            BatchOperation::Create { model, data, priority, context } => data
                .chunks(chunk_size)
                .map(|chunk| BatchOperation::Create { model: model.clone(), data: chunk.to_vec(), priority: *priority, context: context.clone() })
                .collect(),
            BatchOperation::Update { model, data, record_ids: Some(ids), priority, context } => ids
                .chunks(chunk_size)
                .map(|chunk| BatchOperation::Update {
                    model: model.clone(),
                    data: data.clone(),
                    record_ids: Some(chunk.to_vec()),
                    priority: *priority,
                    context: context.clone(),
                })
                .collect(),
            BatchOperation::Update { model, data, record_ids: None, priority, context } => data
                .chunks(chunk_size)
                .map(|chunk| BatchOperation::Update {
                    model: model.clone(),
                    data: chunk.to_vec(),
                    record_ids: None,
                    priority: *priority,
                    context: context.clone(),
                })
                .collect(),
            BatchOperation::Delete { model, ids, priority, context } => ids
                .chunks(chunk_size)
                .map(|chunk| BatchOperation::Delete { model: model.clone(), ids: chunk.to_vec(), priority: *priority, context: context.clone() })
                .collect(),
        }
    }
}

/// Result of executing one (possibly chunked) operation.
#[derive(Debug, Clone)]
pub enum BatchResult {
    Created(Vec<i64>),
    Updated(bool),
    Deleted(bool),
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub total_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    pub processed_records: usize,
}

#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub percentage: f64,
    pub stats: BatchStats,
}

pub type ProgressCallback = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// The CRUD surface the executor needs, implemented by
/// [`crate::client::Client`] (generalized analogue of the Transaction
/// layer's [`crate::transaction::CrudExecutor`]).
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn batch_create(&self, model: &str, data: &[Map<String, Value>], context: &CallContext) -> Result<Vec<i64>, ClientError>;
    async fn batch_write(&self, model: &str, ids: &[i64], data: &Map<String, Value>, context: &CallContext) -> Result<(), ClientError>;
    async fn batch_unlink(&self, model: &str, ids: &[i64], context: &CallContext) -> Result<(), ClientError>;
}

/// A single-use collection of operations built fluently, executed
/// exactly once through a [`BatchEngineConfig`] (§4.4 "Batch lifecycle").
pub struct Batch {
    pub id: String,
    operations: Vec<BatchOperation>,
    executed: bool,
}

impl Batch {
    pub fn new() -> Self {
        Batch { id: Uuid::new_v4().to_string(), operations: Vec::new(), executed: false }
    }

    pub fn create(mut self, model: impl Into<String>, data: Vec<Map<String, Value>>) -> Self {
        self.operations.push(BatchOperation::create(model, data));
        self
    }

    pub fn update(mut self, model: impl Into<String>, record_ids: Vec<i64>, values: Map<String, Value>) -> Self {
        self.operations.push(BatchOperation::update_bulk(model, record_ids, values));
        self
    }

    pub fn delete(mut self, model: impl Into<String>, ids: Vec<i64>) -> Self {
        self.operations.push(BatchOperation::delete(model, ids));
        self
    }

    pub fn add_operation(mut self, op: BatchOperation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub async fn execute(&mut self, executor: &dyn BatchExecutor, config: &BatchManagerConfig, progress: Option<ProgressCallback>) -> Result<Vec<BatchResult>, BatchError> {
        if self.executed {
            return Err(BatchError::AlreadyExecuted);
        }
        if self.operations.is_empty() {
            return Err(BatchError::Empty);
        }
        self.executed = true;
        self.operations.sort_by(|a, b| b.priority().cmp(&a.priority()));
        execute_operations(&self.operations, executor, config, progress).await
    }
}

impl Default for Batch {
    fn default() -> Self {
        Batch::new()
    }
}

/// Accumulates operations of a single kind for a fluent single-type
/// bulk call (§4.4 `BatchOperationCollector`).
pub struct BatchOperationCollector {
    model: String,
    kind: CollectorKind,
    create_items: Vec<Map<String, Value>>,
    delete_ids: Vec<i64>,
}

enum CollectorKind {
    Create,
    Delete,
}

impl BatchOperationCollector {
    pub fn for_create(model: impl Into<String>) -> Self {
        BatchOperationCollector { model: model.into(), kind: CollectorKind::Create, create_items: Vec::new(), delete_ids: Vec::new() }
    }

    pub fn for_delete(model: impl Into<String>) -> Self {
        BatchOperationCollector { model: model.into(), kind: CollectorKind::Delete, create_items: Vec::new(), delete_ids: Vec::new() }
    }

    pub fn add(&mut self, item: Map<String, Value>) {
        self.create_items.push(item);
    }

    pub fn add_id(&mut self, id: i64) {
        self.delete_ids.push(id);
    }

    pub fn add_many(&mut self, items: impl IntoIterator<Item = Map<String, Value>>) {
        self.create_items.extend(items);
    }

    pub fn len(&self) -> usize {
        match self.kind {
            CollectorKind::Create => self.create_items.len(),
            CollectorKind::Delete => self.delete_ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_operation(self) -> BatchOperation {
        match self.kind {
            CollectorKind::Create => BatchOperation::create(self.model, self.create_items),
            CollectorKind::Delete => BatchOperation::delete(self.model, self.delete_ids),
        }
    }
}

/// Chunks oversized operations, validates everything, then fans out
/// with bounded concurrency (§4.4 "Executor protocol").
pub async fn execute_operations(
    operations: &[BatchOperation],
    executor: &dyn BatchExecutor,
    config: &BatchManagerConfig,
    progress: Option<ProgressCallback>,
) -> Result<Vec<BatchResult>, BatchError> {
    for op in operations {
        op.validate()?;
    }

    let chunked: Vec<BatchOperation> = operations
        .iter()
        .flat_map(|op| if op.batch_size() > config.max_chunk_size { op.split(config.max_chunk_size) } else { vec![op.clone()] })
        .collect();

    let total = chunked.len();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let processed_records = Arc::new(AtomicUsize::new(0));

    let mut tasks = FuturesUnordered::new();
    for (index, op) in chunked.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let timeout = config.timeout;
        let retry_attempts = config.retry_attempts;
        tasks.push(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let started = Instant::now();
            let outcome = run_chunk_with_retries(&op, executor, timeout, retry_attempts).await;
            (index, op, outcome, started.elapsed())
        });
    }

    let mut results: Vec<Option<Result<BatchResult, BatchError>>> = (0..total).map(|_| None).collect();
    while let Some((index, op, outcome, _elapsed)) = tasks.next().await {
        match &outcome {
            Ok(result) => {
                completed.fetch_add(1, Ordering::SeqCst);
                processed_records.fetch_add(records_in(result), Ordering::SeqCst);
            }
            Err(_) => {
                failed.fetch_add(1, Ordering::SeqCst);
            }
        }
        if let Some(cb) = &progress {
            let done = completed.load(Ordering::SeqCst) + failed.load(Ordering::SeqCst);
            cb(BatchProgress {
                completed: done,
                total,
                percentage: if total == 0 { 100.0 } else { done as f64 * 100.0 / total as f64 },
                stats: BatchStats {
                    total_operations: total,
                    completed_operations: completed.load(Ordering::SeqCst),
                    failed_operations: failed.load(Ordering::SeqCst),
                    processed_records: processed_records.load(Ordering::SeqCst),
                },
            });
        }
        let _ = &op;
        results[index] = Some(outcome);
    }

    // A chunk timeout is terminal and propagates regardless of how the
    // other chunks fared (§4.4 "on timeout set failed and raise a
    // batch-timeout error upward"), unlike an ordinary per-chunk failure
    // which is only surfaced if nothing else in the batch succeeded.
    for r in results.iter().flatten() {
        if let Err(BatchError::Timeout(t)) = r {
            return Err(BatchError::Timeout(*t));
        }
    }

    let mut flattened = Vec::with_capacity(total);
    let mut first_error = None;
    for r in results.into_iter().flatten() {
        match r {
            Ok(v) => flattened.push(v),
            Err(e) => first_error.get_or_insert(e),
        };
    }
    if let Some(e) = first_error {
        if flattened.is_empty() {
            return Err(e);
        }
    }
    Ok(flattened)
}

/// Runs one chunk, retrying transient failures up to `retry_attempts`
/// times with a short fixed backoff before giving up on the chunk — a
/// per-chunk analogue of [`crate::retry::retry_with_policy`], kept
/// inline rather than reusing that function because a chunk's "error"
/// here is always a [`BatchError`], not the `ClientError` taxonomy the
/// retry engine's policies classify (§4.4, §6).
async fn run_chunk_with_retries(op: &BatchOperation, executor: &dyn BatchExecutor, timeout: Option<Duration>, retry_attempts: u32) -> Result<BatchResult, BatchError> {
    let mut attempt = 0;
    loop {
        let outcome = match timeout {
            Some(t) => match tokio::time::timeout(t, run_single(op, executor)).await {
                Ok(r) => r,
                Err(_) => Err(BatchError::Timeout(t)),
            },
            None => run_single(op, executor).await,
        };
        match outcome {
            Ok(result) => return Ok(result),
            Err(_) if attempt < retry_attempts => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn records_in(result: &BatchResult) -> usize {
    match result {
        BatchResult::Created(ids) => ids.len(),
        BatchResult::Updated(_) | BatchResult::Deleted(_) => 1,
    }
}

async fn run_single(op: &BatchOperation, executor: &dyn BatchExecutor) -> Result<BatchResult, BatchError> {
    match op {
        BatchOperation::Create { model, data, context, .. } => {
            match executor.batch_create(model, data, context).await {
                Ok(ids) => Ok(BatchResult::Created(ids)),
                Err(_) => {
                    // Bulk create failed; fall back to sequential per-record creates (§4.4).
                    let mut ids = Vec::with_capacity(data.len());
                    for record in data {
                        if let Ok(mut created) = executor.batch_create(model, std::slice::from_ref(record), context).await {
                            ids.append(&mut created);
                        }
                    }
                    if ids.is_empty() {
                        Err(BatchError::Execution(format!("bulk and per-record create both failed for model {model}")))
                    } else {
                        Ok(BatchResult::Created(ids))
                    }
                }
            }
        }
        BatchOperation::Update { model, data, record_ids: Some(ids), context, .. } => {
            executor.batch_write(model, ids, &data[0], context).await.map(|_| BatchResult::Updated(true)).map_err(|e| BatchError::Execution(e.to_string()))
        }
        BatchOperation::Update { model, data, record_ids: None, context, .. } => {
            let mut all_ok = true;
            for entry in data {
                let mut entry = entry.clone();
                let Some(Value::Number(id_val)) = entry.remove("id") else {
                    all_ok = false;
                    continue;
                };
                let id = id_val.as_i64().unwrap_or_default();
                if executor.batch_write(model, &[id], &entry, context).await.is_err() {
                    all_ok = false;
                }
            }
            Ok(BatchResult::Updated(all_ok))
        }
        BatchOperation::Delete { model, ids, context, .. } => match executor.batch_unlink(model, ids, context).await {
            Ok(()) => Ok(BatchResult::Deleted(true)),
            Err(e) => Err(BatchError::Execution(e.to_string())),
        },
    }
}

/// Single-operation shortcuts and the `batch()` accumulation scope
/// (§4.4 `BatchManager`).
pub struct BatchManager {
    config: BatchManagerConfig,
}

impl BatchManager {
    pub fn new(config: BatchManagerConfig) -> Self {
        BatchManager { config }
    }

    pub fn config(&self) -> &BatchManagerConfig {
        &self.config
    }

    pub async fn bulk_create(&self, executor: &dyn BatchExecutor, model: &str, data: Vec<Map<String, Value>>) -> Result<Vec<i64>, BatchError> {
        let op = BatchOperation::create(model, data);
        op.validate()?;
        match execute_operations(std::slice::from_ref(&op), executor, &self.config, None).await?.into_iter().next() {
            Some(BatchResult::Created(ids)) => Ok(ids),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn bulk_update(&self, executor: &dyn BatchExecutor, model: &str, record_ids: Vec<i64>, values: Map<String, Value>) -> Result<bool, BatchError> {
        let op = BatchOperation::update_bulk(model, record_ids, values);
        op.validate()?;
        match execute_operations(std::slice::from_ref(&op), executor, &self.config, None).await?.into_iter().next() {
            Some(BatchResult::Updated(ok)) => Ok(ok),
            _ => Ok(false),
        }
    }

    pub async fn bulk_delete(&self, executor: &dyn BatchExecutor, model: &str, ids: Vec<i64>) -> Result<bool, BatchError> {
        let op = BatchOperation::delete(model, ids);
        op.validate()?;
        match execute_operations(std::slice::from_ref(&op), executor, &self.config, None).await?.into_iter().next() {
            Some(BatchResult::Deleted(ok)) => Ok(ok),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeExecutor {
        created_calls: StdMutex<Vec<usize>>,
    }

    #[async_trait]
    impl BatchExecutor for FakeExecutor {
        async fn batch_create(&self, _model: &str, data: &[Map<String, Value>], _context: &CallContext) -> Result<Vec<i64>, ClientError> {
            self.created_calls.lock().unwrap().push(data.len());
            Ok((0..data.len() as i64).collect())
        }
        async fn batch_write(&self, _model: &str, _ids: &[i64], _data: &Map<String, Value>, _context: &CallContext) -> Result<(), ClientError> {
            Ok(())
        }
        async fn batch_unlink(&self, _model: &str, _ids: &[i64], _context: &CallContext) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct FlakyExecutor {
        failures_left: std::sync::atomic::AtomicU32,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl BatchExecutor for FlakyExecutor {
        async fn batch_create(&self, _model: &str, data: &[Map<String, Value>], _context: &CallContext) -> Result<Vec<i64>, ClientError> {
            Ok((0..data.len() as i64).collect())
        }
        async fn batch_write(&self, _model: &str, _ids: &[i64], _data: &Map<String, Value>, _context: &CallContext) -> Result<(), ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None }).is_ok() {
                return Err(ClientError::Transport(crate::error::TransportError::Unreachable("transient failure".into())));
            }
            Ok(())
        }
        async fn batch_unlink(&self, _model: &str, _ids: &[i64], _context: &CallContext) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn record(name: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("name".into(), Value::String(name.into()));
        m
    }

    #[test]
    fn split_sums_to_original_batch_size() {
        let data: Vec<_> = (0..150).map(|i| record(&i.to_string())).collect();
        let op = BatchOperation::create("res.partner", data);
        let chunks = op.split(50);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(BatchOperation::batch_size).sum::<usize>(), 150);
    }

    #[tokio::test]
    async fn batch_create_150_with_chunk_50_issues_three_calls_scenario_5() {
        let data: Vec<_> = (0..150).map(|i| record(&i.to_string())).collect();
        let op = BatchOperation::create("res.partner", data);
        let executor = FakeExecutor { created_calls: StdMutex::new(Vec::new()) };
        let config = BatchManagerConfig { max_chunk_size: 50, max_concurrency: 5, timeout: None, retry_attempts: 0 };
        let results = execute_operations(std::slice::from_ref(&op), &executor, &config, None).await.unwrap();
        let calls = executor.created_calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|&n| n == 50));
        let total_ids: usize = results.iter().map(|r| if let BatchResult::Created(ids) = r { ids.len() } else { 0 }).sum();
        assert_eq!(total_ids, 150);
    }

    #[tokio::test]
    async fn retry_attempts_recovers_from_transient_write_failures() {
        let op = BatchOperation::update_bulk("res.partner", vec![1, 2], record("retried"));
        let executor = FlakyExecutor { failures_left: std::sync::atomic::AtomicU32::new(2), attempts: AtomicUsize::new(0) };
        let config = BatchManagerConfig { max_chunk_size: 100, max_concurrency: 1, timeout: None, retry_attempts: 2 };
        let results = execute_operations(std::slice::from_ref(&op), &executor, &config, None).await.unwrap();
        assert!(matches!(results[0], BatchResult::Updated(true)));
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_attempts_exhausted_surfaces_the_last_error() {
        let op = BatchOperation::update_bulk("res.partner", vec![1], record("retried"));
        let executor = FlakyExecutor { failures_left: std::sync::atomic::AtomicU32::new(5), attempts: AtomicUsize::new(0) };
        let config = BatchManagerConfig { max_chunk_size: 100, max_concurrency: 1, timeout: None, retry_attempts: 1 };
        let result = execute_operations(std::slice::from_ref(&op), &executor, &config, None).await;
        assert!(result.is_err());
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn validation_rejects_empty_create_batch() {
        let op = BatchOperation::create("res.partner", vec![]);
        assert!(op.validate().is_err());
    }

    #[test]
    fn validation_rejects_per_record_update_missing_id() {
        let op = BatchOperation::update_per_record("res.partner", vec![record("x")]);
        assert!(op.validate().is_err());
    }

    #[tokio::test]
    async fn executing_empty_batch_fails() {
        let mut batch = Batch::new();
        let executor = FakeExecutor { created_calls: StdMutex::new(Vec::new()) };
        let config = BatchManagerConfig::default();
        let result = batch.execute(&executor, &config, None).await;
        assert!(matches!(result, Err(BatchError::Empty)));
    }

    #[tokio::test]
    async fn executing_twice_fails() {
        let mut batch = Batch::new().create("res.partner", vec![record("a")]);
        let executor = FakeExecutor { created_calls: StdMutex::new(Vec::new()) };
        let config = BatchManagerConfig::default();
        batch.execute(&executor, &config, None).await.unwrap();
        let second = batch.execute(&executor, &config, None).await;
        assert!(matches!(second, Err(BatchError::AlreadyExecuted)));
    }
}
