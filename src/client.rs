//! Client Facade (§4.2): thin orchestrator wiring transport, session,
//! and the optional transaction/cache/batch subsystems behind the
//! stable public surface (login, execute, CRUD, `model()`,
//! `transaction()`, `batch()`, setup hooks).
//!
//! The facade is the only place subsystem state is attached (§9
//! "mutable global-like instance state"); everything else is
//! constructed through an explicit `setup_*` call and handed to the
//! facade to own.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::batch::{Batch, BatchExecutor, BatchManager, BatchOperation, BatchResult, ProgressCallback};
use crate::cache::{Cache, MemoryCache, RemoteCache};
use crate::config::{BatchManagerConfig, CacheBackendKind, CacheConfig, ClientConfig, PoolConfig, Protocol, TransactionManagerConfig};
use crate::error::{ClientError, ErrorKind};
use crate::retry::RetryPolicy;
use crate::session::{CallContext, Session};
use crate::transaction::{CrudExecutor, OperationType, TransactionManager, TransactionScope};
use crate::transport::{HttpTransport, Transport};

fn ids_value(ids: &[i64]) -> Value {
    Value::Array(ids.iter().map(|id| Value::from(*id)).collect())
}

/// Builds a [`Client`] from [`ClientConfig`] before the (async)
/// connection step, the same `ClientConfig::default().with_auth(...)`
/// builder idiom used throughout `foundation/auth` and
/// `spanner::client::ClientConfig`.
pub struct ClientBuilder {
    config: ClientConfig,
    retry_policy: Option<RetryPolicy>,
}

impl ClientBuilder {
    pub fn with_port(mut self, port: u16) -> Self {
        self.config = self.config.with_port(port);
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.config = self.config.with_protocol(protocol);
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config = self.config.with_timeout(timeout);
        self
    }

    pub fn with_verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.config = self.config.with_verify_ssl(verify_ssl);
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.config = self.config.with_pool(pool);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Builds the pooled HTTP transport and returns a ready-to-use,
    /// unauthenticated [`Client`]. Call [`Client::login`] next.
    pub async fn connect(self) -> Result<Client, ClientError> {
        let transport = HttpTransport::new(&self.config).await.map_err(ClientError::Transport)?;
        Ok(Client::new(self.config, Arc::new(transport), self.retry_policy.unwrap_or_default()))
    }
}

/// Single-user authenticated client: owns the transport, the session,
/// and the optional transaction/cache/batch subsystems (§3
/// "Ownership").
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    retry_policy: RetryPolicy,
    session: Mutex<Option<Session>>,
    transaction_manager: Mutex<Option<Arc<TransactionManager>>>,
    cache: Mutex<Option<Arc<dyn Cache>>>,
    batch_manager: Mutex<Option<Arc<BatchManager>>>,
}

impl Client {
    pub fn builder(host_or_url: impl AsRef<str>) -> ClientBuilder {
        ClientBuilder { config: ClientConfig::new(host_or_url), retry_policy: None }
    }

    /// Convenience for `Client::builder(host_or_url).connect().await`.
    pub async fn connect(host_or_url: impl AsRef<str>) -> Result<Self, ClientError> {
        Self::builder(host_or_url).connect().await
    }

    /// Constructs a client around an already-built transport (the seam
    /// tests swap for a `FakeTransport`, §8.1).
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, retry_policy: RetryPolicy) -> Self {
        Client {
            config,
            transport,
            retry_policy,
            session: Mutex::new(None),
            transaction_manager: Mutex::new(None),
            cache: Mutex::new(None),
            batch_manager: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // -- Session introspection -------------------------------------------------

    pub fn is_authenticated(&self) -> bool {
        self.session.lock().as_ref().map(Session::is_authenticated).unwrap_or(false)
    }

    pub fn database(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.database.clone())
    }

    pub fn uid(&self) -> Option<i64> {
        self.session.lock().as_ref().map(|s| s.user_id)
    }

    fn require_session(&self) -> Result<Session, ClientError> {
        self.session.lock().clone().filter(Session::is_authenticated).ok_or(ClientError::NotAuthenticated)
    }

    /// Three-way context precedence (§4.2): session defaults < the
    /// enclosing transaction's scope context < the caller's explicit
    /// `context` argument.
    fn merge_context(&self, session: &Session, explicit: Option<CallContext>) -> CallContext {
        let scope_context =
            self.transaction_manager.lock().as_ref().and_then(|m| m.current()).map(|tx| tx.context()).unwrap_or_default();
        let merged = session.context.merged(&scope_context);
        match explicit {
            Some(ctx) => merged.merged(&ctx),
            None => merged,
        }
    }

    /// Retry-wrapped transport call (§5 "every RPC call" is a
    /// suspension point; the retry engine wraps it per the default
    /// policy unless overridden via [`ClientBuilder::with_retry_policy`]).
    async fn call(&self, service: &str, method: &str, args: Vec<Value>, extra: Map<String, Value>) -> Result<Value, ClientError> {
        let transport = Arc::clone(&self.transport);
        let service = service.to_string();
        let method = method.to_string();
        crate::retry::retry_with_policy(&self.retry_policy, || {
            let transport = Arc::clone(&transport);
            let service = service.clone();
            let method = method.clone();
            let args = args.clone();
            let extra = extra.clone();
            async move { transport.call(&service, &method, args, extra).await }
        })
        .await
        .map_err(ClientError::from)
    }

    fn enrich(&self, err: ClientError, operation: &str, model: &str) -> ClientError {
        tracing::debug!(operation, model, error = %err, "crud operation failed");
        err
    }

    // -- Login & unauthenticated surface ----------------------------------------

    /// Login handshake (§4.2): `common.version` then
    /// `common.authenticate`; a non-empty positive user id
    /// authenticates the session.
    pub async fn login(&self, database: &str, user: &str, credential: &str) -> Result<(), ClientError> {
        let version = self.call("common", "version", Vec::new(), Map::new()).await?;
        let auth_args = vec![
            Value::String(database.to_string()),
            Value::String(user.to_string()),
            Value::String(credential.to_string()),
            Value::Object(Map::new()),
        ];
        let uid_value = self.call("common", "authenticate", auth_args, Map::new()).await?;
        let uid = uid_value.as_i64().filter(|v| *v > 0);
        let Some(uid) = uid else {
            return Err(ClientError::Authentication(format!(
                "authentication failed for user '{user}' on database '{database}'\n\n\
                 Check that the username and password are correct, the account is active, \
                 and the database name is correct."
            )));
        };
        let context = self.fetch_user_context(database, uid, credential).await;
        *self.session.lock() = Some(Session::new(database, uid, credential).with_server_version(version).with_context(context));
        tracing::info!(database, uid, "login succeeded");
        Ok(())
    }

    /// Loads locale/timezone context for the newly authenticated user,
    /// falling back to a conservative default (just the uid) if the
    /// lookup itself fails (§4.2).
    async fn fetch_user_context(&self, database: &str, uid: i64, credential: &str) -> CallContext {
        let mut kwargs = Map::new();
        kwargs.insert("fields".into(), Value::Array(vec![Value::String("lang".into()), Value::String("tz".into())]));
        let args = vec![
            Value::String(database.to_string()),
            Value::from(uid),
            Value::String(credential.to_string()),
            Value::String("res.users".to_string()),
            Value::String("read".to_string()),
            Value::Array(vec![ids_value(&[uid])]),
            Value::Object(kwargs),
        ];
        match self.call("object", "execute_kw", args, Map::new()).await {
            Ok(Value::Array(mut rows)) if !rows.is_empty() => match rows.remove(0) {
                Value::Object(row) => {
                    let mut ctx = Map::new();
                    if let Some(lang) = row.get("lang") {
                        ctx.insert("lang".into(), lang.clone());
                    }
                    if let Some(tz) = row.get("tz") {
                        ctx.insert("tz".into(), tz.clone());
                    }
                    ctx.insert("uid".into(), Value::from(uid));
                    CallContext::from_map(ctx)
                }
                _ => CallContext::new().with("uid", uid),
            },
            _ => {
                tracing::warn!(database, uid, "could not load user context, falling back to a conservative default");
                CallContext::new().with("uid", uid)
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        self.transport.health_check().await
    }

    pub async fn get_server_version(&self) -> Result<Value, ClientError> {
        if let Some(version) = self.session.lock().as_ref().and_then(|s| s.server_version.clone()) {
            return Ok(version);
        }
        self.call("common", "version", Vec::new(), Map::new()).await
    }

    pub async fn list_databases(&self) -> Result<Vec<String>, ClientError> {
        let result = self.call("db", "list", Vec::new(), Map::new()).await?;
        match result {
            Value::Array(items) => Ok(items.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn close(&self) {
        if let Some(cache) = self.cache.lock().take() {
            cache.close().await;
        }
        self.transport.close().await;
        *self.session.lock() = None;
    }

    // -- Generic RPC -------------------------------------------------------------

    /// Keyword form of the generic RPC (§4.2): `object.execute_kw(db,
    /// uid, credential, model, method, args, kwargs)` with the merged
    /// call context folded into `kwargs["context"]`.
    pub async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Option<Map<String, Value>>,
        context: Option<CallContext>,
    ) -> Result<Value, ClientError> {
        let session = self.require_session()?;
        let merged = self.merge_context(&session, context);
        let mut kwargs = kwargs.unwrap_or_default();
        if !merged.is_empty() {
            kwargs.insert("context".into(), Value::Object(merged.into_map()));
        }
        let rpc_args = vec![
            Value::String(session.database.clone()),
            Value::from(session.user_id),
            Value::String(session.credential.clone()),
            Value::String(model.to_string()),
            Value::String(method.to_string()),
            Value::Array(args),
            Value::Object(kwargs),
        ];
        self.call("object", "execute_kw", rpc_args, Map::new()).await
    }

    /// Positional form of the generic RPC: `execute_kw` without kwargs.
    pub async fn execute(&self, model: &str, method: &str, args: Vec<Value>, context: Option<CallContext>) -> Result<Value, ClientError> {
        self.execute_kw(model, method, args, None, context).await
    }

    pub async fn search_read(
        &self,
        model: &str,
        domain: Value,
        fields: Option<Vec<String>>,
        limit: Option<i64>,
        offset: Option<i64>,
        order: Option<&str>,
        context: Option<CallContext>,
    ) -> Result<Vec<Value>, ClientError> {
        let mut kwargs = Map::new();
        if let Some(fields) = fields {
            kwargs.insert("fields".into(), Value::Array(fields.into_iter().map(Value::String).collect()));
        }
        if let Some(limit) = limit {
            kwargs.insert("limit".into(), Value::from(limit));
        }
        if let Some(offset) = offset {
            kwargs.insert("offset".into(), Value::from(offset));
        }
        if let Some(order) = order {
            kwargs.insert("order".into(), Value::String(order.to_string()));
        }
        let result = self.execute_kw(model, "search_read", vec![domain], Some(kwargs), context).await?;
        Ok(as_row_list(result))
    }

    pub async fn search_count(&self, model: &str, domain: Value, context: Option<CallContext>) -> Result<i64, ClientError> {
        let result = self.execute_kw(model, "search_count", vec![domain], None, context).await?;
        Ok(result.as_i64().unwrap_or(0))
    }

    pub async fn read(&self, model: &str, ids: Vec<i64>, fields: Option<Vec<String>>, context: Option<CallContext>) -> Result<Vec<Value>, ClientError> {
        let mut kwargs = Map::new();
        if let Some(fields) = fields {
            kwargs.insert("fields".into(), Value::Array(fields.into_iter().map(Value::String).collect()));
        }
        let result = self.execute_kw(model, "read", vec![ids_value(&ids)], Some(kwargs), context).await?;
        Ok(as_row_list(result))
    }

    pub async fn get_model_fields(&self, model: &str, context: Option<CallContext>) -> Result<Map<String, Value>, ClientError> {
        let result = self.execute_kw(model, "fields_get", Vec::new(), None, context).await?;
        match result {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    async fn validate_required_fields(&self, model: &str, values: &Map<String, Value>, context: Option<CallContext>) -> Result<(), ClientError> {
        let fields = self.get_model_fields(model, context).await?;
        let missing: Vec<String> = fields
            .iter()
            .filter_map(|(name, def)| {
                let required = def.get("required").and_then(Value::as_bool).unwrap_or(false);
                (required && !values.contains_key(name)).then(|| name.clone())
            })
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ClientError::Validation { message: format!("missing required fields for {model}"), missing_fields: missing })
        }
    }

    async fn check_ids_accessible(&self, model: &str, ids: &[i64], context: Option<CallContext>) -> Result<(), ClientError> {
        let domain = Value::Array(vec![Value::Array(vec![Value::String("id".into()), Value::String("in".into()), ids_value(ids)])]);
        let accessible = self.search_read(model, domain, Some(vec!["id".into()]), None, None, None, context).await?;
        let accessible_ids: std::collections::HashSet<i64> = accessible.iter().filter_map(|r| r.get("id").and_then(Value::as_i64)).collect();
        let inaccessible: Vec<i64> = ids.iter().copied().filter(|id| !accessible_ids.contains(id)).collect();
        if inaccessible.is_empty() {
            Ok(())
        } else {
            Err(ClientError::access(format!("no access to {model} record(s) {inaccessible:?}")))
        }
    }

    fn record_if_active(
        &self,
        op_type: OperationType,
        model: &str,
        record_ids: Vec<i64>,
        original_data: Option<Map<String, Value>>,
        created_ids: Vec<i64>,
        rollback_data: Option<Value>,
        context: CallContext,
    ) {
        let Some(tx) = self.transaction_manager.lock().as_ref().and_then(|m| m.current()) else { return };
        if let Err(e) = tx.add_operation(op_type, model, record_ids, original_data, created_ids, rollback_data, None, context) {
            tracing::warn!(error = %e, "failed to record operation in active transaction");
        }
    }

    // -- CRUD ---------------------------------------------------------------------

    /// Creates a record; optionally precomputes missing-required-field
    /// errors client-side (§4.2). Records a `create` operation in the
    /// active transaction, if any.
    pub async fn create(&self, model: &str, values: Map<String, Value>, context: Option<CallContext>, validate_required: bool) -> Result<i64, ClientError> {
        if validate_required {
            self.validate_required_fields(model, &values, context.clone()).await?;
        }
        let result = self
            .execute_kw(model, "create", vec![Value::Object(values)], None, context.clone())
            .await
            .map_err(|e| self.enrich(e, "create", model))?;
        let id = result.as_i64().ok_or_else(|| ClientError::Other(format!("create on {model} did not return an id")))?;
        self.record_if_active(OperationType::Create, model, Vec::new(), None, vec![id], None, context.unwrap_or_default());
        Ok(id)
    }

    /// Writes values to `ids`; optionally pre-flights access with a
    /// `search_read` so inaccessible ids fail before the server call.
    /// Captures the pre-write values for rollback (§4.3).
    pub async fn write(&self, model: &str, ids: Vec<i64>, values: Map<String, Value>, context: Option<CallContext>, check_access: bool) -> Result<(), ClientError> {
        if check_access {
            self.check_ids_accessible(model, &ids, context.clone()).await?;
        }
        let keys: Vec<String> = values.keys().cloned().collect();
        let original_data = self
            .read(model, ids.clone(), Some(keys), context.clone())
            .await
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|v| v.as_object().cloned());
        self.execute_kw(model, "write", vec![ids_value(&ids), Value::Object(values)], None, context.clone())
            .await
            .map_err(|e| self.enrich(e, "write", model))?;
        self.record_if_active(OperationType::Update, model, ids, original_data, Vec::new(), None, context.unwrap_or_default());
        Ok(())
    }

    /// Deletes `ids`; optionally pre-flights access, and always
    /// captures the pre-delete rows so rollback can best-effort
    /// recreate them (§4.3).
    pub async fn unlink(&self, model: &str, ids: Vec<i64>, context: Option<CallContext>, check_references: bool) -> Result<(), ClientError> {
        if check_references {
            self.check_ids_accessible(model, &ids, context.clone()).await?;
        }
        let rollback_rows = self.read(model, ids.clone(), None, context.clone()).await.unwrap_or_default();
        self.execute_kw(model, "unlink", vec![ids_value(&ids)], None, context.clone()).await.map_err(|e| self.enrich(e, "unlink", model))?;
        self.record_if_active(OperationType::Delete, model, ids, None, Vec::new(), Some(Value::Array(rollback_rows)), context.unwrap_or_default());
        Ok(())
    }

    // -- Fallback variants that never raise for access/validation (§4.2) ----------

    pub async fn safe_create(&self, model: &str, values: Map<String, Value>, context: Option<CallContext>) -> Result<Option<i64>, ClientError> {
        match self.create(model, values, context, true).await {
            Ok(id) => Ok(Some(id)),
            Err(e) if matches!(e.kind(), ErrorKind::Access | ErrorKind::Validation) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn safe_create_record(&self, model: &str, values: Map<String, Value>, context: Option<CallContext>) -> Result<Option<Value>, ClientError> {
        match self.safe_create(model, values, context.clone()).await? {
            Some(id) => Ok(self.safe_read(model, vec![id], None, context).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    /// Direct `read`, falling back to `search_read` when the direct
    /// read lacks permission, and absorbing access/validation errors
    /// into an empty result (§4.2).
    pub async fn safe_read(&self, model: &str, ids: Vec<i64>, fields: Option<Vec<String>>, context: Option<CallContext>) -> Result<Vec<Value>, ClientError> {
        match self.read(model, ids.clone(), fields.clone(), context.clone()).await {
            Ok(rows) => Ok(rows),
            Err(e) if matches!(e.kind(), ErrorKind::Access | ErrorKind::Validation) => {
                let domain = Value::Array(vec![Value::Array(vec![Value::String("id".into()), Value::String("in".into()), ids_value(&ids)])]);
                Ok(self.search_read(model, domain, fields, None, None, None, context).await.unwrap_or_default())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_accessible_records(&self, model: &str, ids: Vec<i64>, context: Option<CallContext>) -> Result<Vec<i64>, ClientError> {
        let domain = Value::Array(vec![Value::Array(vec![Value::String("id".into()), Value::String("in".into()), ids_value(&ids)])]);
        let rows = self.search_read(model, domain, Some(vec!["id".into()]), None, None, None, context).await.unwrap_or_default();
        Ok(rows.iter().filter_map(|r| r.get("id").and_then(Value::as_i64)).collect())
    }

    /// Reads `ids` directly, then fills in any ids the direct read
    /// dropped (inaccessible or absent) via a `search_read` fallback.
    pub async fn adaptive_read_records(&self, model: &str, ids: Vec<i64>, fields: Option<Vec<String>>, context: Option<CallContext>) -> Result<Vec<Value>, ClientError> {
        let mut rows = self.read(model, ids.clone(), fields.clone(), context.clone()).await.unwrap_or_default();
        let found: std::collections::HashSet<i64> = rows.iter().filter_map(|r| r.get("id").and_then(Value::as_i64)).collect();
        let missing: Vec<i64> = ids.into_iter().filter(|id| !found.contains(id)).collect();
        if !missing.is_empty() {
            let domain = Value::Array(vec![Value::Array(vec![Value::String("id".into()), Value::String("in".into()), ids_value(&missing)])]);
            if let Ok(extra) = self.search_read(model, domain, fields, None, None, None, context).await {
                rows.extend(extra);
            }
        }
        Ok(rows)
    }

    /// Thin handle bound to a single model name; a minimal stand-in for
    /// the fluent query builder, which is explicitly out of scope (§1).
    pub fn model(&self, name: impl Into<String>) -> ModelHandle<'_> {
        ModelHandle { client: self, model: name.into() }
    }

    // -- Subsystem setup (§6) -------------------------------------------------------

    pub fn setup_transaction_manager(&self, config: TransactionManagerConfig) -> Arc<TransactionManager> {
        let mut guard = self.transaction_manager.lock();
        if let Some(existing) = guard.as_ref() {
            return existing.clone();
        }
        let cache = self.cache.lock().clone();
        let manager = TransactionManager::new(config, cache);
        *guard = Some(manager.clone());
        manager
    }

    pub fn setup_cache_manager(&self, config: CacheConfig) -> Arc<dyn Cache> {
        let mut guard = self.cache.lock();
        if let Some(existing) = guard.as_ref() {
            return existing.clone();
        }
        let cache: Arc<dyn Cache> = match config.backend {
            CacheBackendKind::Memory => Arc::new(MemoryCache::new(config.max_size, config.ttl)),
            CacheBackendKind::Remote => Arc::new(RemoteCache::with_breaker_threshold(
                config.url.clone().unwrap_or_default(),
                config.enable_fallback,
                config.max_size,
                config.ttl,
                config.circuit_breaker_threshold,
            )),
        };
        *guard = Some(cache.clone());
        cache
    }

    pub fn setup_batch_manager(&self, config: BatchManagerConfig) -> Arc<BatchManager> {
        let mut guard = self.batch_manager.lock();
        if let Some(existing) = guard.as_ref() {
            return existing.clone();
        }
        let manager = Arc::new(BatchManager::new(config));
        *guard = Some(manager.clone());
        manager
    }

    /// Opens a transaction scope; fails with a state error if
    /// [`Client::setup_transaction_manager`] was never called (§4.2).
    pub fn transaction(&self, id: Option<String>, auto_commit: bool) -> Result<TransactionScope, ClientError> {
        let manager = self.transaction_manager.lock().clone().ok_or(crate::transaction::TransactionError::NotConfigured)?;
        manager.transaction(id, auto_commit).map_err(ClientError::from)
    }

    /// Opens a batch accumulation scope; fails with a state error if
    /// [`Client::setup_batch_manager`] was never called (§4.2, §4.4
    /// "batch() scope context manager").
    pub fn batch(&self) -> Result<BatchScope<'_>, ClientError> {
        let manager = self.batch_manager.lock().clone().ok_or(crate::batch::BatchError::NotConfigured)?;
        Ok(BatchScope { client: self, manager, batch: Batch::new(), progress: None, finalized: false })
    }
}

fn as_row_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Thin handle bound to a model name (§4.2's `model()`), delegating
/// every call back to the owning [`Client`].
pub struct ModelHandle<'a> {
    client: &'a Client,
    model: String,
}

impl<'a> ModelHandle<'a> {
    pub async fn create(&self, values: Map<String, Value>, context: Option<CallContext>) -> Result<i64, ClientError> {
        self.client.create(&self.model, values, context, true).await
    }

    pub async fn write(&self, ids: Vec<i64>, values: Map<String, Value>, context: Option<CallContext>) -> Result<(), ClientError> {
        self.client.write(&self.model, ids, values, context, true).await
    }

    pub async fn unlink(&self, ids: Vec<i64>, context: Option<CallContext>) -> Result<(), ClientError> {
        self.client.unlink(&self.model, ids, context, true).await
    }

    pub async fn read(&self, ids: Vec<i64>, fields: Option<Vec<String>>, context: Option<CallContext>) -> Result<Vec<Value>, ClientError> {
        self.client.read(&self.model, ids, fields, context).await
    }

    pub async fn search_read(&self, domain: Value, fields: Option<Vec<String>>, limit: Option<i64>, context: Option<CallContext>) -> Result<Vec<Value>, ClientError> {
        self.client.search_read(&self.model, domain, fields, limit, None, None, context).await
    }
}

/// Accumulates [`BatchOperation`]s fluently and executes them exactly
/// once through the owning [`Client`] (§4.4 "Batch lifecycle").
///
/// A true auto-execute-on-exit context manager would need to run
/// async work from `Drop`, which Rust cannot do; like
/// [`crate::transaction::TransactionScope`], this scope instead warns
/// on drop if operations were accumulated but never executed, and
/// requires callers to invoke [`BatchScope::execute`] explicitly
/// (documented in DESIGN.md).
pub struct BatchScope<'a> {
    client: &'a Client,
    manager: Arc<BatchManager>,
    batch: Batch,
    progress: Option<ProgressCallback>,
    finalized: bool,
}

impl<'a> BatchScope<'a> {
    pub fn create(mut self, model: impl Into<String>, data: Vec<Map<String, Value>>) -> Self {
        self.batch = self.batch.create(model, data);
        self
    }

    pub fn update(mut self, model: impl Into<String>, record_ids: Vec<i64>, values: Map<String, Value>) -> Self {
        self.batch = self.batch.update(model, record_ids, values);
        self
    }

    pub fn delete(mut self, model: impl Into<String>, ids: Vec<i64>) -> Self {
        self.batch = self.batch.delete(model, ids);
        self
    }

    pub fn add_operation(mut self, op: BatchOperation) -> Self {
        self.batch = self.batch.add_operation(op);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub async fn execute(mut self) -> Result<Vec<BatchResult>, ClientError> {
        self.finalized = true;
        let mut batch = std::mem::replace(&mut self.batch, Batch::new());
        let progress = self.progress.take();
        batch.execute(self.client, self.manager.config(), progress).await.map_err(ClientError::from)
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        if !self.finalized && !self.batch.is_empty() {
            tracing::warn!("batch scope dropped without execute(); {} accumulated operation(s) discarded", self.batch.len());
        }
    }
}

#[async_trait]
impl BatchExecutor for Client {
    async fn batch_create(&self, model: &str, data: &[Map<String, Value>], context: &CallContext) -> Result<Vec<i64>, ClientError> {
        let payload = Value::Array(data.iter().cloned().map(Value::Object).collect());
        let result = self.execute_kw(model, "create", vec![payload], None, Some(context.clone())).await?;
        let ids = match result {
            Value::Array(items) => items.iter().filter_map(Value::as_i64).collect(),
            other => other.as_i64().into_iter().collect(),
        };
        self.record_if_active(OperationType::Create, model, Vec::new(), None, ids.clone(), None, context.clone());
        Ok(ids)
    }

    async fn batch_write(&self, model: &str, ids: &[i64], data: &Map<String, Value>, context: &CallContext) -> Result<(), ClientError> {
        self.execute_kw(model, "write", vec![ids_value(ids), Value::Object(data.clone())], None, Some(context.clone())).await?;
        self.record_if_active(OperationType::Update, model, ids.to_vec(), None, Vec::new(), None, context.clone());
        Ok(())
    }

    async fn batch_unlink(&self, model: &str, ids: &[i64], context: &CallContext) -> Result<(), ClientError> {
        self.execute_kw(model, "unlink", vec![ids_value(ids)], None, Some(context.clone())).await?;
        self.record_if_active(OperationType::Delete, model, ids.to_vec(), None, Vec::new(), None, context.clone());
        Ok(())
    }
}

#[async_trait]
impl CrudExecutor for Client {
    async fn rollback_create(&self, model: &str, ids: &[i64], context: &CallContext) -> Result<(), ClientError> {
        self.execute_kw(model, "unlink", vec![ids_value(ids)], None, Some(context.clone())).await.map(|_| ())
    }

    async fn rollback_update(&self, model: &str, ids: &[i64], data: &Map<String, Value>, context: &CallContext) -> Result<(), ClientError> {
        self.execute_kw(model, "write", vec![ids_value(ids), Value::Object(data.clone())], None, Some(context.clone())).await.map(|_| ())
    }

    /// Recreates deleted rows from `rollback_data`: a single object
    /// yields one `create`, an array yields one `create` per element
    /// (§4.3). Best-effort: new ids may differ from the originals.
    async fn rollback_delete(&self, model: &str, rollback_data: &Value, context: &CallContext) -> Result<Vec<i64>, ClientError> {
        match rollback_data {
            Value::Array(items) => {
                let mut ids = Vec::with_capacity(items.len());
                for item in items {
                    if let Value::Object(row) = item {
                        let mut row = row.clone();
                        row.remove("id");
                        let result = self.execute_kw(model, "create", vec![Value::Object(row)], None, Some(context.clone())).await?;
                        if let Some(id) = result.as_i64() {
                            ids.push(id);
                        }
                    }
                }
                Ok(ids)
            }
            Value::Object(row) => {
                let mut row = row.clone();
                row.remove("id");
                let result = self.execute_kw(model, "create", vec![Value::Object(row)], None, Some(context.clone())).await?;
                Ok(result.as_i64().into_iter().collect())
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport as _;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// Records every `(service, method, args, extra)` tuple it
    /// receives and returns scripted responses (§8.1's `FakeTransport`).
    struct FakeTransport {
        calls: AsyncMutex<Vec<(String, String, Vec<Value>, Map<String, Value>)>>,
        next_id: AtomicI64,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport { calls: AsyncMutex::new(Vec::new()), next_id: AtomicI64::new(1) }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn call(&self, service: &str, method: &str, args: Vec<Value>, extra: Map<String, Value>) -> Result<Value, ClientError> {
            self.calls.lock().await.push((service.to_string(), method.to_string(), args.clone(), extra));
            match (service, method) {
                ("common", "version") => Ok(serde_json::json!({"server_version": "17.0"})),
                ("common", "authenticate") => Ok(Value::from(7)),
                ("object", "execute_kw") => {
                    let model = args.get(3).and_then(Value::as_str).unwrap_or_default();
                    let op = args.get(4).and_then(Value::as_str).unwrap_or_default();
                    match (model, op) {
                        ("res.users", "read") => Ok(Value::Array(vec![serde_json::json!({"id": 7, "lang": "en_US", "tz": "UTC"})])),
                        (_, "create") => {
                            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                            Ok(Value::from(id))
                        }
                        (_, "write") | (_, "unlink") => Ok(Value::Bool(true)),
                        (_, "search_read") => Ok(Value::Array(Vec::new())),
                        _ => Ok(Value::Null),
                    }
                }
                _ => Ok(Value::Null),
            }
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    fn test_client() -> (Client, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new());
        let client = Client::new(ClientConfig::new("demo.example.com"), transport.clone(), RetryPolicy::default());
        (client, transport)
    }

    #[tokio::test]
    async fn login_authenticates_session_scenario_1() {
        let (client, _transport) = test_client();
        client.login("demo", "admin", "admin").await.unwrap();
        assert!(client.is_authenticated());
        assert_eq!(client.database().as_deref(), Some("demo"));
        assert_eq!(client.uid(), Some(7));
    }

    #[tokio::test]
    async fn execute_kw_requires_authentication() {
        let (client, _transport) = test_client();
        let err = client.execute_kw("res.partner", "read", vec![ids_value(&[1])], None, None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotAuthenticated));
    }

    #[tokio::test]
    async fn create_records_operation_in_active_transaction() {
        let (client, _transport) = test_client();
        client.login("demo", "admin", "admin").await.unwrap();
        client.setup_transaction_manager(TransactionManagerConfig::default());

        let scope = client.transaction(None, true).unwrap();
        let id = client.create("res.partner", Map::new(), None, false).await.unwrap();
        assert!(id > 0);
        assert_eq!(scope.transaction().operation_count(), 1);
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn transaction_rollback_issues_compensations_scenario_4() {
        let (client, transport) = test_client();
        client.login("demo", "admin", "admin").await.unwrap();
        client.setup_transaction_manager(TransactionManagerConfig::default());

        let scope = client.transaction(None, true).unwrap();
        let tx = scope.transaction().clone();
        tx.add_operation(OperationType::Create, "res.partner", vec![1, 2], None, vec![1, 2], None, None, CallContext::new()).unwrap();
        let mut data = Map::new();
        data.insert("name".into(), Value::String("Old".into()));
        tx.add_operation(OperationType::Update, "res.partner", vec![3], Some(data), vec![], None, None, CallContext::new()).unwrap();

        scope.rollback(&client).await.unwrap();

        let calls = transport.calls.lock().await;
        let object_calls: Vec<_> = calls.iter().filter(|(service, _, _, _)| service == "object").collect();
        let last_two = &object_calls[object_calls.len() - 2..];
        assert_eq!(last_two[0].1, "execute_kw");
        assert_eq!(last_two[0].2[4], Value::String("write".into()));
        assert_eq!(last_two[1].2[4], Value::String("unlink".into()));
    }

    #[tokio::test]
    async fn batch_scope_executes_accumulated_operations() {
        let (client, _transport) = test_client();
        client.login("demo", "admin", "admin").await.unwrap();
        client.setup_batch_manager(BatchManagerConfig::default());

        let mut record = Map::new();
        record.insert("name".into(), Value::String("Ada".into()));
        let results = client.batch().unwrap().create("res.partner", vec![record]).execute().await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn model_handle_delegates_to_client() {
        let (client, _transport) = test_client();
        client.login("demo", "admin", "admin").await.unwrap();
        let id = client.model("res.partner").create(Map::new(), None).await.unwrap();
        assert!(id > 0);
    }
}
