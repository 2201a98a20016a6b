//! End-to-end coverage of the client facade against a scripted
//! `Transport`, exercising login, CRUD, transactions, and batching
//! together rather than in isolation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rpcflow::{
    BatchManagerConfig, Cache, CallContext, CacheBackendKind, CacheConfig, Client, ClientConfig, ClientError, RetryPolicy, Transport,
    TransactionManagerConfig,
};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

struct ScriptedTransport {
    calls: Mutex<Vec<(String, String)>>,
    next_id: AtomicI64,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl ScriptedTransport {
    fn new() -> Self {
        ScriptedTransport { calls: Mutex::new(Vec::new()), next_id: AtomicI64::new(1), fail_writes: std::sync::atomic::AtomicBool::new(false) }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn call(&self, service: &str, method: &str, args: Vec<Value>, _extra: Map<String, Value>) -> Result<Value, ClientError> {
        self.calls.lock().await.push((service.to_string(), method.to_string()));
        match (service, method) {
            ("common", "version") => Ok(serde_json::json!({"server_version": "17.0"})),
            ("common", "authenticate") => Ok(Value::from(7)),
            ("object", "execute_kw") => {
                let model = args.get(3).and_then(Value::as_str).unwrap_or_default();
                let op = args.get(4).and_then(Value::as_str).unwrap_or_default();
                match (model, op) {
                    ("res.users", "read") => Ok(Value::Array(vec![serde_json::json!({"id": 7, "lang": "en_US", "tz": "UTC"})])),
                    (_, "create") => {
                        if self.fail_writes.load(Ordering::SeqCst) {
                            return Err(ClientError::Access("no access to create on this model".into()));
                        }
                        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::from(id))
                    }
                    (_, "write") => Ok(Value::Bool(true)),
                    (_, "unlink") => Ok(Value::Bool(true)),
                    (_, "search_read") => Ok(Value::Array(Vec::new())),
                    (_, "fields_get") => Ok(Value::Object(Map::new())),
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

async fn logged_in_client() -> (Client, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new());
    let client = Client::new(ClientConfig::new("demo.example.com"), transport.clone(), RetryPolicy::default());
    client.login("demo", "admin", "admin").await.unwrap();
    (client, transport)
}

#[tokio::test]
async fn login_then_create_read_write_unlink_roundtrip() {
    let (client, _transport) = logged_in_client().await;

    let mut values = Map::new();
    values.insert("name".into(), Value::String("Ada Lovelace".into()));
    let id = client.create("res.partner", values, None, false).await.unwrap();
    assert!(id > 0);

    let mut updates = Map::new();
    updates.insert("name".into(), Value::String("Ada L.".into()));
    client.write("res.partner", vec![id], updates, None, false).await.unwrap();

    client.unlink("res.partner", vec![id], None, false).await.unwrap();
}

#[tokio::test]
async fn transaction_rolls_back_creates_and_updates_in_lifo_order_scenario_4() {
    let (client, transport) = logged_in_client().await;
    client.setup_transaction_manager(TransactionManagerConfig::default());

    let scope = client.transaction(None, true).unwrap();

    let mut created = Map::new();
    created.insert("name".into(), Value::String("New Co".into()));
    let id = client.create("res.partner", created, None, false).await.unwrap();

    let mut updates = Map::new();
    updates.insert("name".into(), Value::String("Renamed Co".into()));
    client.write("res.partner", vec![id], updates, None, false).await.unwrap();

    scope.rollback(&client).await.unwrap();

    let calls = transport.calls.lock().await;
    let object_calls: Vec<_> = calls.iter().filter(|(service, _)| service == "object").collect();
    // create, write (the mutation itself), then the two compensations: write (undo), unlink (undo)
    let tail = &object_calls[object_calls.len() - 2..];
    assert_eq!(tail[0].1, "write");
    assert_eq!(tail[1].1, "unlink");
}

#[tokio::test]
async fn batch_create_150_with_chunk_50_issues_three_execute_kw_calls_scenario_5() {
    let (client, transport) = logged_in_client().await;
    client.setup_batch_manager(BatchManagerConfig { max_chunk_size: 50, max_concurrency: 5, timeout: None, retry_attempts: 0 });

    let data: Vec<Map<String, Value>> = (0..150)
        .map(|i| {
            let mut m = Map::new();
            m.insert("name".into(), Value::String(format!("record-{i}")));
            m
        })
        .collect();

    let results = client.batch().unwrap().create("res.partner", data).execute().await.unwrap();
    assert_eq!(results.len(), 3);

    let calls = transport.calls.lock().await;
    let create_calls = calls.iter().filter(|(service, method)| service == "object" && method == "execute_kw").count();
    // 1 for the post-login user-context read + 3 for the chunked creates
    assert_eq!(create_calls, 4);
}

#[tokio::test]
async fn cache_invalidation_is_published_on_commit() {
    let (client, _transport) = logged_in_client().await;
    let cache = client.setup_cache_manager(CacheConfig { backend: CacheBackendKind::Memory, ..CacheConfig::default() });
    cache.set("res.partner:1", Value::String("stale".into()), None).await.unwrap();
    client.setup_transaction_manager(TransactionManagerConfig::default());

    let scope = client.transaction(None, true).unwrap();
    let mut values = Map::new();
    values.insert("name".into(), Value::String("X".into()));
    let id = client.create("res.partner", values, None, false).await.unwrap();
    assert!(id > 0);
    scope.commit().await.unwrap();

    assert_eq!(cache.get("res.partner:1").await.unwrap(), None);
}

#[tokio::test]
async fn safe_create_absorbs_access_errors_but_not_others() {
    let (client, transport) = logged_in_client().await;

    let values = Map::new();
    let outcome = client.safe_create("res.partner", values.clone(), Some(CallContext::new().with("lang", "en_US"))).await.unwrap();
    assert!(outcome.is_some());

    transport.fail_writes.store(true, Ordering::SeqCst);
    let outcome = client.safe_create("res.partner", values, None).await.unwrap();
    assert!(outcome.is_none());
}
