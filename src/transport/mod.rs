//! JSON-RPC transport: wire envelope, the [`Transport`] trait tests
//! substitute a fake for, and [`HttpTransport`], the pooled HTTP
//! implementation used in production (§4.1, §6).

pub mod circuit_breaker;
pub mod pool;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{map_jsonrpc_error, ClientError, JsonRpcErrorObject, TransportError};
use pool::ConnectionPool;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: JsonRpcParams<'a>,
    id: String,
}

#[derive(Debug, Serialize)]
struct JsonRpcParams<'a> {
    service: &'a str,
    method: &'a str,
    args: Vec<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

/// Capability the rest of the crate depends on. Swapped for a recording
/// fake in tests (§8.1); [`HttpTransport`] is the only production impl.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        extra: Map<String, Value>,
    ) -> Result<Value, ClientError>;

    async fn health_check(&self) -> bool;

    async fn close(&self);
}

/// Pooled HTTP(S) JSON-RPC transport (§4.1, §4.1.1).
pub struct HttpTransport {
    pool: Arc<ConnectionPool>,
    endpoint: String,
    timeout: Duration,
}

impl HttpTransport {
    pub async fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let pool = ConnectionPool::new(config.base_url(), config.timeout, config.verify_ssl, config.pool.clone()).await?;
        Ok(HttpTransport { pool, endpoint: format!("{}/jsonrpc", config.base_url()), timeout: config.timeout })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        extra: Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "call",
            params: JsonRpcParams { service, method, args, extra },
            id: Uuid::new_v4().to_string(),
        };

        let mut conn = self.pool.acquire().await.map_err(ClientError::Transport)?;
        let started = Instant::now();

        let send_result = tokio::time::timeout(
            self.timeout,
            conn.client().post(&self.endpoint).json(&request).send(),
        )
        .await;

        let outcome = match send_result {
            Err(_) => {
                conn.record_request(started.elapsed(), false);
                Err(ClientError::Transport(TransportError::Timeout(self.timeout)))
            }
            Ok(Err(e)) => {
                conn.record_request(started.elapsed(), false);
                let kind = if e.is_timeout() {
                    TransportError::Timeout(self.timeout)
                } else if e.is_connect() {
                    TransportError::Unreachable(e.to_string())
                } else {
                    TransportError::Http(e)
                };
                Err(ClientError::Transport(kind))
            }
            Ok(Ok(response)) => {
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    conn.record_request(started.elapsed(), false);
                    Err(ClientError::Transport(TransportError::HttpStatus { status: status.as_u16(), body }))
                } else {
                    match response.json::<JsonRpcResponse>().await {
                        Ok(envelope) => {
                            if let Some(error) = envelope.error {
                                conn.record_request(started.elapsed(), false);
                                Err(map_jsonrpc_error(&error))
                            } else {
                                conn.record_request(started.elapsed(), true);
                                Ok(envelope.result.unwrap_or(Value::Null))
                            }
                        }
                        Err(e) => {
                            conn.record_request(started.elapsed(), false);
                            Err(ClientError::Transport(TransportError::Http(e)))
                        }
                    }
                }
            }
        };

        outcome
    }

    async fn health_check(&self) -> bool {
        match self.call("common", "version", Vec::new(), Map::new()).await {
            Ok(Value::Object(map)) => !map.is_empty(),
            _ => false,
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_to_jsonrpc_envelope() {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "call",
            params: JsonRpcParams {
                service: "common",
                method: "version",
                args: vec![],
                extra: Map::new(),
            },
            id: "abc".into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["params"]["service"], "common");
        assert_eq!(v["id"], "abc");
    }
}
