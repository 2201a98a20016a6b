//! Async JSON-RPC client library for business-application servers
//! exposing an `object.execute_kw`-style RPC surface over HTTP(S).
//!
//! Start with [`client::Client::connect`] or [`client::Client::builder`],
//! [`client::Client::login`], then [`client::Client::model`] or the raw
//! [`client::Client::execute_kw`]/[`client::Client::create`]/[`client::Client::write`]/
//! [`client::Client::unlink`] surface. Layer in [`client::Client::setup_cache_manager`],
//! [`client::Client::setup_transaction_manager`], and
//! [`client::Client::setup_batch_manager`] as needed.

pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod retry;
pub mod session;
pub mod transaction;
pub mod transport;

pub use batch::{Batch, BatchError, BatchExecutor, BatchManager, BatchOperation, BatchResult};
pub use cache::{Cache, CacheStats, MemoryCache, RemoteCache};
pub use client::{BatchScope, Client, ClientBuilder, ModelHandle};
pub use config::{
    BatchManagerConfig, CacheBackendKind, CacheConfig, CircuitBreakerConfig, ClientConfig, PoolConfig, Protocol,
    TransactionManagerConfig,
};
pub use error::{ClientError, ErrorKind};
pub use retry::{RetryDecision, RetryError, RetryPolicy, RetryStrategy};
pub use session::{CallContext, Session};
pub use transaction::{CrudExecutor, OperationType, Transaction, TransactionError, TransactionManager, TransactionScope};
pub use transport::{HttpTransport, Transport};
