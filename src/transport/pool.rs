//! HTTP connection pool: health/age-bounded recycling of logical
//! JSON-RPC callers, gated by a shared [`CircuitBreaker`] (§4.1).
//!
//! Connections are tracked with a synchronous [`parking_lot::Mutex`]
//! rather than an async one, the same choice `spanner::session_pool`'s
//! `SessionPool` makes, so that returning a connection to the pool on
//! [`Drop`] never needs to block on an executor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::TransportError;
use crate::transport::circuit_breaker::CircuitBreaker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Active,
    Unhealthy,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub created_at: Instant,
    pub last_used: Instant,
    pub requests: u64,
    pub errors: u64,
    pub total_response_time: Duration,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        let now = Instant::now();
        ConnectionStats { created_at: now, last_used: now, requests: 0, errors: 0, total_response_time: Duration::ZERO }
    }
}

impl ConnectionStats {
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.errors as f64 / self.requests as f64) * 100.0
        }
    }

    fn record(&mut self, elapsed: Duration, success: bool) {
        self.requests += 1;
        self.total_response_time += elapsed;
        self.last_used = Instant::now();
        if !success {
            self.errors += 1;
        }
    }
}

pub struct PooledConnection {
    pub client: reqwest::Client,
    state: ConnectionState,
    pub stats: ConnectionStats,
    health_check_at: Instant,
}

impl PooledConnection {
    fn new(client: reqwest::Client) -> Self {
        PooledConnection { client, state: ConnectionState::Idle, stats: ConnectionStats::default(), health_check_at: Instant::now() }
    }

    fn mark_active(&mut self) {
        self.state = ConnectionState::Active;
        self.stats.last_used = Instant::now();
    }

    fn mark_idle(&mut self) {
        self.state = ConnectionState::Idle;
    }

    fn mark_unhealthy(&mut self) {
        self.state = ConnectionState::Unhealthy;
    }

    pub fn is_healthy(&self, max_error_rate: f64) -> bool {
        self.state != ConnectionState::Unhealthy && self.stats.error_rate() <= max_error_rate
    }

    fn should_health_check(&self, interval: Duration) -> bool {
        self.health_check_at.elapsed() > interval
    }

    pub fn record_request(&mut self, elapsed: Duration, success: bool) {
        self.stats.record(elapsed, success);
    }
}

struct PoolState {
    idle: VecDeque<PooledConnection>,
    total: usize,
}

/// Borrowed connection. Returned to the pool on drop; the caller should
/// call [`ManagedConnection::record_request`] before the guard drops so
/// the circuit breaker sees the outcome (§4.1's "successful release
/// records success").
pub struct ManagedConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<PooledConnection>,
}

impl ManagedConnection {
    pub fn client(&self) -> &reqwest::Client {
        &self.conn.as_ref().expect("connection taken").client
    }

    pub fn record_request(&mut self, elapsed: Duration, success: bool) {
        if let Some(conn) = self.conn.as_mut() {
            conn.record_request(elapsed, success);
        }
        if success {
            self.pool.circuit_breaker.record_success();
        } else {
            self.pool.circuit_breaker.record_failure();
        }
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

pub struct ConnectionPool {
    base_url: String,
    http_timeout: Duration,
    verify_ssl: bool,
    config: PoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
    closed: AtomicBool,
    cancel: CancellationToken,
    pub circuit_breaker: CircuitBreaker,
    health_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cleanup_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionPool {
    pub async fn new(base_url: String, http_timeout: Duration, verify_ssl: bool, config: PoolConfig) -> Result<Arc<Self>, TransportError> {
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        let pool = Arc::new(ConnectionPool {
            base_url,
            http_timeout,
            verify_ssl,
            config: config.clone(),
            state: Mutex::new(PoolState { idle: VecDeque::new(), total: 0 }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            circuit_breaker: breaker,
            health_task: Mutex::new(None),
            cleanup_task: Mutex::new(None),
        });

        {
            let mut state = pool.state.lock();
            for _ in 0..config.pool_size {
                state.idle.push_back(pool.create_connection()?);
                state.total += 1;
            }
        }

        let health_pool = Arc::clone(&pool);
        let health_handle = tokio::spawn(async move { health_pool.health_loop().await });
        let cleanup_pool = Arc::clone(&pool);
        let cleanup_handle = tokio::spawn(async move { cleanup_pool.cleanup_loop().await });
        *pool.health_task.lock() = Some(health_handle);
        *pool.cleanup_task.lock() = Some(cleanup_handle);

        Ok(pool)
    }

    fn create_connection(&self) -> Result<PooledConnection, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(self.http_timeout)
            .danger_accept_invalid_certs(!self.verify_ssl)
            .build()
            .map_err(TransportError::Http)?;
        Ok(PooledConnection::new(client))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<ManagedConnection, TransportError> {
        self.circuit_breaker.allow_request()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let deadline = Instant::now() + self.config.acquire_wait;
        loop {
            if let Some(conn) = self.try_take_or_create()? {
                return Ok(ManagedConnection { pool: Arc::clone(self), conn: Some(conn) });
            }
            if Instant::now() >= deadline {
                return Err(TransportError::PoolExhausted);
            }
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep(Duration::from_millis(25)) => {},
            }
        }
    }

    fn try_take_or_create(&self) -> Result<Option<PooledConnection>, TransportError> {
        let popped = {
            let mut state = self.state.lock();
            state.idle.pop_front()
        };

        if let Some(mut conn) = popped {
            if conn.is_healthy(self.config.max_error_rate) {
                conn.mark_active();
                return Ok(Some(conn));
            }
            {
                let mut state = self.state.lock();
                state.total = state.total.saturating_sub(1);
            }
            let fresh = self.create_or_count()?;
            return Ok(fresh);
        }

        let can_grow = {
            let state = self.state.lock();
            state.total < self.config.max_connections
        };
        if can_grow {
            return self.create_or_count();
        }
        Ok(None)
    }

    fn create_or_count(&self) -> Result<Option<PooledConnection>, TransportError> {
        let mut conn = self.create_connection()?;
        self.state.lock().total += 1;
        conn.mark_active();
        Ok(Some(conn))
    }

    fn release(self: &Arc<Self>, mut conn: PooledConnection) {
        if self.closed.load(Ordering::SeqCst) {
            self.drop_one();
            return;
        }
        if !conn.is_healthy(self.config.max_error_rate) {
            self.drop_one();
            self.maybe_replenish();
            self.notify.notify_one();
            return;
        }
        if conn.stats.created_at.elapsed() > self.config.connection_ttl {
            self.drop_one();
            self.maybe_replenish();
            self.notify.notify_one();
            return;
        }
        conn.mark_idle();
        self.state.lock().idle.push_back(conn);
        self.notify.notify_one();
    }

    fn drop_one(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    fn maybe_replenish(&self) {
        let should = {
            let state = self.state.lock();
            state.total < self.config.pool_size
        };
        if !should {
            return;
        }
        if let Ok(conn) = self.create_connection() {
            let mut state = self.state.lock();
            state.total += 1;
            state.idle.push_back(conn);
        }
    }

    pub fn num_connections(&self) -> usize {
        self.state.lock().total
    }

    async fn health_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            self.run_health_check().await;
        }
    }

    async fn run_health_check(&self) {
        let due: Vec<PooledConnection> = {
            let mut state = self.state.lock();
            let mut due = Vec::new();
            let mut keep = VecDeque::new();
            while let Some(conn) = state.idle.pop_front() {
                if conn.should_health_check(self.config.health_check_interval) {
                    due.push(conn);
                } else {
                    keep.push_back(conn);
                }
            }
            state.idle = keep;
            due
        };

        for mut conn in due {
            let healthy = self.ping(&conn).await;
            conn.health_check_at = Instant::now();
            if healthy {
                conn.mark_idle();
                self.state.lock().idle.push_back(conn);
            } else {
                conn.mark_unhealthy();
                tracing::warn!("connection pool: health check failed, closing connection");
                self.drop_one();
            }
        }
        self.maybe_replenish();
    }

    async fn ping(&self, conn: &PooledConnection) -> bool {
        let url = format!("{}/", self.base_url);
        match tokio::time::timeout(Duration::from_secs(5), conn.client.get(url).send()).await {
            Ok(Ok(resp)) => resp.status().as_u16() < 500,
            _ => false,
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            self.run_cleanup();
        }
    }

    fn run_cleanup(&self) {
        let mut state = self.state.lock();
        let max_close = state.idle.len() / 2;
        let mut kept = VecDeque::new();
        let mut closed = 0usize;
        while let Some(conn) = state.idle.pop_front() {
            if closed < max_close && conn.stats.created_at.elapsed() > self.config.connection_ttl {
                state.total = state.total.saturating_sub(1);
                closed += 1;
            } else {
                kept.push_back(conn);
            }
        }
        while state.total < self.config.pool_size {
            match self.create_connection() {
                Ok(conn) => {
                    state.total += 1;
                    kept.push_back(conn);
                }
                Err(_) => break,
            }
        }
        state.idle = kept;
    }

    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        for task in [self.health_task.lock().take(), self.cleanup_task.lock().take()] {
            if let Some(handle) = task {
                if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                    tracing::warn!("connection pool: background task did not shut down in time");
                }
            }
        }

        let mut state = self.state.lock();
        state.idle.clear();
        state.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_returns_idle_connection_and_release_reenqueues() {
        let pool = ConnectionPool::new("http://localhost:8069".into(), Duration::from_secs(5), true, PoolConfig { pool_size: 1, max_connections: 2, ..PoolConfig::default() })
            .await
            .unwrap();
        assert_eq!(pool.num_connections(), 1);
        let mut conn = pool.acquire().await.unwrap();
        conn.record_request(Duration::from_millis(1), true);
        drop(conn);
        assert_eq!(pool.num_connections(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn acquire_grows_pool_up_to_max_then_exhausts() {
        let pool = ConnectionPool::new(
            "http://localhost:8069".into(),
            Duration::from_secs(5),
            true,
            PoolConfig { pool_size: 0, max_connections: 1, acquire_wait: Duration::from_millis(50), ..PoolConfig::default() },
        )
        .await
        .unwrap();
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await;
        assert!(matches!(second, Err(TransportError::PoolExhausted)));
        drop(first);
        pool.close().await;
    }

    #[tokio::test]
    async fn verify_ssl_false_still_builds_a_working_pool() {
        // ClientConfig::with_verify_ssl(false) must actually reach the
        // per-connection reqwest::Client (danger_accept_invalid_certs),
        // not just sit on ClientConfig unread.
        let pool = ConnectionPool::new("http://localhost:8069".into(), Duration::from_secs(5), false, PoolConfig { pool_size: 1, max_connections: 1, ..PoolConfig::default() })
            .await
            .unwrap();
        assert!(!pool.verify_ssl);
        pool.close().await;
    }
}
