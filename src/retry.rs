//! Policy-driven retry engine (§4.5), generalizing
//! `foundation/gax::retry::invoke`/`invoke_fn`'s free functions from a
//! single `Predicate<E>` + fixed exponential backoff into a richer
//! strategy/policy/decision-table split (§4.5).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{ClientError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterType {
    None,
    Full,
    Equal,
    Decorrelated,
    Legacy,
}

fn apply_jitter(base: Duration, jitter: JitterType) -> Duration {
    let d = base.as_secs_f64();
    if d <= 0.0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    let secs = match jitter {
        JitterType::None => d,
        JitterType::Full => rng.gen_range(0.0..=d),
        JitterType::Equal => d / 2.0 + rng.gen_range(0.0..=d / 2.0),
        JitterType::Decorrelated => rng.gen_range(d / 3.0..=d),
        JitterType::Legacy => rng.gen_range(d * 0.75..=d * 1.25),
    };
    Duration::from_secs_f64(secs.max(0.0))
}

/// Template-method split mirroring the ABC/strategy pattern in the
/// original `RetryStrategy`: implementors provide the pure delay
/// formula, `get_delay` layers jitter and the attempt<=0 rule on top.
pub trait RetryStrategy: Send + Sync {
    /// 1-based attempt number to un-jittered delay.
    fn calculate_delay(&self, attempt: i64) -> Duration;

    fn jitter_type(&self) -> JitterType {
        JitterType::None
    }

    fn max_delay(&self) -> Duration;

    fn get_delay(&self, attempt: i64) -> Duration {
        if attempt <= 0 {
            return Duration::ZERO;
        }
        let raw = self.calculate_delay(attempt).min(self.max_delay());
        apply_jitter(raw, self.jitter_type())
    }
}

pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter: JitterType,
}

impl RetryStrategy for ExponentialBackoff {
    fn calculate_delay(&self, attempt: i64) -> Duration {
        let secs = self.base.as_secs_f64() * self.multiplier.powi((attempt - 1) as i32);
        Duration::from_secs_f64(secs)
    }
    fn jitter_type(&self) -> JitterType {
        self.jitter
    }
    fn max_delay(&self) -> Duration {
        self.max
    }
}

pub struct LinearBackoff {
    pub base: Duration,
    pub increment: Duration,
    pub max: Duration,
    pub jitter: JitterType,
}

impl RetryStrategy for LinearBackoff {
    fn calculate_delay(&self, attempt: i64) -> Duration {
        self.base + self.increment * (attempt - 1).max(0) as u32
    }
    fn jitter_type(&self) -> JitterType {
        self.jitter
    }
    fn max_delay(&self) -> Duration {
        self.max
    }
}

pub struct FixedDelay {
    pub delay: Duration,
    pub jitter: JitterType,
}

impl RetryStrategy for FixedDelay {
    fn calculate_delay(&self, _attempt: i64) -> Duration {
        self.delay
    }
    fn jitter_type(&self) -> JitterType {
        self.jitter
    }
    fn max_delay(&self) -> Duration {
        self.delay
    }
}

pub struct Fibonacci {
    pub base: Duration,
    pub max: Duration,
    pub jitter: JitterType,
}

fn fib(n: i64) -> u64 {
    if n <= 2 {
        return 1;
    }
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 3..=n {
        let next = a + b;
        a = b;
        b = next;
    }
    b
}

impl RetryStrategy for Fibonacci {
    fn calculate_delay(&self, attempt: i64) -> Duration {
        self.base * fib(attempt) as u32
    }
    fn jitter_type(&self) -> JitterType {
        self.jitter
    }
    fn max_delay(&self) -> Duration {
        self.max
    }
}

/// AWS-style decorrelated jitter. Unlike the other strategies this is
/// inherently stateful (each call depends on the *previous* delay, not
/// the attempt number), so `calculate_delay` ignores `attempt` and
/// advances an internal cursor instead (§4.5, scenario 3).
pub struct DecorrelatedJitter {
    pub base: Duration,
    pub cap: Duration,
    last: Mutex<Option<Duration>>,
}

impl DecorrelatedJitter {
    pub fn new(base: Duration, cap: Duration) -> Self {
        DecorrelatedJitter { base, cap, last: Mutex::new(None) }
    }
}

impl RetryStrategy for DecorrelatedJitter {
    fn calculate_delay(&self, _attempt: i64) -> Duration {
        let mut last = self.last.lock();
        let next = match *last {
            None => self.base,
            Some(prev) => {
                let hi = (prev * 3).min(self.cap).as_secs_f64().max(self.base.as_secs_f64());
                let lo = self.base.as_secs_f64();
                Duration::from_secs_f64(rand::thread_rng().gen_range(lo..=hi))
            }
        };
        *last = Some(next);
        next
    }
    fn jitter_type(&self) -> JitterType {
        JitterType::None
    }
    fn max_delay(&self) -> Duration {
        self.cap
    }
    fn get_delay(&self, attempt: i64) -> Duration {
        if attempt <= 0 {
            return Duration::ZERO;
        }
        self.calculate_delay(attempt)
    }
}

/// Keeps a sliding window of recent outcomes and scales an exponential
/// base by the observed success rate (§4.5).
pub struct AdaptiveStrategy {
    pub base: Duration,
    pub max: Duration,
    pub success_threshold: f64,
    pub adaptation_window: usize,
    pub min_samples: usize,
    outcomes: Mutex<std::collections::VecDeque<bool>>,
}

impl AdaptiveStrategy {
    pub fn new(base: Duration, max: Duration, success_threshold: f64, adaptation_window: usize, min_samples: usize) -> Self {
        AdaptiveStrategy {
            base,
            max,
            success_threshold,
            adaptation_window,
            min_samples,
            outcomes: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn record_outcome(&self, success: bool) {
        let mut outcomes = self.outcomes.lock();
        outcomes.push_back(success);
        while outcomes.len() > self.adaptation_window {
            outcomes.pop_front();
        }
    }

    fn success_rate(&self) -> Option<f64> {
        let outcomes = self.outcomes.lock();
        if outcomes.len() < self.min_samples {
            return None;
        }
        let successes = outcomes.iter().filter(|&&s| s).count();
        Some(successes as f64 / outcomes.len() as f64)
    }
}

impl RetryStrategy for AdaptiveStrategy {
    fn calculate_delay(&self, attempt: i64) -> Duration {
        let n = (attempt - 1).max(0) as i32;
        let multiplier = match self.success_rate() {
            None => 2f64.powi(n),
            Some(rate) if rate < self.success_threshold => 3f64.powi(n),
            Some(rate) if rate > 0.95 => 1.0 + 0.5 * n as f64,
            Some(_) => 1.5f64.powi(n),
        };
        Duration::from_secs_f64(self.base.as_secs_f64() * multiplier)
    }
    fn max_delay(&self) -> Duration {
        self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop,
    CircuitOpen,
    Timeout,
    NonRetryable,
}

type ErrorPredicate = Arc<dyn Fn(&ClientError) -> bool + Send + Sync>;
type BoolHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Composes a [`RetryStrategy`] with the predicate chain and terminal
/// behaviors from §4.5. Built with `RetryPolicy::new` then customized
/// via the `with_*` builders, the same typed-builder idiom as
/// `ClientConfig`/`PoolConfig`/`CacheConfig`.
pub struct RetryPolicy {
    pub strategy: Arc<dyn RetryStrategy>,
    pub max_attempts: u32,
    pub retryable_kinds: Option<HashSet<ErrorKind>>,
    pub non_retryable_kinds: HashSet<ErrorKind>,
    pub retry_condition: Option<ErrorPredicate>,
    pub timeout: Option<Duration>,
    pub max_total_delay: Option<Duration>,
    /// Returns `true` when the circuit is open and retries should be vetoed.
    pub circuit_breaker_hook: Option<BoolHook>,
    /// Returns `true` when the operation is idempotent and safe to retry.
    pub idempotency_check: Option<BoolHook>,
    pub backoff_multiplier_on_failure: f64,
    pub success_callback: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    pub failure_callback: Option<Arc<dyn Fn(&ClientError, u32) + Send + Sync>>,
}

impl RetryPolicy {
    pub fn new(strategy: Arc<dyn RetryStrategy>, max_attempts: u32) -> Self {
        RetryPolicy {
            strategy,
            max_attempts,
            retryable_kinds: None,
            non_retryable_kinds: HashSet::new(),
            retry_condition: None,
            timeout: None,
            max_total_delay: None,
            circuit_breaker_hook: None,
            idempotency_check: None,
            backoff_multiplier_on_failure: 1.0,
            success_callback: None,
            failure_callback: None,
        }
    }

    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn with_non_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.non_retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_retry_condition(mut self, f: impl Fn(&ClientError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_condition = Some(Arc::new(f));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_total_delay(mut self, delay: Duration) -> Self {
        self.max_total_delay = Some(delay);
        self
    }

    pub fn with_circuit_breaker_hook(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.circuit_breaker_hook = Some(Arc::new(f));
        self
    }

    pub fn with_idempotency_check(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.idempotency_check = Some(Arc::new(f));
        self
    }

    fn make_retry_decision(&self, attempt: u32, elapsed: Duration, total_delay: Duration, error: &ClientError) -> RetryDecision {
        if let Some(hook) = &self.circuit_breaker_hook {
            if hook() {
                return RetryDecision::CircuitOpen;
            }
        }
        if let Some(timeout) = self.timeout {
            if elapsed >= timeout {
                return RetryDecision::Timeout;
            }
        }
        if let Some(budget) = self.max_total_delay {
            if total_delay >= budget {
                return RetryDecision::Timeout;
            }
        }
        if attempt >= self.max_attempts {
            return RetryDecision::Stop;
        }
        let kind = error.kind();
        if self.non_retryable_kinds.contains(&kind) {
            return RetryDecision::NonRetryable;
        }
        if let Some(allowed) = &self.retryable_kinds {
            if !allowed.contains(&kind) {
                return RetryDecision::NonRetryable;
            }
        }
        if let Some(cond) = &self.retry_condition {
            if !cond(error) {
                return RetryDecision::NonRetryable;
            }
        }
        if let Some(check) = &self.idempotency_check {
            if !check() {
                return RetryDecision::NonRetryable;
            }
        }
        RetryDecision::Retry
    }

    /// Generic network policy: transport/timeout errors only, HTTP
    /// status filtered to the retryable set (§4.5 "network" preset).
    pub fn network() -> Self {
        RetryPolicy::new(
            Arc::new(ExponentialBackoff { base: Duration::from_millis(200), multiplier: 2.0, max: Duration::from_secs(10), jitter: JitterType::Full }),
            5,
        )
        .with_retryable_kinds([ErrorKind::Transport, ErrorKind::Timeout])
        .with_retry_condition(|e| e.is_retryable())
    }

    pub fn quick() -> Self {
        RetryPolicy::new(Arc::new(FixedDelay { delay: Duration::from_millis(200), jitter: JitterType::Equal }), 2)
            .with_timeout(Duration::from_secs(5))
    }

    pub fn aggressive() -> Self {
        RetryPolicy::new(
            Arc::new(ExponentialBackoff { base: Duration::from_millis(500), multiplier: 2.0, max: Duration::from_secs(30), jitter: JitterType::Full }),
            10,
        )
        .with_timeout(Duration::from_secs(300))
    }

    pub fn idempotent_store() -> Self {
        RetryPolicy::new(
            Arc::new(ExponentialBackoff { base: Duration::from_millis(100), multiplier: 2.0, max: Duration::from_secs(5), jitter: JitterType::Equal }),
            5,
        )
        .with_idempotency_check(|| true)
    }

    /// Like [`network`](Self::network) but also retries on server-side
    /// `Internal` failures, the closest kind this client's error
    /// taxonomy has to a driver-level "operational error" (§4.5
    /// "database" preset: adds driver-specific operational errors if
    /// available).
    pub fn database() -> Self {
        RetryPolicy::new(
            Arc::new(ExponentialBackoff { base: Duration::from_millis(200), multiplier: 2.0, max: Duration::from_secs(10), jitter: JitterType::Full }),
            5,
        )
        .with_retryable_kinds([ErrorKind::Transport, ErrorKind::Timeout, ErrorKind::Internal])
        .with_retry_condition(|e| matches!(e.kind(), ErrorKind::Internal) || e.is_retryable())
    }

    /// Delegates the stop/go decision entirely to an externally-owned
    /// circuit breaker via `circuit_breaker_hook`; the strategy itself
    /// only supplies the backoff shape for calls the breaker allows
    /// (§4.5 "circuit-breaker" preset). Callers attach the hook with
    /// [`with_circuit_breaker_hook`](Self::with_circuit_breaker_hook).
    pub fn circuit_breaker() -> Self {
        RetryPolicy::new(
            Arc::new(ExponentialBackoff { base: Duration::from_millis(200), multiplier: 2.0, max: Duration::from_secs(15), jitter: JitterType::Equal }),
            5,
        )
        .with_retryable_kinds([ErrorKind::Transport, ErrorKind::Timeout])
    }

    /// Short, tightly-bounded retry loop meant to be paired with
    /// [`retry_with_fallback`] so callers fall through to a degraded
    /// result quickly rather than exhausting a long backoff schedule
    /// (§4.5 "graceful-degradation" preset).
    pub fn graceful_degradation() -> Self {
        RetryPolicy::new(Arc::new(FixedDelay { delay: Duration::from_millis(100), jitter: JitterType::Equal }), 2)
            .with_timeout(Duration::from_secs(2))
    }
}

impl Default for RetryPolicy {
    /// Generic default policy: exponential backoff, transport-kind
    /// errors retryable, everything else is not.
    fn default() -> Self {
        RetryPolicy::new(
            Arc::new(ExponentialBackoff { base: Duration::from_millis(100), multiplier: 2.0, max: Duration::from_secs(30), jitter: JitterType::Full }),
            3,
        )
        .with_non_retryable_kinds([
            ErrorKind::Validation,
            ErrorKind::Access,
            ErrorKind::Authentication,
            ErrorKind::Missing,
            ErrorKind::MethodNotFound,
        ])
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RetryError {
    #[error("max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32, #[source] last_error: Box<ClientError> },
    #[error("retry timeout after {attempts} attempts, elapsed {elapsed:?}")]
    Timeout { elapsed: Duration, attempts: u32 },
    #[error("retry aborted: circuit breaker is open")]
    CircuitOpen,
}

/// Async retry loop entry point (§4.5's Loop). Generalizes
/// `foundation/gax::retry::invoke`/`invoke_fn` from a single
/// code-predicate to the full decision table in
/// [`RetryPolicy::make_retry_decision`].
pub async fn retry_with_policy<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClientError>>,
{
    let start = Instant::now();
    let mut total_delay = Duration::ZERO;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if let Some(cb) = &policy.success_callback {
                    cb(attempt);
                }
                return Ok(value);
            }
            Err(error) => {
                let elapsed = start.elapsed();
                let decision = policy.make_retry_decision(attempt, elapsed, total_delay, &error);
                if let Some(cb) = &policy.failure_callback {
                    cb(&error, attempt);
                }
                match decision {
                    RetryDecision::Retry => {
                        let delay = policy
                            .strategy
                            .get_delay(attempt as i64)
                            .mul_f64(policy.backoff_multiplier_on_failure.powi(attempt as i32 - 1));
                        total_delay += delay;
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::Timeout => return Err(RetryError::Timeout { elapsed, attempts: attempt }),
                    RetryDecision::CircuitOpen => return Err(RetryError::CircuitOpen),
                    RetryDecision::Stop | RetryDecision::NonRetryable => {
                        return Err(RetryError::MaxRetriesExceeded { attempts: attempt, last_error: Box::new(error) })
                    }
                }
            }
        }
    }
}

/// Same loop as [`retry_with_policy`], but a terminal non-retryable or
/// exhausted outcome is absorbed by `fallback` instead of propagating
/// (§4.5 `graceful_degradation`).
pub async fn retry_with_fallback<F, Fut, T, G>(policy: &RetryPolicy, op: F, fallback: G) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClientError>>,
    G: FnOnce(&ClientError) -> T,
{
    match retry_with_policy(policy, op).await {
        Ok(v) => Ok(v),
        Err(RetryError::MaxRetriesExceeded { last_error, .. }) => Ok(fallback(&last_error)),
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_matches_scenario_2() {
        let s = ExponentialBackoff { base: Duration::from_secs(1), multiplier: 2.0, max: Duration::from_secs(60), jitter: JitterType::None };
        let delays: Vec<u64> = (1..=5).map(|a| s.get_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn attempt_zero_or_negative_yields_zero_delay() {
        let s = ExponentialBackoff { base: Duration::from_secs(1), multiplier: 2.0, max: Duration::from_secs(60), jitter: JitterType::None };
        assert_eq!(s.get_delay(0), Duration::ZERO);
        assert_eq!(s.get_delay(-3), Duration::ZERO);
    }

    #[test]
    fn full_jitter_stays_within_base() {
        let s = ExponentialBackoff { base: Duration::from_secs(4), multiplier: 1.0, max: Duration::from_secs(60), jitter: JitterType::Full };
        for _ in 0..200 {
            let d = s.get_delay(1);
            assert!(d <= Duration::from_secs(4));
        }
    }

    #[test]
    fn equal_jitter_stays_in_half_to_full_range() {
        let s = ExponentialBackoff { base: Duration::from_secs(4), multiplier: 1.0, max: Duration::from_secs(60), jitter: JitterType::Equal };
        for _ in 0..200 {
            let d = s.get_delay(1).as_secs_f64();
            assert!((2.0..=4.0).contains(&d));
        }
    }

    #[test]
    fn decorrelated_jitter_scenario_3() {
        let s = DecorrelatedJitter::new(Duration::from_secs(1), Duration::from_secs(20));
        let first = s.get_delay(1);
        assert_eq!(first, Duration::from_secs(1));
        let mut prev = first;
        for _ in 0..20 {
            let next = s.get_delay(1);
            assert!(next >= Duration::from_secs(1));
            assert!(next <= (prev * 3).min(Duration::from_secs(20)) + Duration::from_millis(1));
            prev = next;
        }
    }

    #[test]
    fn fibonacci_delays_grow_as_fibonacci_sequence() {
        let s = Fibonacci { base: Duration::from_secs(1), max: Duration::from_secs(1000), jitter: JitterType::None };
        let delays: Vec<u64> = (1..=6).map(|a| s.get_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn all_named_presets_retry_transport_errors() {
        let presets = [
            RetryPolicy::default(),
            RetryPolicy::network(),
            RetryPolicy::database(),
            RetryPolicy::quick(),
            RetryPolicy::aggressive(),
            RetryPolicy::circuit_breaker(),
            RetryPolicy::idempotent_store(),
            RetryPolicy::graceful_degradation(),
        ];
        let err = ClientError::Transport(crate::error::TransportError::PoolExhausted);
        for policy in &presets {
            assert_eq!(policy.make_retry_decision(1, Duration::ZERO, Duration::ZERO, &err), RetryDecision::Retry);
        }
    }

    #[test]
    fn database_preset_also_retries_internal_errors() {
        let policy = RetryPolicy::database();
        let err = ClientError::Internal { message: "driver busy".into(), server_traceback: None };
        assert_eq!(policy.make_retry_decision(1, Duration::ZERO, Duration::ZERO, &err), RetryDecision::Retry);
    }

    #[tokio::test]
    async fn retry_loop_stops_at_max_attempts() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(Arc::new(FixedDelay { delay: Duration::from_millis(1), jitter: JitterType::None }), 3);
        let result: Result<(), RetryError> = retry_with_policy(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::Transport(crate::error::TransportError::PoolExhausted)) }
        })
        .await;
        assert!(matches!(result, Err(RetryError::MaxRetriesExceeded { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_kind_stops_immediately() {
        let policy = RetryPolicy::default();
        let result: Result<(), RetryError> =
            retry_with_policy(&policy, || async { Err(ClientError::validation("bad field")) }).await;
        assert!(matches!(result, Err(RetryError::MaxRetriesExceeded { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn graceful_degradation_returns_fallback() {
        let policy = RetryPolicy::new(Arc::new(FixedDelay { delay: Duration::from_millis(1), jitter: JitterType::None }), 1);
        let result = retry_with_fallback(
            &policy,
            || async { Err::<i32, _>(ClientError::Transport(crate::error::TransportError::PoolExhausted)) },
            |_| -1,
        )
        .await
        .unwrap();
        assert_eq!(result, -1);
    }
}
