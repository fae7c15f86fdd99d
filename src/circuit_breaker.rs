//! Per-key circuit breakers with lock-free atomics.
//!
//! One breaker exists per operation key (`"storage:sqlite"`, `"streaming:ws"`, ...). Breakers
//! are created lazily on first use and live in a read-mostly registry; all state transitions
//! after that are compare-exchange operations on the breaker's own atomics.
//!
//! ```text
//! closed --threshold consecutive failures--> open
//! open   --timeout elapsed------------------> half-open (one probe admitted)
//! half-open --probe ok--> closed     half-open --probe failed--> open
//! ```

use crate::clock::{millis, Clock};
use crate::config::CircuitBreakerConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// State of a single breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    /// Epoch millis of the last state change, `None` if the breaker never moved.
    pub last_transition: Option<u64>,
}

/// Outcome of a guarded call that did not succeed.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Rejected without running the operation.
    Open {
        key: String,
        /// Time until a probe will be admitted; zero while another probe is in flight.
        retry_in: Duration,
    },
    /// The operation ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open { key, retry_in } => {
                write!(f, "circuit breaker '{key}' is open (retry in {retry_in:?})")
            }
            BreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at: AtomicU64,
    /// 0 means never transitioned.
    last_transition: AtomicU64,
    probe_in_flight: AtomicBool,
}

impl KeyState {
    fn load(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CircuitState, to: CircuitState, now: u64) -> bool {
        let won = self
            .state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.last_transition.store(now.max(1), Ordering::Release);
        }
        won
    }
}

/// Releases the half-open probe slot, including when the probe panics or is cancelled.
struct ProbeGuard<'a> {
    state: &'a KeyState,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.state.probe_in_flight.store(false, Ordering::Release);
    }
}

/// Registry of per-key breakers sharing one threshold and timeout.
pub struct CircuitBreaker {
    threshold: usize,
    timeout_ms: u64,
    clock: Arc<dyn Clock>,
    keys: RwLock<HashMap<String, Arc<KeyState>>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("threshold", &self.threshold)
            .field("timeout_ms", &self.timeout_ms)
            .field("keys", &self.snapshot())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: config.threshold.max(1),
            timeout_ms: millis(config.timeout()),
            clock,
            keys: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<Arc<KeyState>> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    fn get_or_create(&self, key: &str) -> Arc<KeyState> {
        if let Some(state) = self.get(key) {
            return state;
        }
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.entry(key.to_string()).or_default().clone()
    }

    /// Run `operation` under the breaker for `key`.
    ///
    /// # Errors
    /// [`BreakerError::Open`] when the key is open (or a probe is already in flight), without
    /// invoking `operation`; [`BreakerError::Inner`] when the operation itself fails.
    pub async fn execute<T, E, Fut, Op>(&self, key: &str, operation: Op) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let state = self.get_or_create(key);
        let guard = self.admit(key, &state)?;

        let result = operation().await;
        let is_probe = guard.is_some();
        match &result {
            Ok(_) => self.on_success(key, &state, is_probe),
            Err(_) => self.on_failure(key, &state, is_probe),
        }
        // Release the probe slot only after the outcome has moved the state.
        drop(guard);
        result.map_err(BreakerError::Inner)
    }

    fn admit<'a, E>(&self, key: &str, state: &'a KeyState) -> Result<Option<ProbeGuard<'a>>, BreakerError<E>> {
        loop {
            match state.load() {
                CircuitState::Closed => return Ok(None),
                CircuitState::Open => {
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(state.opened_at.load(Ordering::Acquire));
                    if elapsed < self.timeout_ms {
                        return Err(BreakerError::Open {
                            key: key.to_string(),
                            retry_in: Duration::from_millis(self.timeout_ms - elapsed),
                        });
                    }
                    if state.transition(CircuitState::Open, CircuitState::HalfOpen, now) {
                        tracing::info!(key, "circuit breaker → half-open");
                    }
                    // Re-check: whoever wins the probe slot below runs the probe.
                }
                CircuitState::HalfOpen => {
                    if state
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Err(BreakerError::Open { key: key.to_string(), retry_in: Duration::ZERO });
                    }
                    // The previous probe may have resolved between the load and the claim.
                    if state.load() != CircuitState::HalfOpen {
                        state.probe_in_flight.store(false, Ordering::Release);
                        continue;
                    }
                    tracing::debug!(key, "circuit breaker probe admitted");
                    return Ok(Some(ProbeGuard { state }));
                }
            }
        }
    }

    // Only the probe moves a half-open breaker. Calls admitted while closed that finish after
    // the breaker opened are ignored.
    fn on_success(&self, key: &str, state: &KeyState, is_probe: bool) {
        if !is_probe {
            if state.load() == CircuitState::Closed {
                state.consecutive_failures.store(0, Ordering::Release);
            }
            return;
        }
        state.consecutive_failures.store(0, Ordering::Release);
        if state.transition(CircuitState::HalfOpen, CircuitState::Closed, self.clock.now_millis()) {
            state.opened_at.store(0, Ordering::Release);
            tracing::info!(key, "circuit breaker → closed");
        }
    }

    fn on_failure(&self, key: &str, state: &KeyState, is_probe: bool) {
        let now = self.clock.now_millis();
        if is_probe {
            let failures = state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if state.transition(CircuitState::HalfOpen, CircuitState::Open, now) {
                state.opened_at.store(now, Ordering::Release);
                tracing::warn!(key, failures, "circuit breaker probe failed → open");
            }
            return;
        }
        if state.load() != CircuitState::Closed {
            return;
        }
        let failures = state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.threshold && state.transition(CircuitState::Closed, CircuitState::Open, now) {
            state.opened_at.store(now, Ordering::Release);
            tracing::error!(key, failures, threshold = self.threshold, "circuit breaker → open");
        }
    }

    /// Effective state of `key`: an open breaker whose timeout has elapsed reports
    /// `HalfOpen`. Unknown keys are `Closed`.
    pub fn state(&self, key: &str) -> CircuitState {
        self.get(key).map_or(CircuitState::Closed, |s| self.effective(&s))
    }

    fn effective(&self, state: &KeyState) -> CircuitState {
        match state.load() {
            CircuitState::Open => {
                let elapsed = self
                    .clock
                    .now_millis()
                    .saturating_sub(state.opened_at.load(Ordering::Acquire));
                if elapsed >= self.timeout_ms {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            other => other,
        }
    }

    /// Stats for `key`, `None` if the key has never been used.
    pub fn stats(&self, key: &str) -> Option<BreakerStats> {
        self.get(key).map(|s| BreakerStats {
            state: self.effective(&s),
            consecutive_failures: s.consecutive_failures.load(Ordering::Acquire),
            last_transition: match s.last_transition.load(Ordering::Acquire) {
                0 => None,
                at => Some(at),
            },
        })
    }

    /// All known keys with their effective state, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(String, CircuitState)> =
            keys.iter().map(|(k, s)| (k.clone(), self.effective(s))).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn any_open(&self) -> bool {
        self.snapshot().iter().any(|(_, s)| *s == CircuitState::Open)
    }

    /// Force `key` closed and clear its failure count. Returns `false` for unknown keys.
    pub fn reset(&self, key: &str) -> bool {
        let Some(state) = self.get(key) else {
            return false;
        };
        state.state.store(STATE_CLOSED, Ordering::Release);
        state.consecutive_failures.store(0, Ordering::Release);
        state.opened_at.store(0, Ordering::Release);
        state.last_transition.store(self.clock.now_millis().max(1), Ordering::Release);
        tracing::info!(key, "circuit breaker reset");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn breaker(threshold: usize, timeout_ms: u64, clock: &ManualClock) -> CircuitBreaker {
        let config = CircuitBreakerConfig { enabled: true, threshold, timeout_ms };
        CircuitBreaker::new(&config, Arc::new(clock.clone()))
    }

    async fn fail(b: &CircuitBreaker, key: &str) -> Result<(), BreakerError<TestError>> {
        b.execute(key, || async { Err(TestError("boom")) }).await
    }

    async fn succeed(b: &CircuitBreaker, key: &str) -> Result<(), BreakerError<TestError>> {
        b.execute(key, || async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let clock = ManualClock::starting_at(1_000);
        let b = breaker(3, 1_000, &clock);

        for _ in 0..2 {
            assert!(matches!(fail(&b, "storage:db").await, Err(BreakerError::Inner(_))));
        }
        assert_eq!(b.state("storage:db"), CircuitState::Closed);
        assert!(matches!(fail(&b, "storage:db").await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state("storage:db"), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result: Result<(), BreakerError<TestError>> = b
            .execute("storage:db", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { retry_in, .. }) if retry_in == Duration::from_millis(1_000)));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "open breaker must not invoke the operation");
    }

    #[tokio::test]
    async fn success_resets_consecutive_count() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(3, 1_000, &clock);
        fail(&b, "k").await.ok();
        fail(&b, "k").await.ok();
        succeed(&b, "k").await.unwrap();
        fail(&b, "k").await.ok();
        fail(&b, "k").await.ok();
        assert_eq!(b.state("k"), CircuitState::Closed);
        assert_eq!(b.stats("k").unwrap().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 500, &clock);
        fail(&b, "k").await.ok();
        assert_eq!(b.state("k"), CircuitState::Open);

        clock.advance(Duration::from_millis(500));
        assert_eq!(b.state("k"), CircuitState::HalfOpen);
        succeed(&b, "k").await.unwrap();

        let stats = b.stats("k").unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.last_transition, Some(500));
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_and_restarts_timer() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 500, &clock);
        fail(&b, "k").await.ok();
        clock.advance(Duration::from_millis(600));
        assert!(matches!(fail(&b, "k").await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state("k"), CircuitState::Open);

        clock.advance(Duration::from_millis(499));
        assert!(matches!(succeed(&b, "k").await, Err(BreakerError::Open { .. })));
        clock.advance(Duration::from_millis(1));
        assert!(succeed(&b, "k").await.is_ok());
    }

    #[tokio::test]
    async fn only_one_probe_while_half_open() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 100, &clock);
        fail(&b, "k").await.ok();
        clock.advance(Duration::from_millis(100));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = b.execute("k", || async move {
            release_rx.await.ok();
            Ok::<_, TestError>(())
        });
        let concurrent = async {
            tokio::task::yield_now().await;
            let rejected = succeed(&b, "k").await;
            release_tx.send(()).ok();
            rejected
        };
        let (probe_result, concurrent_result) = tokio::join!(probe, concurrent);
        assert!(probe_result.is_ok());
        assert!(matches!(concurrent_result, Err(BreakerError::Open { retry_in, .. }) if retry_in.is_zero()));
        assert_eq!(b.state("k"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn calls_admitted_while_closed_do_not_move_a_half_open_breaker() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 100, &clock);

        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = b.execute("k", || async move {
            slow_rx.await.ok();
            Ok::<_, TestError>(())
        });
        tokio::pin!(slow);
        assert!(futures::poll!(slow.as_mut()).is_pending());

        fail(&b, "k").await.ok();
        assert_eq!(b.state("k"), CircuitState::Open);
        clock.advance(Duration::from_millis(100));

        let (probe_tx, probe_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = b.execute("k", || async move {
            probe_rx.await.ok();
            Err::<(), _>(TestError("still down"))
        });
        tokio::pin!(probe);
        assert!(futures::poll!(probe.as_mut()).is_pending());
        assert_eq!(b.state("k"), CircuitState::HalfOpen);

        slow_tx.send(()).ok();
        assert!(slow.await.is_ok());
        assert_eq!(b.state("k"), CircuitState::HalfOpen, "only the probe may close the breaker");
        assert!(matches!(succeed(&b, "k").await, Err(BreakerError::Open { retry_in, .. }) if retry_in.is_zero()));

        probe_tx.send(()).ok();
        assert!(matches!(probe.await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state("k"), CircuitState::Open);
    }

    #[tokio::test]
    async fn late_failure_during_half_open_is_ignored() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 100, &clock);

        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = b.execute("k", || async move {
            slow_rx.await.ok();
            Err::<(), _>(TestError("timed out"))
        });
        tokio::pin!(slow);
        assert!(futures::poll!(slow.as_mut()).is_pending());

        fail(&b, "k").await.ok();
        clock.advance(Duration::from_millis(100));

        let (probe_tx, probe_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = b.execute("k", || async move {
            probe_rx.await.ok();
            Ok::<_, TestError>(())
        });
        tokio::pin!(probe);
        assert!(futures::poll!(probe.as_mut()).is_pending());

        slow_tx.send(()).ok();
        assert!(matches!(slow.await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state("k"), CircuitState::HalfOpen);

        probe_tx.send(()).ok();
        assert!(probe.await.is_ok());
        assert_eq!(b.state("k"), CircuitState::Closed);
        assert_eq!(b.stats("k").unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn panicking_probe_releases_slot() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 100, &clock);
        fail(&b, "k").await.ok();
        clock.advance(Duration::from_millis(100));

        fn explode() -> Result<(), TestError> {
            panic!("probe exploded")
        }
        let panicked = std::panic::AssertUnwindSafe(b.execute("k", || async { explode() }))
        .catch_unwind()
        .await;
        assert!(panicked.is_err());

        assert!(succeed(&b, "k").await.is_ok(), "slot must be free after a panicking probe");
        assert_eq!(b.state("k"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 1_000, &clock);
        fail(&b, "storage:a").await.ok();
        assert!(succeed(&b, "storage:b").await.is_ok());
        assert_eq!(
            b.snapshot(),
            vec![("storage:a".to_string(), CircuitState::Open), ("storage:b".to_string(), CircuitState::Closed)]
        );
        assert!(b.any_open());
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 60_000, &clock);
        fail(&b, "k").await.ok();
        assert!(b.reset("k"));
        assert_eq!(b.state("k"), CircuitState::Closed);
        assert!(succeed(&b, "k").await.is_ok());
        assert!(!b.reset("unknown"));
    }

    #[test]
    fn unknown_key_is_closed_without_stats() {
        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 1, &clock);
        assert_eq!(b.state("nope"), CircuitState::Closed);
        assert!(b.stats("nope").is_none());
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn opening_is_logged_with_key() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = ManualClock::starting_at(0);
        let b = breaker(1, 1_000, &clock);
        fail(&b, "streaming:ws").await.ok();

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("circuit breaker → open"), "logs: {logs}");
        assert!(logs.contains("streaming:ws"));
    }
}
