//! Sharded token bucket limiter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backend::Limiter;
use super::shard::ShardSet;
use super::token::RateToken;
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitingConfig;

/// Smallest sweep period the background task accepts.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// A per-identity fixed window limiter.
///
/// Identities are spread over independent shards, each with its own lock,
/// so callers using different identities rarely touch the same lock and
/// never wait on each other's quota. A background task periodically drops
/// identities that have been idle longer than the configured threshold.
///
/// The owner should call [`TokenBucket::shutdown`] (or [`TokenBucket::close`])
/// when done; dropping the bucket also stops the sweeper.
pub struct TokenBucket {
    state: Arc<BucketState>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct BucketState {
    shards: ShardSet,
    max_requests: u32,
    window: Duration,
    idle_eviction: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a limiter running on the system clock.
    pub fn new(config: &RateLimitingConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter with a custom clock.
    ///
    /// The eviction task is spawned on the current tokio runtime. Outside a
    /// runtime no task is started and idle identities are only dropped by
    /// explicit [`TokenBucket::sweep`] calls.
    pub fn with_clock(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Self {
        if config.max_requests_per_window == 0 {
            warn!("max_requests_per_window is 0, admitting one request per window");
        }

        let state = Arc::new(BucketState {
            shards: ShardSet::new(config.shards),
            max_requests: config.max_requests_per_window.max(1),
            window: config.window(),
            idle_eviction: config.idle_eviction(),
            clock,
        });
        let cancel = CancellationToken::new();

        let sweeper = match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(sweep_loop(
                Arc::downgrade(&state),
                config.sweep_interval().max(MIN_SWEEP_INTERVAL),
                cancel.clone(),
            ))),
            Err(_) => {
                warn!("No tokio runtime available, idle identity eviction disabled");
                None
            }
        };

        info!(
            shards = state.shards.len(),
            max_requests = state.max_requests,
            window = ?state.window,
            idle_eviction = ?state.idle_eviction,
            "Token bucket limiter initialized"
        );

        Self {
            state,
            cancel,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Wait until `identity` may send one more request, then record it.
    pub async fn admit(&self, identity: &str) {
        let state = &self.state;
        let now = state.clock.now();

        // The shard lock only covers the bookkeeping; the wait happens after
        // it is released so other identities in the shard are not held up.
        let wait = {
            let mut tokens = state.shards.shard_for(identity).tokens.lock();
            match tokens.get_mut(identity) {
                Some(token) => token.admit(now, state.max_requests, state.window),
                None => {
                    tokens.insert(identity.to_owned(), RateToken::first_use(now));
                    Duration::ZERO
                }
            }
        };

        if wait.is_zero() {
            trace!(identity_shard = state.shards.index_of(identity), "Request admitted");
            return;
        }

        debug!(
            identity_shard = state.shards.index_of(identity),
            wait_ms = wait.as_millis() as u64,
            "Quota exhausted, waiting for next window"
        );
        state.clock.sleep(wait).await;
    }

    /// Drop every identity idle for at least the eviction threshold.
    ///
    /// Returns the number of identities removed.
    pub fn sweep(&self) -> usize {
        self.state.evict_idle()
    }

    /// Signal the eviction task to stop without waiting for it.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Stop the eviction task and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Eviction task ended abnormally");
            }
        }
        debug!("Token bucket limiter shut down");
    }

    /// Whether the limiter has been closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of identities currently tracked.
    pub fn identity_count(&self) -> usize {
        self.state
            .shards
            .iter()
            .map(|shard| shard.tokens.lock().len())
            .sum()
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.state.shards.len()
    }

    /// Requests recorded for `identity` in its current window, if tracked.
    pub fn requests_in_window(&self, identity: &str) -> Option<u32> {
        self.state
            .shards
            .shard_for(identity)
            .tokens
            .lock()
            .get(identity)
            .map(RateToken::requests_in_window)
    }

    #[cfg(test)]
    pub(crate) fn shard_index(&self, identity: &str) -> usize {
        self.state.shards.index_of(identity)
    }
}

impl BucketState {
    fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        // One shard lock at a time.
        for shard in self.shards.iter() {
            let mut tokens = shard.tokens.lock();
            let before = tokens.len();
            tokens.retain(|_, token| !token.is_idle(now, self.idle_eviction));
            removed += before - tokens.len();
        }

        removed
    }
}

async fn sweep_loop(weak: Weak<BucketState>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(period = ?period, "Idle identity eviction started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(state) = weak.upgrade() else { break };
                let removed = state.evict_idle();
                if removed > 0 {
                    debug!(removed, "Evicted idle identities");
                }
            }
        }
    }

    debug!("Idle identity eviction stopped");
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("shards", &self.state.shards.len())
            .field("max_requests", &self.state.max_requests)
            .field("window", &self.state.window)
            .field("idle_eviction", &self.state.idle_eviction)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    async fn admit(&self, identity: &str) {
        TokenBucket::admit(self, identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::{assert_pending, assert_ready, task};

    fn test_config(max_requests: u32) -> RateLimitingConfig {
        RateLimitingConfig {
            max_requests_per_window: max_requests,
            window_ms: 1000,
            idle_eviction_secs: 60,
            sweep_interval_secs: 3600,
            shards: 4,
        }
    }

    /// Two distinct identities that hash into the same shard.
    fn colliding_identities(bucket: &TokenBucket) -> (String, String) {
        let first = "identity-0".to_string();
        let target = bucket.shard_index(&first);
        let second = (1..)
            .map(|n| format!("identity-{}", n))
            .find(|candidate| bucket.shard_index(candidate) == target)
            .unwrap();
        (first, second)
    }

    #[tokio::test]
    async fn test_first_request_is_admitted() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(&test_config(1), clock.clone());

        bucket.admit("a").await;

        assert_eq!(bucket.identity_count(), 1);
        assert_eq!(bucket.requests_in_window("a"), Some(1));
        assert_eq!(clock.sleep_count(), 0);
    }

    #[tokio::test]
    async fn test_quota_is_not_throttled() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(&test_config(100), clock.clone());

        for _ in 0..100 {
            bucket.admit("a").await;
        }
        assert_eq!(clock.sleep_count(), 0);
        assert_eq!(bucket.requests_in_window("a"), Some(100));

        bucket.admit("a").await;
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_third_request_sleeps_full_window() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(&test_config(2), clock.clone());

        bucket.admit("a").await;
        bucket.admit("a").await;
        bucket.admit("a").await;

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
        assert_eq!(bucket.requests_in_window("a"), Some(1));
    }

    #[tokio::test]
    async fn test_sleeps_remaining_part_of_window() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(&test_config(2), clock.clone());

        bucket.admit("a").await;
        bucket.admit("a").await;
        clock.advance(Duration::from_millis(400));
        bucket.admit("a").await;

        assert_eq!(clock.sleeps(), vec![Duration::from_millis(600)]);
    }

    #[tokio::test]
    async fn test_sleeps_once_per_exhausted_window() {
        let clock = Arc::new(ManualClock::advancing());
        let bucket = TokenBucket::with_clock(&test_config(100), clock.clone());

        for _ in 0..301 {
            bucket.admit("a").await;
        }

        assert_eq!(clock.sleep_count(), 3);
    }

    #[tokio::test]
    async fn test_expired_window_resets_without_sleep() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(&test_config(2), clock.clone());

        bucket.admit("a").await;
        bucket.admit("a").await;
        clock.advance(Duration::from_secs(2));
        bucket.admit("a").await;

        assert_eq!(clock.sleep_count(), 0);
        assert_eq!(bucket.requests_in_window("a"), Some(1));
    }

    #[tokio::test]
    async fn test_colliding_identities_have_independent_counters() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(&test_config(2), clock.clone());
        let (a, b) = colliding_identities(&bucket);

        bucket.admit(&a).await;
        bucket.admit(&a).await;
        bucket.admit(&b).await;
        bucket.admit(&b).await;

        assert_eq!(clock.sleep_count(), 0);
        assert_eq!(bucket.requests_in_window(&a), Some(2));
        assert_eq!(bucket.requests_in_window(&b), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_identity_does_not_block_shard_neighbour() {
        let bucket = TokenBucket::new(&test_config(1));
        let (a, b) = colliding_identities(&bucket);

        bucket.admit(&a).await;

        let mut blocked = task::spawn(bucket.admit(&a));
        assert_pending!(blocked.poll());

        let mut neighbour = task::spawn(bucket.admit(&b));
        assert_ready!(neighbour.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_ready!(blocked.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_admissions_are_spread_over_windows() {
        let bucket = Arc::new(TokenBucket::new(&test_config(5)));
        let start = tokio::time::Instant::now();

        let calls = (0..15).map(|_| {
            let bucket = bucket.clone();
            async move { bucket.admit("a").await }
        });
        futures::future::join_all(calls).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_idle_identities() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(&test_config(10), clock.clone());

        bucket.admit("idle").await;
        clock.advance(Duration::from_secs(30));
        bucket.admit("active").await;
        clock.advance(Duration::from_secs(31));

        assert_eq!(bucket.sweep(), 1);
        assert_eq!(bucket.requests_in_window("idle"), None);
        assert_eq!(bucket.requests_in_window("active"), Some(1));
    }

    #[tokio::test]
    async fn test_reserved_window_survives_sweep() {
        let clock = Arc::new(ManualClock::new());
        let mut config = test_config(1);
        config.idle_eviction_secs = 0;
        let bucket = TokenBucket::with_clock(&config, clock.clone());

        bucket.admit("a").await;
        bucket.admit("a").await;

        // The second admission reserved a window that starts in the future.
        assert_eq!(bucket.sweep(), 0);
        assert_eq!(bucket.identity_count(), 1);
    }

    #[tokio::test]
    async fn test_admit_after_sweep_still_waits_for_reserved_window() {
        let clock = Arc::new(ManualClock::new());
        let mut config = test_config(1);
        config.idle_eviction_secs = 0;
        let bucket = TokenBucket::with_clock(&config, clock.clone());

        bucket.admit("a").await;
        bucket.admit("a").await;
        assert_eq!(clock.sleep_count(), 1);

        bucket.sweep();
        bucket.admit("a").await;

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(bucket.requests_in_window("a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts_idle_identities() {
        let mut config = test_config(10);
        config.idle_eviction_secs = 1;
        config.sweep_interval_secs = 1;
        let bucket = TokenBucket::new(&config);

        bucket.admit("a").await;
        assert_eq!(bucket.identity_count(), 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        tokio::task::yield_now().await;

        assert_eq!(bucket.identity_count(), 0);
        bucket.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeper() {
        let bucket = TokenBucket::new(&test_config(10));
        assert!(!bucket.is_closed());

        bucket.shutdown().await;

        assert!(bucket.is_closed());
        assert!(bucket.sweeper.lock().is_none());
        // Admission keeps working after shutdown, only eviction stops.
        bucket.admit("a").await;
        assert_eq!(bucket.identity_count(), 1);
    }

    #[test]
    fn test_without_runtime_has_no_sweeper() {
        let bucket = TokenBucket::new(&test_config(10));
        assert!(bucket.sweeper.lock().is_none());
        assert_eq!(bucket.shard_count(), 4);
    }

    #[tokio::test]
    async fn test_usable_as_dyn_limiter() {
        let limiter: Arc<dyn Limiter> = Arc::new(TokenBucket::new(&test_config(10)));
        limiter.admit("a").await;
        assert!(limiter.is_throttling());
    }
}
