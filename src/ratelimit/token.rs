//! Per-identity fixed window state.

use std::time::Duration;
use tokio::time::Instant;

/// Request accounting for one identity.
///
/// A token is only mutated under its shard's lock, so the count and the
/// window start are always updated together.
#[derive(Debug, Clone)]
pub struct RateToken {
    /// Requests admitted in the current window
    requests_in_window: u32,
    /// Start of the current window. May lie in the future when a waiting
    /// caller has already reserved the first slot of the next window.
    window_start: Instant,
}

impl RateToken {
    /// A token for an identity seen for the first time; the first request
    /// is always admitted.
    pub fn first_use(now: Instant) -> Self {
        Self {
            requests_in_window: 1,
            window_start: now,
        }
    }

    /// Record one request and return how long the caller has to wait
    /// before sending it.
    ///
    /// Window rollover always restarts the count at 1, whether the window
    /// expired on its own or the quota was exhausted.
    pub fn admit(&mut self, now: Instant, max_requests: u32, window: Duration) -> Duration {
        let window_end = self.window_start + window;

        if now >= window_end {
            self.requests_in_window = 1;
            self.window_start = now;
            return Duration::ZERO;
        }

        if self.requests_in_window >= max_requests {
            // The caller sleeps until the current window ends and owns the
            // first slot of the next one.
            self.requests_in_window = 1;
            self.window_start = window_end;
            return window_end - now;
        }

        self.requests_in_window += 1;
        self.window_start.saturating_duration_since(now)
    }

    /// Whether the token has not been used for at least `threshold`.
    ///
    /// A token whose window starts in the future belongs to a caller that
    /// is still waiting for it and is never idle.
    pub fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        if self.window_start > now {
            return false;
        }
        now.duration_since(self.window_start) >= threshold
    }

    /// Requests admitted in the current window.
    pub fn requests_in_window(&self) -> u32 {
        self.requests_in_window
    }

    /// Start of the current window.
    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(1);

    #[test]
    fn test_first_use_counts_one() {
        let now = Instant::now();
        let token = RateToken::first_use(now);
        assert_eq!(token.requests_in_window(), 1);
        assert_eq!(token.window_start(), now);
    }

    #[test]
    fn test_admit_within_quota() {
        let now = Instant::now();
        let mut token = RateToken::first_use(now);

        for expected in 2..=5 {
            assert_eq!(token.admit(now, 5, WINDOW), Duration::ZERO);
            assert_eq!(token.requests_in_window(), expected);
        }
    }

    #[test]
    fn test_admit_over_quota_waits_for_remaining_window() {
        let start = Instant::now();
        let mut token = RateToken::first_use(start);
        token.admit(start, 2, WINDOW);

        let now = start + Duration::from_millis(300);
        let wait = token.admit(now, 2, WINDOW);

        assert_eq!(wait, Duration::from_millis(700));
        assert_eq!(token.requests_in_window(), 1);
        assert_eq!(token.window_start(), start + WINDOW);
    }

    #[test]
    fn test_admit_after_window_expired_resets() {
        let start = Instant::now();
        let mut token = RateToken::first_use(start);
        token.admit(start, 2, WINDOW);

        let later = start + Duration::from_secs(2);
        assert_eq!(token.admit(later, 2, WINDOW), Duration::ZERO);
        assert_eq!(token.requests_in_window(), 1);
        assert_eq!(token.window_start(), later);
    }

    #[test]
    fn test_admit_into_reserved_window_waits_for_its_start() {
        let start = Instant::now();
        let mut token = RateToken::first_use(start);

        // Exhaust, then reserve the next window.
        token.admit(start, 1, WINDOW);

        // A concurrent caller joins the reserved window and waits for it too.
        let wait = token.admit(start, 2, WINDOW);
        assert_eq!(wait, WINDOW);
        assert_eq!(token.requests_in_window(), 2);
    }

    #[test]
    fn test_idle_detection() {
        let start = Instant::now();
        let token = RateToken::first_use(start);

        assert!(!token.is_idle(start + Duration::from_secs(59), Duration::from_secs(60)));
        assert!(token.is_idle(start + Duration::from_secs(60), Duration::from_secs(60)));
    }

    #[test]
    fn test_reserved_window_is_never_idle() {
        let start = Instant::now();
        let mut token = RateToken::first_use(start);
        token.admit(start, 1, WINDOW);

        assert!(token.window_start() > start);
        assert!(!token.is_idle(start, Duration::ZERO));
        assert!(token.is_idle(start + WINDOW, Duration::ZERO));
    }
}
