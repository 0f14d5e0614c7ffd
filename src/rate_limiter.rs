use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Point-in-time limiter counters. Best-effort consistent; no synchronization
/// contract beyond a single snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub queue_length: usize,
    pub active_requests: usize,
    pub available_tokens: u32,
}

/// Token-bucket state plus the concurrency gauge. Only ever touched inside a
/// non-suspending critical section.
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    active: usize,
}

impl BucketState {
    /// Lazy refill: convert elapsed time to fractional tokens, clamp at the
    /// bucket capacity, advance the refill instant.
    fn refill(&mut self, now: Instant, max_tokens: f64, refill_rate: f64) {
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        if elapsed_ms > 0.0 {
            self.tokens = (self.tokens + elapsed_ms * refill_rate).min(max_tokens);
            self.last_refill = now;
        }
    }
}

enum Admission {
    Granted,
    /// Not enough tokens; minimum sleep until one accrues.
    TokenWait(Duration),
    /// Tokens available but every concurrency slot is taken.
    SlotWait,
}

/// Rate limiter imposing two independent admission constraints on submitted
/// units of work: a token bucket (capacity `max_tokens`, continuous refill of
/// `max_tokens / time_window` tokens per millisecond) and a concurrency cap.
///
/// Waiters are dispatched in strict FIFO order of [`execute`] entry.
/// Head-of-line blocking is intended: the next waiter is not skipped when it
/// cannot yet admit. When the head waiter is starved for tokens it sleeps for
/// the minimum interval until one token accrues rather than busy-looping.
///
/// [`execute`]: QueuedRateLimiter::execute
pub struct QueuedRateLimiter {
    max_tokens: f64,
    /// Tokens per millisecond.
    refill_rate: f64,
    max_concurrent: usize,
    state: Mutex<BucketState>,
    /// Fair async lock granting the FIFO turn. tokio mutexes hand the lock to
    /// waiters in acquisition order, which is exactly the queue discipline.
    turn: tokio::sync::Mutex<()>,
    /// Signalled whenever a running unit of work completes.
    completion: Notify,
    queued: AtomicUsize,
}

impl QueuedRateLimiter {
    pub fn new(max_tokens: u32, time_window: Duration, max_concurrent: usize) -> Self {
        let max_tokens = f64::from(max_tokens.max(1));
        let window_ms = (time_window.as_secs_f64() * 1000.0).max(1.0);
        Self {
            max_tokens,
            refill_rate: max_tokens / window_ms,
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
                active: 0,
            }),
            turn: tokio::sync::Mutex::new(()),
            completion: Notify::new(),
            queued: AtomicUsize::new(0),
        }
    }

    /// Runs `work` once admission is granted, consuming one token and one
    /// concurrency slot for its duration. Resolves with exactly the value the
    /// work produced; failures inside `work` are the caller's to model in its
    /// output type. The limiter never retries or transforms outcomes.
    pub async fn execute<F, Fut, T>(&self, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.admit().await;
        let _slot = SlotGuard { limiter: self };
        work().await
    }

    /// Waits in FIFO order until both constraints admit, then atomically
    /// consumes one token and occupies a slot.
    async fn admit(&self) {
        let _queued = QueueGuard::new(&self.queued);
        let _turn = self.turn.lock().await;
        loop {
            match self.try_admit() {
                Admission::Granted => return,
                Admission::TokenWait(wait) => tokio::time::sleep(wait).await,
                Admission::SlotWait => self.completion.notified().await,
            }
        }
    }

    /// The admission check, token consumption and slot occupation as one
    /// non-suspending critical section.
    fn try_admit(&self) -> Admission {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.refill(Instant::now(), self.max_tokens, self.refill_rate);
        if state.tokens >= 1.0 && state.active < self.max_concurrent {
            state.tokens -= 1.0;
            state.active += 1;
            return Admission::Granted;
        }
        if state.tokens < 1.0 {
            let deficit_ms = ((1.0 - state.tokens) / self.refill_rate).ceil().max(1.0);
            Admission::TokenWait(Duration::from_millis(deficit_ms as u64))
        } else {
            Admission::SlotWait
        }
    }

    /// Snapshot of queue depth, in-flight work and whole tokens available.
    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.refill(Instant::now(), self.max_tokens, self.refill_rate);
        RateLimiterStats {
            queue_length: self.queued.load(Ordering::SeqCst),
            active_requests: state.active,
            available_tokens: state.tokens.floor() as u32,
        }
    }
}

/// Counts a waiter for the queue gauge; drops on admission or cancellation.
struct QueueGuard<'a> {
    queued: &'a AtomicUsize,
}

impl<'a> QueueGuard<'a> {
    fn new(queued: &'a AtomicUsize) -> Self {
        queued.fetch_add(1, Ordering::SeqCst);
        Self { queued }
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Releases the concurrency slot and wakes the queue head when the admitted
/// work finishes, fails or is dropped.
struct SlotGuard<'a> {
    limiter: &'a QueuedRateLimiter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self
                .limiter
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.active = state.active.saturating_sub(1);
        }
        self.limiter.completion.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_limiter_reports_full_bucket() {
        let limiter = QueuedRateLimiter::new(5, Duration::from_millis(1000), 3);
        let stats = limiter.stats();
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.available_tokens, 5);
    }

    #[tokio::test]
    async fn execute_propagates_values_and_errors() {
        let limiter = QueuedRateLimiter::new(5, Duration::from_millis(1000), 3);

        let ok = limiter.execute(|| async { 42 }).await;
        assert_eq!(ok, 42);

        let err: Result<(), String> = limiter
            .execute(|| async { Err("simulated failure".to_string()) })
            .await;
        assert_eq!(err.unwrap_err(), "simulated failure");
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_continuously_up_to_cap() {
        let limiter = QueuedRateLimiter::new(4, Duration::from_millis(1000), 4);

        // Drain the bucket.
        for _ in 0..4 {
            limiter.execute(|| async {}).await;
        }
        assert_eq!(limiter.stats().available_tokens, 0);

        // Half a window refills half the bucket.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(limiter.stats().available_tokens, 2);

        // Refill clamps at capacity no matter how long we idle.
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(limiter.stats().available_tokens, 4);
    }

    #[tokio::test]
    async fn slot_released_after_completion() {
        let limiter = QueuedRateLimiter::new(10, Duration::from_millis(1000), 1);
        limiter.execute(|| async {}).await;
        limiter.execute(|| async {}).await;
        assert_eq!(limiter.stats().active_requests, 0);
    }
}
