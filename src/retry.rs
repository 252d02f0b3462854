//! Reconnect backoff and timeout utilities.
//!
//! The stream worker retries forever until it is stopped; the policy here only
//! decides how long to wait between attempts.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::debug;

// Any positive delay saturates `Duration` well before this many doublings.
const MAX_DOUBLINGS: usize = 128;

/// Policy controlling the delay between reconnect attempts.
///
/// There is no attempt cap: a stream keeps reconnecting until it is stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_backoff: delay,
            max_backoff: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Doubling delay from `initial` up to `max`, plus up to `jitter`.
    pub fn exponential(initial: Duration, max: Duration, jitter: Duration) -> Self {
        Self {
            initial_backoff: initial,
            max_backoff: max.max(initial),
            jitter,
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and counts consecutive failures since the last
    /// successful connect.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt.min(MAX_DOUBLINGS) {
            if delay.is_zero() || delay >= self.max_backoff {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay.saturating_add(jitter_duration(self.jitter, attempt))
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
///
/// Returns `true` when the full delay elapsed and `false` when cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }

    debug!(event = "backoff_wait", delay_ms = delay.as_millis() as u64);
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{sleep_or_cancel, with_timeout, ReconnectPolicy};

    #[test]
    fn fixed_policy_never_grows() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(5));
        for attempt in 1..50 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_secs(5));
        }
    }

    #[test]
    fn exponential_policy_doubles_up_to_cap() {
        let policy = ReconnectPolicy::exponential(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            Duration::ZERO,
        );
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(10_000), Duration::from_millis(1_000));
    }

    #[test]
    fn zero_initial_backoff_stays_zero_for_huge_attempt_counts() {
        let policy = ReconnectPolicy::exponential(
            Duration::ZERO,
            Duration::from_secs(30),
            Duration::ZERO,
        );
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::ZERO);
    }

    #[test]
    fn huge_attempt_count_is_capped_without_iterating_every_attempt() {
        let policy = ReconnectPolicy::exponential(
            Duration::from_nanos(1),
            Duration::MAX,
            Duration::ZERO,
        );
        let delay = policy.delay_for_attempt(usize::MAX);
        assert_eq!(delay, Duration::MAX);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = ReconnectPolicy::exponential(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(5),
        );
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(15));
        }
    }

    #[test]
    fn sleep_returns_false_when_cancelled_mid_wait() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                trigger.cancel();
            });

            let completed = with_timeout(
                Duration::from_secs(2),
                sleep_or_cancel(Duration::from_secs(60), &cancel),
            )
            .await
            .expect("cancel should interrupt the backoff wait");
            assert!(!completed);
        });
    }

    #[test]
    fn sleep_completes_without_cancel() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let cancel = CancellationToken::new();
            assert!(sleep_or_cancel(Duration::from_millis(1), &cancel).await);
        });
    }

    #[test]
    fn already_cancelled_token_skips_wait() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let cancel = CancellationToken::new();
            cancel.cancel();
            assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
        });
    }
}
