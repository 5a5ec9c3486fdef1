pub mod https;
pub mod ssh_exec;
pub mod ssh_shell;
pub mod telnet;

use crate::error::SwitchcraftError;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Lifecycle of a device session.
///
/// `disconnected → connecting → authenticated → ready → closing`; idle
/// sessions may be closed and transparently reconnected by the next command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Ready,
    Closing,
}

/// Connect/auth retry policy: exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(15),
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `n` (0-based): base * 2^n, capped, jittered ±10%.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << attempt.min(16));
        let capped = exp.min(self.cap.as_millis()) as u64;
        let jitter_range = capped / 10;
        let jitter: i64 = if jitter_range > 0 {
            rand::thread_rng().gen_range(-(jitter_range as i64)..=(jitter_range as i64))
        } else {
            0
        };
        Duration::from_millis((capped as i64 + jitter).max(0) as u64)
    }
}

/// Run a connect/auth closure with the retry policy. In-session command
/// failures never come through here; they surface to the executor.
pub fn connect_with_backoff<T, F>(
    policy: BackoffPolicy,
    action: &str,
    mut attempt_fn: F,
) -> Result<T, SwitchcraftError>
where
    F: FnMut() -> Result<T, SwitchcraftError>,
{
    let mut last_err = None;
    for attempt in 0..policy.retries {
        match attempt_fn() {
            Ok(value) => {
                if attempt > 0 {
                    debug!(target: "session::connect_with_backoff", action, attempt, "connected after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable_connect() && attempt + 1 < policy.retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(target: "session::connect_with_backoff", action, attempt, error = %err, ?delay, "connect attempt failed, backing off");
                std::thread::sleep(delay);
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        SwitchcraftError::ConnectionError(format!("{}: retries exhausted", action))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            retries: 5,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(15),
        };
        // ±10% jitter bounds
        let d0 = policy.delay_for_attempt(0);
        assert!(d0 >= Duration::from_millis(1800) && d0 <= Duration::from_millis(2200));
        let d3 = policy.delay_for_attempt(3);
        assert!(d3 >= Duration::from_millis(13_500) && d3 <= Duration::from_millis(16_500));
        let d10 = policy.delay_for_attempt(10);
        assert!(d10 <= Duration::from_millis(16_500));
    }

    #[test]
    fn retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            retries: 5,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        };
        let result = connect_with_backoff(policy, "test", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SwitchcraftError::ConnectionError("refused".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn non_transport_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            retries: 5,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        };
        let result: Result<(), _> = connect_with_backoff(policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SwitchcraftError::validation("bad input"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_retries_return_last_error() {
        let policy = BackoffPolicy {
            retries: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = connect_with_backoff(policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SwitchcraftError::ConnectionError("refused".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
