//! Retry decisions for failed broadcasts

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

use crate::config::QueueConfig;
use crate::error::BroadcastFailure;

/// What the broadcaster does after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-read the pending nonce, rebuild, retry immediately
    Resync,
    /// Sleep, probing connectivity first when `probe` is set
    Backoff { probe: bool },
    /// Give up on this job
    Fail,
}

/// Per-job retry bookkeeping. Nonce resyncs do not consume attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub resyncs: u32,
}

impl RetryState {
    pub fn decide(&mut self, kind: BroadcastFailure, config: &QueueConfig) -> RetryDecision {
        match kind {
            // AlreadyKnown: the payload sits in the node's pool at this nonce
            BroadcastFailure::InsufficientFunds | BroadcastFailure::AlreadyKnown => {
                RetryDecision::Fail
            }
            BroadcastFailure::NonceTooLow => {
                if self.resyncs < config.max_nonce_resyncs {
                    self.resyncs += 1;
                    RetryDecision::Resync
                } else {
                    RetryDecision::Fail
                }
            }
            BroadcastFailure::Transient
            | BroadcastFailure::Underpriced
            | BroadcastFailure::Other => {
                self.attempts += 1;
                if self.attempts >= config.max_attempts {
                    RetryDecision::Fail
                } else {
                    RetryDecision::Backoff {
                        probe: kind == BroadcastFailure::Transient,
                    }
                }
            }
        }
    }
}

/// Exponential backoff for broadcast retries: base × 2^attempt, capped,
/// with jitter. Bounded by attempts, never by elapsed time.
pub fn broadcast_backoff(config: &QueueConfig) -> ExponentialBackoff {
    exponential(
        Duration::from_millis(config.base_backoff_ms),
        Duration::from_millis(config.max_backoff_ms),
    )
}

/// Exponential backoff without an elapsed-time limit
pub fn exponential(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max.max(initial))
        .with_multiplier(2.0)
        .with_randomization_factor(0.25)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    fn config() -> QueueConfig {
        QueueConfig {
            max_attempts: 3,
            max_nonce_resyncs: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_nonce_resync_does_not_consume_attempts() {
        let cfg = config();
        let mut state = RetryState::default();
        assert_eq!(state.decide(BroadcastFailure::NonceTooLow, &cfg), RetryDecision::Resync);
        assert_eq!(state.decide(BroadcastFailure::NonceTooLow, &cfg), RetryDecision::Resync);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.decide(BroadcastFailure::NonceTooLow, &cfg), RetryDecision::Fail);
    }

    #[test]
    fn test_transient_backs_off_until_ceiling() {
        let cfg = config();
        let mut state = RetryState::default();
        assert_eq!(
            state.decide(BroadcastFailure::Transient, &cfg),
            RetryDecision::Backoff { probe: true }
        );
        assert_eq!(
            state.decide(BroadcastFailure::Other, &cfg),
            RetryDecision::Backoff { probe: false }
        );
        assert_eq!(state.decide(BroadcastFailure::Transient, &cfg), RetryDecision::Fail);
    }

    #[test]
    fn test_insufficient_funds_fails_fast() {
        let mut state = RetryState::default();
        assert_eq!(
            state.decide(BroadcastFailure::InsufficientFunds, &config()),
            RetryDecision::Fail
        );
        assert_eq!(state.attempts, 0);
    }

    #[test]
    fn test_already_known_never_retries() {
        let mut state = RetryState::default();
        assert_eq!(
            state.decide(BroadcastFailure::AlreadyKnown, &config()),
            RetryDecision::Fail
        );
        assert_eq!(state.resyncs, 0);
        assert_eq!(state.attempts, 0);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = exponential(Duration::from_millis(100), Duration::from_millis(400));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.next_backoff().expect("no elapsed limit");
        }
        // Cap plus jitter
        assert!(last <= Duration::from_millis(500));
    }
}
