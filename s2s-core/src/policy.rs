//! Polling policies: when the delivery loop wakes next, and when it gives up.
//!
//! A policy is a pure decision function over the outcome of the previous
//! cycle. `None` means stop; the loop ends and must be restarted.

use std::time::{Duration, SystemTime};

use crate::transaction::TransactionCompletion;

pub trait PollingPolicy: Send {
    /// Next run after a successful batch, or before the first one (`None`).
    fn next_desired_runtime(&self, last_completion: Option<&TransactionCompletion>) -> Option<SystemTime>;

    /// Next attempt after `consecutive_failures` failed transaction creates.
    fn next_retry_after_failed_transaction_create(&self, consecutive_failures: u32) -> Option<SystemTime>;

    /// Next attempt after `consecutive_failures` failed send/confirm/complete rounds.
    fn next_retry_after_failed_send(&self, consecutive_failures: u32) -> Option<SystemTime>;
}

fn after(delay: Duration) -> Option<SystemTime> {
    SystemTime::now().checked_add(delay)
}

/// Same delay after every success and every retry; stops once the number of
/// consecutive failures exceeds `max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelayPolicy {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelayPolicy {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }

    fn retry(&self, failures: u32) -> Option<SystemTime> {
        if failures > self.max_retries {
            return None;
        }
        after(self.delay)
    }
}

impl PollingPolicy for FixedDelayPolicy {
    fn next_desired_runtime(&self, _: Option<&TransactionCompletion>) -> Option<SystemTime> {
        after(self.delay)
    }

    fn next_retry_after_failed_transaction_create(&self, consecutive_failures: u32) -> Option<SystemTime> {
        self.retry(consecutive_failures)
    }

    fn next_retry_after_failed_send(&self, consecutive_failures: u32) -> Option<SystemTime> {
        self.retry(consecutive_failures)
    }
}

/// Base delay after success; failure `n` waits `min(base * 2^(n-1), max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoffPolicy {
    base: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl ExponentialBackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_delay,
            max_retries,
        }
    }

    /// Delay before the retry following `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn retry(&self, failures: u32) -> Option<SystemTime> {
        if failures > self.max_retries {
            return None;
        }
        after(self.backoff(failures))
    }
}

impl PollingPolicy for ExponentialBackoffPolicy {
    fn next_desired_runtime(&self, _: Option<&TransactionCompletion>) -> Option<SystemTime> {
        after(self.base)
    }

    fn next_retry_after_failed_transaction_create(&self, consecutive_failures: u32) -> Option<SystemTime> {
        self.retry(consecutive_failures)
    }

    fn next_retry_after_failed_send(&self, consecutive_failures: u32) -> Option<SystemTime> {
        self.retry(consecutive_failures)
    }
}

/// Deliver one batch now, then stop. Failed attempts are rescheduled by the
/// wrapped policy.
pub struct OneShotPolicy {
    retry: Box<dyn PollingPolicy>,
}

impl OneShotPolicy {
    pub fn new(retry: Box<dyn PollingPolicy>) -> Self {
        Self { retry }
    }

    /// One shot with fixed-delay retries.
    pub fn fixed(retry_delay: Duration, max_retries: u32) -> Self {
        Self::new(Box::new(FixedDelayPolicy::new(retry_delay, max_retries)))
    }
}

impl PollingPolicy for OneShotPolicy {
    fn next_desired_runtime(&self, last_completion: Option<&TransactionCompletion>) -> Option<SystemTime> {
        match last_completion {
            None => Some(SystemTime::now()),
            Some(_) => None,
        }
    }

    fn next_retry_after_failed_transaction_create(&self, consecutive_failures: u32) -> Option<SystemTime> {
        self.retry.next_retry_after_failed_transaction_create(consecutive_failures)
    }

    fn next_retry_after_failed_send(&self, consecutive_failures: u32) -> Option<SystemTime> {
        self.retry.next_retry_after_failed_send(consecutive_failures)
    }
}
