// SPDX-License-Identifier: MIT OR Apache-2.0
//! Jittered exponential backoff and classified retry loops.
//!
//! A [`BackoffPolicy`] describes the delay schedule; [`retry_async`] drives an
//! async operation under it, retrying only errors whose
//! [`ErrorClass`](sj_error::ErrorClass) says retrying can help. Fatal,
//! terminal, and cancellation errors propagate on the first occurrence.
//! [`CancelToken`] is the cooperative cancellation primitive the services
//! thread through their worker loops.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;

pub use cancel::CancelToken;

use rand::Rng;
use sj_error::{CoreError, CoreResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff schedule with an upper cap and optional full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    pub base: Duration,
    /// Multiplier applied per additional attempt.
    pub factor: u32,
    /// Upper bound for any single delay.
    pub cap: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Randomise each delay uniformly over `[delay/2, delay]`.
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Schedule for principal/map upserts contending on row locks:
    /// 50 ms base, doubling, capped at 500 ms, 4 attempts.
    pub fn identity() -> Self {
        Self {
            base: Duration::from_millis(50),
            factor: 2,
            cap: Duration::from_millis(500),
            max_attempts: 4,
            jitter: true,
        }
    }

    /// Schedule for utterance batch inserts: capped at 10 s, 4 attempts.
    pub fn insert() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2,
            cap: Duration::from_secs(10),
            max_attempts: 4,
            jitter: true,
        }
    }

    /// Schedule for whole-hour processing: caller-chosen attempts and base,
    /// capped at 30 s.
    pub fn hour(max_attempts: u32, base: Duration) -> Self {
        Self {
            base,
            factor: 2,
            cap: Duration::from_secs(30),
            max_attempts: max_attempts.max(1),
            jitter: true,
        }
    }

    /// Schedule for transient HTTP failures inside the fetcher: 3 attempts.
    pub fn fetch() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2,
            cap: Duration::from_secs(8),
            max_attempts: 3,
            jitter: true,
        }
    }

    /// Deterministic (pre-jitter) delay after the given 1-based attempt.
    ///
    /// Attempt `n` failing sleeps `min(base * factor^(n-1), cap)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let mult = (self.factor as u64).saturating_pow(exp);
        let millis = (self.base.as_millis() as u64).saturating_mul(mult);
        Duration::from_millis(millis).min(self.cap)
    }

    /// The delay actually slept: [`Self::delay`] with jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let d = self.delay(attempt);
        if !self.jitter || d.is_zero() {
            return d;
        }
        let millis = d.as_millis() as u64;
        let low = millis / 2;
        Duration::from_millis(rand::thread_rng().gen_range(low..=millis))
    }
}

// ---------------------------------------------------------------------------
// retry_async
// ---------------------------------------------------------------------------

/// Run `op` under `policy`, retrying classified-retryable failures.
///
/// `op` receives the 1-based attempt number. The last error is returned when
/// attempts are exhausted; non-retryable errors return immediately.
pub async fn retry_async<T, F, Fut>(policy: &BackoffPolicy, label: &str, mut op: F) -> CoreResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.jittered_delay(attempt);
                warn!(
                    component = "retry",
                    op = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Like [`retry_async`] but for operations that already know their error is
/// retryable only for specific codes; the predicate overrides classification.
pub async fn retry_async_if<T, F, Fut, P>(
    policy: &BackoffPolicy,
    label: &str,
    mut should_retry: P,
    mut op: F,
) -> CoreResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = CoreResult<T>>,
    P: FnMut(&CoreError) -> bool,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if should_retry(&err) && attempt < policy.max_attempts => {
                let delay = policy.jittered_delay(attempt);
                warn!(
                    component = "retry",
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
