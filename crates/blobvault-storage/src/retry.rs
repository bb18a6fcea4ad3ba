//! Retrying transactional execution
//!
//! [`TransactionalExecutor`] runs a closure against a fresh transaction,
//! commits it, and re-runs the whole closure when the store reports a
//! transient conflict. Bodies must therefore be safe to re-run: anything
//! they do outside the transaction handle happens once per attempt.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::store::{RecordStore, WriteTransaction};

/// Bounded exponential backoff for transient conflicts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(rename = "initial_backoff_ms", with = "duration_millis")]
    pub initial_backoff: Duration,
    /// Upper bound for any single delay (before jitter)
    #[serde(rename = "max_backoff_ms", with = "duration_millis")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Extra random delay as a fraction of the computed delay (0.0..=1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Policy with `max_attempts` attempts and no sleeping between them
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set initial and maximum backoff
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Check that the policy can be executed
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.max_attempts == 0 {
            return Err(StorageError::config("retry.max_attempts must be at least 1"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(StorageError::config("retry.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(StorageError::config("retry.jitter must be within 0.0..=1.0"));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(StorageError::config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }
        Ok(())
    }

    /// Delay after the given failed attempt (1-based), without jitter
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(scaled as u64)
    }

    /// Delay after the given failed attempt with random jitter applied
    ///
    /// Jitter is clamped to `0.0..=1.0`; NaN means no jitter. A jittered
    /// delay that would overflow `Duration` falls back to the plain backoff.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_for(attempt);
        if self.jitter.is_nan() || self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter.min(1.0));
        Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + extra)).unwrap_or(base)
    }
}

/// Runs transaction bodies against a store, retrying on transient conflicts
#[derive(Debug)]
pub struct TransactionalExecutor<S> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S> Clone for TransactionalExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy.clone(),
        }
    }
}

impl<S: RecordStore> TransactionalExecutor<S> {
    /// Create an executor over `store`
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The retry policy in effect
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `body` in a write transaction and commit it
    pub fn run_in_transaction<F>(&self, operation: &'static str, body: F) -> Result<(), StorageError>
    where
        F: FnMut(&mut S::Write) -> Result<(), StorageError>,
    {
        self.call_in_transaction(operation, body)
    }

    /// Run `body` in a write transaction, commit it, and return its value
    ///
    /// A body error aborts the transaction. Conflicts from the body or from
    /// commit re-run the body on a new transaction.
    pub fn call_in_transaction<T, F>(&self, operation: &'static str, mut body: F) -> Result<T, StorageError>
    where
        F: FnMut(&mut S::Write) -> Result<T, StorageError>,
    {
        self.retrying(operation, || {
            let mut tx = self.store.begin_write()?;
            match body(&mut tx) {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(abort_err) = tx.abort() {
                        warn!(operation, error = %abort_err, "Failed to abort transaction");
                    }
                    Err(e)
                }
            }
        })
    }

    /// Run `body` with a read transaction it takes ownership of
    ///
    /// The body may keep the transaction alive inside its return value (for
    /// example in a lazy iterator); the snapshot stays open until that value
    /// is dropped.
    pub fn call_in_read_transaction<T, F>(&self, operation: &'static str, mut body: F) -> Result<T, StorageError>
    where
        F: FnMut(S::Read) -> Result<T, StorageError>,
    {
        self.retrying(operation, || body(self.store.begin_read()?))
    }

    fn retrying<T>(
        &self,
        operation: &'static str,
        mut attempt_once: impl FnMut() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match attempt_once() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempts = attempt, "Transaction succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        warn!(operation, attempts = attempt, error = %e, "Giving up on conflicting transaction");
                        return Err(StorageError::RetriesExhausted {
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient conflict, retrying transaction"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Serialize a [`Duration`] as whole milliseconds
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
