//! Reconciliation loop primitives.
//!
//! A reconciler repeatedly compares what an entity should look like (its
//! desired state) with what was last observed and takes one step toward
//! convergence per attempt. This crate holds the pieces of that loop that do
//! not care what the entity is:
//!
//! - [`SyncOutcome`]: whether an attempt wants to be re-run right away.
//! - [`DistributedLock`]: TTL-bounded mutual exclusion shared by every
//!   reconciler process. Used for per-entity sync mutexes, leader leases on
//!   periodic sweeps and per-node admission gates.
//! - [`TtlCounter`]: small expiring counters (retry budgets).
//! - [`MemoryLeases`]: single-process implementation of both traits.
//!
//! # Invariants
//!
//! - A lease is held by at most one caller until it is released or its TTL
//!   elapses, whichever happens first.
//! - An expired lease is indistinguishable from one that was never taken.

mod leases;

pub use leases::MemoryLeases;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by lock and counter backends.
#[derive(Debug, Error)]
pub enum LockError {
    /// The shared storage behind the lock could not be reached.
    #[error("lock backend unavailable: {0}")]
    Backend(String),
}

/// Result of one reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SyncOutcome {
    /// Progress was made (or a poll is pending); schedule another attempt
    /// immediately, after the entity lock has been released.
    RunAgain,

    /// Nothing more to do until something external changes.
    Done,
}

impl SyncOutcome {
    pub fn should_run_again(self) -> bool {
        matches!(self, Self::RunAgain)
    }
}

/// Named, TTL-bounded mutual exclusion.
///
/// `acquire` never blocks: it either takes the lease or reports that someone
/// else holds it. The TTL is the backstop against holders that crash without
/// calling `release`.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn release(&self, key: &str) -> Result<(), LockError>;
}

/// Expiring integer counters keyed by name.
#[async_trait]
pub trait TtlCounter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<u32>, LockError>;

    /// Stores `value` under `key`, resetting its TTL.
    async fn set(&self, key: &str, value: u32, ttl: Duration) -> Result<(), LockError>;

    async fn delete(&self, key: &str) -> Result<(), LockError>;
}

/// Delay before retry number `attempt` when backing off linearly.
///
/// `linear_backoff(0, base)` is zero so the first retry is immediate.
pub fn linear_backoff(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt)
}

/// Default TTL of a per-entity sync lock. Long enough to cover the slowest
/// remote call a single attempt makes.
pub const DEFAULT_SYNC_LOCK_TTL: Duration = Duration::from_secs(360);

/// Default leader lease for periodic sweeps.
pub const DEFAULT_SWEEP_LEASE_TTL: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1000)]
    #[case(4, 4000)]
    #[case(10, 10_000)]
    fn test_linear_backoff(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(
            linear_backoff(attempt, Duration::from_millis(1000)),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_sync_outcome() {
        assert!(SyncOutcome::RunAgain.should_run_again());
        assert!(!SyncOutcome::Done.should_run_again());
    }
}
