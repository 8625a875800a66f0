//! Time-bounded polling primitives.
//!
//! Two questions get asked of a live value while a test drives load into a
//! system:
//!
//! - **Convergence**: does the value reach the desired one before a deadline?
//!   Transient mismatches are expected and tolerated.
//! - **Stability**: does the value stay at the expected one for a whole window?
//!   A single mismatching sample is a failure.
//!
//! Both helpers sample through an async probe and sleep with `tokio::time`, so
//! callers can run them under a paused clock in tests.
//!
//! # Invariants
//!
//! - The first sample is taken immediately (t = 0).
//! - A new sample is only taken while `elapsed < deadline`.
//! - Probe errors are returned as-is; nothing is retried.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Errors produced when a polling outcome is turned into a hard failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvergeError {
    /// The value never matched within the deadline.
    #[error("timeout after {elapsed:?} waiting for {resource} (last seen: {last_seen})")]
    Timeout {
        resource: String,
        elapsed: Duration,
        last_seen: String,
    },

    /// The value moved away from the expected one inside a stability window.
    #[error("{resource} deviated after {elapsed:?}: expected {expected}, got {actual}")]
    Deviation {
        resource: String,
        expected: String,
        actual: String,
        elapsed: Duration,
    },
}

/// Deadline and cadence for a polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Total time budget.
    pub timeout: Duration,

    /// Sleep between two samples.
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Outcome of [`wait_until_equal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence<T> {
    /// A sample matched the desired value.
    Converged { elapsed: Duration, samples: u32 },

    /// The deadline passed without a match.
    TimedOut {
        elapsed: Duration,
        last_seen: Option<T>,
    },
}

impl<T: Debug> Convergence<T> {
    /// Returns true if the value converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    /// Turn a timeout into a [`ConvergeError::Timeout`].
    pub fn into_result(self, resource: &str) -> Result<Duration, ConvergeError> {
        match self {
            Self::Converged { elapsed, .. } => Ok(elapsed),
            Self::TimedOut { elapsed, last_seen } => Err(ConvergeError::Timeout {
                resource: resource.to_string(),
                elapsed,
                last_seen: match last_seen {
                    Some(v) => format!("{v:?}"),
                    None => "nothing".to_string(),
                },
            }),
        }
    }
}

/// Outcome of [`ensure_stable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stability<T> {
    /// Every sample in the window matched.
    Stable { samples: u32 },

    /// A sample did not match. `sample` is its zero-based index.
    Deviated {
        actual: T,
        elapsed: Duration,
        sample: u32,
    },
}

impl<T: Debug> Stability<T> {
    /// Returns true if every sample matched.
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Stable { .. })
    }

    /// Turn a deviation into a [`ConvergeError::Deviation`].
    pub fn into_result(self, resource: &str, expected: &T) -> Result<u32, ConvergeError> {
        match self {
            Self::Stable { samples } => Ok(samples),
            Self::Deviated {
                actual, elapsed, ..
            } => Err(ConvergeError::Deviation {
                resource: resource.to_string(),
                expected: format!("{expected:?}"),
                actual: format!("{actual:?}"),
                elapsed,
            }),
        }
    }
}

/// Poll `probe` until it yields `desired` or `policy.timeout` elapses.
pub async fn wait_until_equal<T, E, F, Fut>(
    desired: &T,
    policy: PollPolicy,
    mut probe: F,
) -> Result<Convergence<T>, E>
where
    T: PartialEq,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut samples = 0u32;
    let mut last_seen = None;

    while start.elapsed() < policy.timeout {
        let value = probe().await?;
        samples += 1;

        if &value == desired {
            return Ok(Convergence::Converged {
                elapsed: start.elapsed(),
                samples,
            });
        }

        last_seen = Some(value);
        tokio::time::sleep(policy.interval).await;
    }

    Ok(Convergence::TimedOut {
        elapsed: start.elapsed(),
        last_seen,
    })
}

/// Poll `probe` across `window` and stop at the first sample that differs
/// from `expected`.
pub async fn ensure_stable<T, E, F, Fut>(
    expected: &T,
    window: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<Stability<T>, E>
where
    T: PartialEq,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut samples = 0u32;

    while start.elapsed() < window {
        let actual = probe().await?;

        if &actual != expected {
            return Ok(Stability::Deviated {
                actual,
                elapsed: start.elapsed(),
                sample: samples,
            });
        }

        samples += 1;
        tokio::time::sleep(interval).await;
    }

    Ok(Stability::Stable { samples })
}

/// Default convergence timeout for replica waits.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default poll interval for replica waits.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(20);

/// Default poll interval inside a stability window.
pub const DEFAULT_STABILITY_INTERVAL: Duration = Duration::from_secs(10);
