//! Bounded, fixed-delay retry loop shared by connection setup, provisioning,
//! table-availability waits and batch inserts.

use log::{info, warn};
use std::fmt::Display;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest stretch a retry pause sleeps before looking at the cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    /// Fixed pause between attempts (no backoff).
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: NonZeroU32, delay: Duration) -> Self {
        RetryPolicy { max_attempts, delay }
    }

    /// Single attempt, no waiting.
    pub const fn once() -> Self {
        RetryPolicy {
            max_attempts: NonZeroU32::MIN,
            delay: Duration::ZERO,
        }
    }
}

/// Retry budgets for each kind of store interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicies {
    pub connect: RetryPolicy,
    pub schema: RetryPolicy,
    /// Polling for a freshly created table to accept queries.
    pub table_wait: RetryPolicy,
    pub insert: RetryPolicy,
}

impl RetryPolicies {
    /// Every budget collapsed to a single immediate attempt.
    pub const fn immediate() -> Self {
        RetryPolicies {
            connect: RetryPolicy::once(),
            schema: RetryPolicy::once(),
            table_wait: RetryPolicy::once(),
            insert: RetryPolicy::once(),
        }
    }
}

/// A retry loop was abandoned because shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled by shutdown request")]
pub struct Cancelled;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retryable failure on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },
    #[error("cancelled by shutdown request after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
            RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// The error worth reporting: the last failure, or `E::from(Cancelled)`.
    pub fn into_source(self) -> E
    where
        E: From<Cancelled>,
    {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
            RetryError::Cancelled { .. } => E::from(Cancelled),
        }
    }
}

/// Sleep for `delay`, waking early once `cancel` is set.
fn pause(delay: Duration, cancel: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !cancel.load(Ordering::SeqCst) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        thread::sleep(left.min(CANCEL_POLL));
    }
}

/// Run `action` until it succeeds, fails with an error `retryable` rejects, or
/// the attempt budget is spent. Sleeps `policy.delay` between attempts.
///
/// `cancel` is checked before every attempt and while sleeping; once set, the
/// loop returns `RetryError::Cancelled` without calling `action` again.
pub fn with_retry<T, E, P, F>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &AtomicBool,
    retryable: P,
    mut action: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Result<T, E>,
{
    let max = policy.max_attempts.get();
    let mut attempt = 0;
    loop {
        if cancel.load(Ordering::SeqCst) {
            info!("{} abandoned after {} attempt(s): shutdown requested", label, attempt);
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;
        match action() {
            Ok(value) => return Ok(value),
            Err(error) if !retryable(&error) => {
                return Err(RetryError::Aborted { attempt, error });
            }
            Err(last) if attempt >= max => {
                warn!("{} failed (attempt {}/{}): {}; giving up", label, attempt, max, last);
                return Err(RetryError::Exhausted { attempts: attempt, last });
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {}s",
                    label,
                    attempt,
                    max,
                    e,
                    policy.delay.as_secs_f64()
                );
                if !policy.delay.is_zero() {
                    pause(policy.delay, cancel);
                }
            }
        }
    }
}
