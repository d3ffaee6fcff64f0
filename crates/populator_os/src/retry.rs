#![forbid(unsafe_code)]

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use backon::{
    BackoffBuilder, BlockingRetryable, ConstantBackoff, ConstantBuilder, ExponentialBackoff,
    ExponentialBuilder,
};
use populator_contracts::ContractViolation;
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;
pub const DEFAULT_BACKOFF_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        multiplier: u32,
        max: Duration,
    },
}

impl Backoff {
    /// The waits between attempts, at most `retries` of them.
    pub fn delays(&self, retries: usize) -> impl Iterator<Item = Duration> + Send + Sync + Unpin {
        match *self {
            Backoff::Fixed(interval) => Delays::Constant(
                ConstantBuilder::default()
                    .with_delay(interval)
                    .with_max_times(retries)
                    .build(),
            ),
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => Delays::Exponential(
                ExponentialBuilder::default()
                    .with_min_delay(initial)
                    .with_max_delay(max)
                    .with_factor(multiplier.max(1) as f32)
                    .with_max_times(retries)
                    .build(),
            ),
        }
    }
}

enum Delays {
    Constant(ConstantBackoff),
    Exponential(ExponentialBackoff),
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match self {
            Delays::Constant(inner) => inner.next(),
            Delays::Exponential(inner) => inner.next(),
        }
    }
}

/// Ends the backoff early once the next wait would overrun the deadline.
struct DeadlineBoundDelays<D> {
    delays: D,
    clock: Arc<dyn Clock>,
    started: Duration,
    deadline: Option<Duration>,
    deadline_hit: Arc<AtomicBool>,
}

impl<D> fmt::Debug for DeadlineBoundDelays<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineBoundDelays")
            .field("started", &self.started)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<D: Iterator<Item = Duration>> Iterator for DeadlineBoundDelays<D> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.delays.next()?;
        if let Some(deadline) = self.deadline {
            let elapsed = self.clock.now().saturating_sub(self.started);
            if elapsed.saturating_add(delay) > deadline {
                self.deadline_hit.store(true, Ordering::SeqCst);
                return None;
            }
        }
        Some(delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Total wall time allowed for connecting, including backoff waits.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, Duration::from_millis(DEFAULT_BACKOFF_MS))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(interval),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        if self.max_attempts == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "retry_policy.max_attempts",
                reason: "must be > 0",
            });
        }
        if let Backoff::Exponential {
            initial, max, ..
        } = self.backoff
        {
            if initial > max {
                return Err(ContractViolation::InvalidValue {
                    field: "retry_policy.backoff",
                    reason: "initial delay must not exceed max delay",
                });
            }
        }
        Ok(())
    }
}

pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Default)]
struct ManualClockState {
    now: Duration,
    sleeps: Vec<Duration>,
}

/// Test clock: `sleep` advances time instantly and is recorded.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualClockState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.now = state.now.saturating_add(duration);
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sleeps
            .clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.now = state.now.saturating_add(duration);
        state.sleeps.push(duration);
    }
}

/// Shared stop signal, checked before every attempt and every wait.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: E },
    DeadlineExceeded {
        attempts: u32,
        elapsed: Duration,
        last: E,
    },
    Permanent { attempts: u32, error: E },
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::DeadlineExceeded { attempts, .. }
            | RetryError::Permanent { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

enum Attempt<E> {
    Failed(E),
    Cancelled,
}

/// Runs `op` until it succeeds, returns a non-transient error, or the policy
/// gives up. Returns the value and the number of attempts made.
pub fn retry_with_policy<T, E, F, P>(
    policy: &RetryPolicy,
    clock: Arc<dyn Clock>,
    cancel: &CancellationToken,
    is_transient: P,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let started = clock.now();
    let deadline_hit = Arc::new(AtomicBool::new(false));
    let delays = DeadlineBoundDelays {
        delays: policy.backoff.delays((max_attempts - 1) as usize),
        clock: Arc::clone(&clock),
        started,
        deadline: policy.deadline,
        deadline_hit: Arc::clone(&deadline_hit),
    };
    let attempts = Cell::new(0u32);
    let sleeper = Arc::clone(&clock);
    let sleep_cancel = cancel.clone();

    let outcome = (|| {
        if cancel.is_cancelled() {
            return Err(Attempt::Cancelled);
        }
        attempts.set(attempts.get() + 1);
        op(attempts.get()).map_err(Attempt::Failed)
    })
    .retry(delays)
    .sleep(move |delay: Duration| {
        if !sleep_cancel.is_cancelled() {
            sleeper.sleep(delay);
        }
    })
    .when(|attempt| matches!(attempt, Attempt::Failed(err) if is_transient(err)))
    .notify(|attempt, delay| {
        if let Attempt::Failed(err) = attempt {
            warn!(
                attempt = attempts.get(),
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
        }
    })
    .call();

    let attempts = attempts.get();
    match outcome {
        Ok(value) => Ok((value, attempts)),
        Err(Attempt::Cancelled) => Err(RetryError::Cancelled { attempts }),
        Err(Attempt::Failed(error)) if !is_transient(&error) => {
            Err(RetryError::Permanent { attempts, error })
        }
        Err(Attempt::Failed(last)) if deadline_hit.load(Ordering::SeqCst) => {
            Err(RetryError::DeadlineExceeded {
                attempts,
                elapsed: clock.now().saturating_sub(started),
                last,
            })
        }
        Err(Attempt::Failed(last)) => Err(RetryError::Exhausted { attempts, last }),
    }
}
