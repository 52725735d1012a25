//! Bounded exponential-backoff polling.
//!
//! [`poll_until`] repeatedly evaluates a caller-supplied condition until it
//! reports [`Outcome::Success`], short-circuits on [`Outcome::Failure`], or
//! exhausts the attempt budget of its [`Backoff`]. The poller knows nothing
//! about what it is waiting for; all domain logic lives in the condition.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Pacing for a poll loop: `(initial delay, multiplicative factor, steps)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    /// Delay slept after the first pending invocation.
    pub initial: Duration,
    /// Multiplier applied to the delay after every sleep. Values below `1.0`
    /// or non-finite values keep the delay constant.
    pub factor: f64,
    /// Maximum number of condition invocations.
    pub steps: u32,
}

impl Backoff {
    /// Schedule used for block volume, attachment and share expansion jobs.
    pub const JOB: Self = Self {
        initial: Duration::from_secs(2),
        factor: 1.02,
        steps: 30,
    };

    /// Slower schedule for share provisioning, which takes minutes to settle.
    pub const SHARE_JOB: Self = Self {
        initial: Duration::from_secs(15),
        factor: 1.02,
        steps: 30,
    };

    /// Creates a schedule from its three components.
    #[must_use]
    pub const fn new(initial: Duration, factor: f64, steps: u32) -> Self {
        Self {
            initial,
            factor,
            steps,
        }
    }

    /// Returns the delay that follows `delay` in this schedule.
    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        reason = "backoff growth is defined as a floating point multiplier"
    )]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return delay;
        }
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.factor).unwrap_or(delay)
    }

    /// Total time spent sleeping when every invocation reports pending.
    ///
    /// This is the effective timeout of the schedule, ignoring the time the
    /// condition itself takes.
    #[must_use]
    pub fn budget(&self) -> Duration {
        let mut delay = self.initial;
        let mut total = Duration::ZERO;
        for _ in 1..self.steps {
            total = total.saturating_add(delay);
            delay = self.next_delay(delay);
        }
        total
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::JOB
    }
}

/// Result of a single condition evaluation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome<T, E> {
    /// The awaited state has not been reached yet; poll again.
    Pending,
    /// The awaited state was reached.
    Success(T),
    /// A terminal failure; polling stops immediately.
    Failure(E),
}

/// Errors returned by [`poll_until`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// The attempt budget was exhausted while the condition stayed pending.
    #[error("timed out waiting for condition after {attempts} attempts")]
    TimedOut {
        /// Number of condition invocations performed.
        attempts: u32,
    },
    /// The condition reported a terminal failure.
    #[error(transparent)]
    Condition(E),
}

/// Evaluates `condition` until it succeeds, fails, or the budget runs out.
///
/// The condition is invoked at most `backoff.steps` times. Between two
/// invocations the poller sleeps for the current delay, which grows by
/// `backoff.factor` after each sleep. No sleep follows the final invocation.
///
/// # Errors
///
/// Returns [`PollError::Condition`] with the first failure reported by the
/// condition (without retrying), or [`PollError::TimedOut`] when every
/// invocation reported [`Outcome::Pending`].
pub async fn poll_until<T, E, F, Fut>(backoff: Backoff, mut condition: F) -> Result<T, PollError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T, E>>,
{
    let mut delay = backoff.initial;
    for attempt in 1..=backoff.steps {
        match condition().await {
            Outcome::Success(value) => return Ok(value),
            Outcome::Failure(err) => return Err(PollError::Condition(err)),
            Outcome::Pending => {}
        }

        if attempt == backoff.steps {
            break;
        }
        debug!(
            attempt,
            steps = backoff.steps,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "condition pending"
        );
        sleep(delay).await;
        delay = backoff.next_delay(delay);
    }

    Err(PollError::TimedOut {
        attempts: backoff.steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Debug, Error, Eq, PartialEq)]
    #[error("boom")]
    struct Boom;

    fn fast(steps: u32) -> Backoff {
        Backoff::new(Duration::from_millis(1), 1.0, steps)
    }

    #[tokio::test]
    async fn failure_short_circuits_after_one_invocation() {
        let mut calls = 0_u32;
        let result: Result<(), _> = poll_until(fast(10), || {
            calls += 1;
            async { Outcome::Failure(Boom) }
        })
        .await;

        assert_eq!(result, Err(PollError::Condition(Boom)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn pending_exhausts_budget_with_exact_invocation_count() {
        let mut calls = 0_u32;
        let result: Result<(), PollError<Boom>> = poll_until(fast(4), || {
            calls += 1;
            async { Outcome::Pending }
        })
        .await;

        assert_eq!(result, Err(PollError::TimedOut { attempts: 4 }));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn success_after_pending_returns_value() {
        let mut calls = 0_u32;
        let result: Result<&str, PollError<Boom>> = poll_until(fast(5), || {
            calls += 1;
            let current = calls;
            async move {
                if current < 3 {
                    Outcome::Pending
                } else {
                    Outcome::Success("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn zero_steps_never_invokes_condition() {
        let mut calls = 0_u32;
        let result: Result<(), PollError<Boom>> = poll_until(fast(0), || {
            calls += 1;
            async { Outcome::Success(()) }
        })
        .await;

        assert_eq!(result, Err(PollError::TimedOut { attempts: 0 }));
        assert_eq!(calls, 0);
    }

    #[rstest]
    #[case(1.0, Duration::from_secs(2))]
    #[case(0.5, Duration::from_secs(2))]
    #[case(f64::NAN, Duration::from_secs(2))]
    #[case(1.5, Duration::from_secs(3))]
    fn next_delay_grows_only_for_valid_factors(#[case] factor: f64, #[case] expected: Duration) {
        let backoff = Backoff::new(Duration::from_secs(2), factor, 3);
        assert_eq!(backoff.next_delay(Duration::from_secs(2)), expected);
    }

    #[test]
    fn budget_sums_sleeps_between_invocations() {
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, 4);
        assert_eq!(backoff.budget(), Duration::from_secs(1 + 2 + 4));
    }

    #[test]
    fn default_job_schedule_is_a_few_minutes() {
        let budget = Backoff::JOB.budget();
        assert!(budget > Duration::from_secs(60), "budget too small: {budget:?}");
        assert!(budget < Duration::from_secs(300), "budget too large: {budget:?}");
    }
}
