//! Retry policy and backoff math.
//!
//! A [`RetryPolicy`] is an immutable value describing the attempt budget and
//! the shape of the delay inserted between attempts. It holds no state of its
//! own, so one policy can be shared by any number of concurrent executions.
//!
//! The un-jittered delay after failed attempt `n` (1-based) is
//!
//! ```text
//! base(n) = min(max_delay, initial_delay * backoff_multiplier^(n-1))
//! ```
//!
//! and the [`Jitter`] mode decides how much of `base(n)` is actually slept.

use std::fmt;
use std::time::Duration;

use nutype::nutype;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::PolicyError;

/// Growth factor applied to the delay after each failed attempt.
///
/// Always finite and strictly greater than 1.
#[nutype(
    validate(finite, greater = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BackoffMultiplier(f64);

impl BackoffMultiplier {
    /// The conventional doubling multiplier.
    pub fn doubling() -> Self {
        Self::try_new(2.0).expect("2.0 is a valid multiplier")
    }
}

/// Randomization applied to the base backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Sleep exactly the base delay.
    None,
    /// Sleep a uniformly random duration in `[0, base]`.
    Full,
    /// Sleep `base / 2` plus a uniformly random duration in `[0, base / 2]`.
    #[default]
    Equal,
}

impl Jitter {
    /// Lower-case name, used for span attributes and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Full => "full",
            Self::Equal => "equal",
        }
    }
}

impl fmt::Display for Jitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt budget and backoff shape for one logical operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: BackoffMultiplier,
    jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: BackoffMultiplier::doubling(),
            jitter: Jitter::Equal,
        }
    }
}

impl RetryPolicy {
    /// Starts a builder seeded with the default policy.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Number of retries allowed after the first attempt.
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total number of attempts allowed, `max_retries + 1`.
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the second attempt.
    pub const fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Upper bound on any single delay.
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Growth factor between consecutive delays.
    pub const fn backoff_multiplier(&self) -> BackoffMultiplier {
        self.backoff_multiplier
    }

    /// Jitter mode applied to every delay.
    pub const fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// The un-jittered delay that follows failed attempt `attempt` (1-based).
    ///
    /// Attempt `0` is treated as attempt `1`. The result never exceeds
    /// [`max_delay`](Self::max_delay) and the computation cannot overflow.
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap,
        reason = "delays are clamped to max_delay before converting back to integer nanoseconds"
    )]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial = self.initial_delay.as_nanos() as f64;
        let cap = self.max_delay.as_nanos() as f64;
        let multiplier: f64 = self.backoff_multiplier.into_inner();

        let scaled = initial * multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= cap {
            return self.max_delay;
        }
        Duration::from_nanos(scaled.round() as u64).min(self.max_delay)
    }

    /// The delay that follows failed attempt `attempt`, jitter applied with the thread RNG.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// The delay that follows failed attempt `attempt`, jitter drawn from `rng`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        match self.jitter {
            Jitter::None => base,
            Jitter::Full => uniform_up_to(base, rng),
            Jitter::Equal => {
                let half = base / 2;
                half + uniform_up_to(base - half, rng)
            }
        }
    }

    /// The delays of a complete retry sequence, one per allowed retry.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            next_attempt: 1,
        }
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "durations derived from max_delay fit in u64 nanoseconds"
)]
fn uniform_up_to<R: Rng + ?Sized>(limit: Duration, rng: &mut R) -> Duration {
    let nanos = limit.as_nanos().min(u128::from(u64::MAX)) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.random_range(0..=nanos))
}

/// Iterator over the jittered delays of a full retry sequence.
///
/// Created by [`RetryPolicy::backoff`]. Yields exactly `max_retries` items.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    next_attempt: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_attempt > self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.next_attempt);
        self.next_attempt += 1;
        Some(delay)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .policy
            .max_retries
            .saturating_add(1)
            .saturating_sub(self.next_attempt);
        let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Backoff {}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: Jitter,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_retries: defaults.max_retries,
            initial_delay: defaults.initial_delay,
            max_delay: defaults.max_delay,
            backoff_multiplier: defaults.backoff_multiplier.into_inner(),
            jitter: defaults.jitter,
        }
    }
}

impl RetryPolicyBuilder {
    /// Sets the number of retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay before the second attempt.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the cap on any single delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor between consecutive delays.
    #[must_use]
    pub const fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter mode.
    #[must_use]
    pub const fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Validates the configuration and produces the policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if either delay is zero, if `initial_delay`
    /// exceeds `max_delay`, or if the multiplier is not a finite number > 1.
    pub fn build(self) -> Result<RetryPolicy, PolicyError> {
        if self.initial_delay.is_zero() {
            return Err(PolicyError::ZeroInitialDelay);
        }
        if self.max_delay.is_zero() {
            return Err(PolicyError::ZeroMaxDelay);
        }
        if self.initial_delay > self.max_delay {
            return Err(PolicyError::InitialExceedsMax {
                initial: self.initial_delay,
                max: self.max_delay,
            });
        }
        let backoff_multiplier = BackoffMultiplier::try_new(self.backoff_multiplier)
            .map_err(|_| PolicyError::InvalidMultiplier(self.backoff_multiplier.to_string()))?;

        Ok(RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            backoff_multiplier,
            jitter: self.jitter,
        })
    }
}
