//! Fault injection for attempt scopes.
//!
//! [`ChaosScopes`] wraps any scope factory and makes individual scope
//! transitions fail at configurable rates. An injected fault short-circuits
//! the transition: the wrapped scope never sees it.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dbop::{
    AttemptScope, BlockingAttemptScope, BlockingScopeFactory, DriverError, ErrorClass, ErrorInfo,
    ScopeFactory,
};
use nutype::nutype;
use rand::rngs::StdRng;
use rand::{random, Rng, SeedableRng};
use thiserror::Error;
use tracing::debug;

/// Probability value for fault injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject faults and 1.0 means always inject them.
///
/// # Examples
///
/// ```ignore
/// use dbop_testing::Probability;
///
/// let never = Probability::try_new(0.0).unwrap();
/// let always = Probability::try_new(1.0).unwrap();
///
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f64);

impl Probability {
    fn clamped(value: f64) -> Self {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        Self::try_new(value).expect("clamped value is always valid")
    }

    fn never() -> Self {
        Self::try_new(0.0).expect("0.0 is valid probability")
    }
}

/// The scope transition a fault was injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// `enter`
    Enter,
    /// `commit`
    Commit,
    /// `rollback`
    Rollback,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enter => "enter",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        })
    }
}

/// Error produced by an injected fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (injected into {transition})")]
pub struct InjectedFault {
    /// Where the fault was injected.
    pub transition: Transition,
    /// Configured fault message.
    pub message: String,
}

impl DriverError for InjectedFault {
    fn message(&self) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed(&self.message)
    }

    fn error_class(&self) -> ErrorClass {
        ErrorClass::Operational
    }
}

impl From<InjectedFault> for ErrorInfo {
    fn from(fault: InjectedFault) -> Self {
        Self::new(fault.to_string()).with_class(ErrorClass::Operational)
    }
}

/// Fault rates and seeding for [`ChaosScopes`].
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    enter_failure: Probability,
    commit_failure: Probability,
    rollback_failure: Probability,
    fault_message: String,
}

impl ChaosConfig {
    /// No faults, seeded with `0`.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Seeds the fault generator.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.deterministic_seed = Some(seed);
        self
    }

    /// Rate of failing `enter` calls; clamped to [0, 1].
    #[must_use]
    pub fn with_enter_failure(mut self, probability: f64) -> Self {
        self.enter_failure = Probability::clamped(probability);
        self
    }

    /// Rate of failing `commit` calls; clamped to [0, 1].
    #[must_use]
    pub fn with_commit_failure(mut self, probability: f64) -> Self {
        self.commit_failure = Probability::clamped(probability);
        self
    }

    /// Rate of failing `rollback` calls; clamped to [0, 1].
    #[must_use]
    pub fn with_rollback_failure(mut self, probability: f64) -> Self {
        self.rollback_failure = Probability::clamped(probability);
        self
    }

    /// Message carried by injected faults, e.g. `"deadlock detected"` to make
    /// them look transient to the default classifier.
    #[must_use]
    pub fn with_fault_message(mut self, message: impl Into<String>) -> Self {
        self.fault_message = message.into();
        self
    }

    const fn probability(&self, transition: Transition) -> Probability {
        match transition {
            Transition::Enter => self.enter_failure,
            Transition::Commit => self.commit_failure,
            Transition::Rollback => self.rollback_failure,
        }
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            enter_failure: Probability::never(),
            commit_failure: Probability::never(),
            rollback_failure: Probability::never(),
            fault_message: "injected fault".to_string(),
        }
    }
}

#[derive(Debug)]
struct Chaos {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    injected: Mutex<Vec<InjectedFault>>,
}

impl Chaos {
    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f64 = probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        let mut rng = self
            .rng
            .lock()
            .expect("chaos RNG mutex should not be poisoned");

        rng.random_bool(probability)
    }

    fn check<E: From<InjectedFault>>(&self, transition: Transition) -> Result<(), E> {
        if !self.should_inject(self.config.probability(transition)) {
            return Ok(());
        }
        let fault = InjectedFault {
            transition,
            message: self.config.fault_message.clone(),
        };
        debug!(%transition, "Injecting scope fault");
        self.injected
            .lock()
            .expect("chaos log mutex should not be poisoned")
            .push(fault.clone());
        Err(E::from(fault))
    }
}

/// Scope factory that injects faults into the scopes of `inner`.
#[derive(Debug, Clone)]
pub struct ChaosScopes<F> {
    inner: F,
    chaos: Arc<Chaos>,
}

impl<F> ChaosScopes<F> {
    /// Wraps `inner` with the fault rates in `config`.
    pub fn new(inner: F, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            inner,
            chaos: Arc::new(Chaos {
                config,
                rng: Mutex::new(rng),
                injected: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every fault injected so far, in order.
    pub fn injected_faults(&self) -> Vec<InjectedFault> {
        self.chaos
            .injected
            .lock()
            .expect("chaos log mutex should not be poisoned")
            .clone()
    }

    /// The wrapped factory.
    pub const fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F, E> ScopeFactory<E> for ChaosScopes<F>
where
    F: ScopeFactory<E>,
    E: From<InjectedFault> + Send + 'static,
{
    fn create(&self, read_only: bool) -> Box<dyn AttemptScope<E>> {
        Box::new(ChaosScope {
            inner: self.inner.create(read_only),
            chaos: Arc::clone(&self.chaos),
        })
    }
}

impl<F, E> BlockingScopeFactory<E> for ChaosScopes<F>
where
    F: BlockingScopeFactory<E>,
    E: From<InjectedFault> + Send + 'static,
{
    fn create(&self, read_only: bool) -> Box<dyn BlockingAttemptScope<E>> {
        Box::new(ChaosScope {
            inner: self.inner.create(read_only),
            chaos: Arc::clone(&self.chaos),
        })
    }
}

struct ChaosScope<S> {
    inner: S,
    chaos: Arc<Chaos>,
}

#[async_trait]
impl<E> AttemptScope<E> for ChaosScope<Box<dyn AttemptScope<E>>>
where
    E: From<InjectedFault> + Send + 'static,
{
    async fn enter(&mut self) -> Result<(), E> {
        self.chaos.check::<E>(Transition::Enter)?;
        self.inner.enter().await
    }

    async fn commit(&mut self) -> Result<(), E> {
        self.chaos.check::<E>(Transition::Commit)?;
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), E> {
        self.chaos.check::<E>(Transition::Rollback)?;
        self.inner.rollback().await
    }
}

impl<E> BlockingAttemptScope<E> for ChaosScope<Box<dyn BlockingAttemptScope<E>>>
where
    E: From<InjectedFault> + Send + 'static,
{
    fn enter(&mut self) -> Result<(), E> {
        self.chaos.check::<E>(Transition::Enter)?;
        self.inner.enter()
    }

    fn commit(&mut self) -> Result<(), E> {
        self.chaos.check::<E>(Transition::Commit)?;
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), E> {
        self.chaos.check::<E>(Transition::Rollback)?;
        self.inner.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{RecordingScopes, ScopeEventKind};

    #[test]
    fn deterministic_config_sets_seed() {
        let default_is_none = ChaosConfig::default().deterministic_seed.is_none();
        let deterministic_is_some = ChaosConfig::deterministic().deterministic_seed.is_some();

        assert!(default_is_none && deterministic_is_some);
    }

    #[test]
    fn rates_are_clamped() {
        let config = ChaosConfig::default()
            .with_enter_failure(3.0)
            .with_commit_failure(-1.0)
            .with_rollback_failure(f64::NAN);

        assert_eq!(config.enter_failure, Probability::try_new(1.0).unwrap());
        assert_eq!(config.commit_failure, Probability::never());
        assert_eq!(config.rollback_failure, Probability::never());
    }

    #[test]
    fn zero_probability_passes_every_transition_through() {
        let recording = RecordingScopes::new();
        let chaos = ChaosScopes::new(recording.clone(), ChaosConfig::default());

        let mut scope = BlockingScopeFactory::<ErrorInfo>::create(&chaos, false);
        scope.enter().unwrap();
        scope.commit().unwrap();

        assert_eq!(recording.commits(), 1);
        assert!(chaos.injected_faults().is_empty());
    }

    #[test]
    fn certain_rollback_faults_never_reach_the_inner_scope() {
        let recording = RecordingScopes::new();
        let chaos = ChaosScopes::new(
            recording.clone(),
            ChaosConfig::deterministic().with_rollback_failure(1.0),
        );

        let mut scope = BlockingScopeFactory::<ErrorInfo>::create(&chaos, false);
        scope.enter().unwrap();
        let error = scope.rollback().unwrap_err();

        assert_eq!(error.message, "injected fault (injected into rollback)");
        assert_eq!(
            recording.events_for(1),
            vec![ScopeEventKind::Enter { read_only: false }]
        );
        assert_eq!(chaos.injected_faults()[0].transition, Transition::Rollback);
    }

    #[test]
    fn same_seed_injects_the_same_faults() {
        let pattern = |seed: u64| -> Vec<bool> {
            let chaos = ChaosScopes::new(
                RecordingScopes::new(),
                ChaosConfig::deterministic()
                    .with_seed(seed)
                    .with_enter_failure(0.5),
            );
            (0..32)
                .map(|_| {
                    BlockingScopeFactory::<ErrorInfo>::create(&chaos, false)
                        .enter()
                        .is_err()
                })
                .collect()
        };

        assert_eq!(pattern(7), pattern(7));
    }
}
