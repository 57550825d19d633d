//! Observation hooks, tracing decorator and metrics for dbop.
//!
//! The engine reports what it does through [`ExecutionObserver`]. Observers
//! only watch: none of their methods can influence retry or outcome
//! decisions. [`Traced`] is the decorator that turns those observations into
//! `tracing` spans and metrics.

pub mod config;
pub mod metrics;
#[cfg(feature = "opentelemetry")]
pub mod opentelemetry;
pub mod tracing;

pub use self::config::{ExporterProtocol, TelemetryConfig};
pub use self::metrics::{InMemoryRecorder, MetricsRecorder, MetricsSnapshot, NoopRecorder};
pub use self::tracing::Traced;

use ::tracing::Span;

use crate::attempt::{Attempt, OperationContext, OperationReport};

/// Receives the lifecycle of every `execute` call.
///
/// Every method has a no-op default, so implementations override only what
/// they need.
pub trait ExecutionObserver: Send + Sync {
    /// A call is about to make its first attempt.
    fn on_operation_start(&self, context: &OperationContext) {
        let _ = context;
    }

    /// Attempt `attempt` (1-based) is about to enter its scope.
    fn on_attempt_start(&self, context: &OperationContext, attempt: u32) {
        let _ = (context, attempt);
    }

    /// Attempt `attempt.index` finished and its scope has exited.
    ///
    /// Called inside the span returned by [`attempt_span`](Self::attempt_span).
    fn on_attempt_end(&self, context: &OperationContext, attempt: &Attempt) {
        let _ = (context, attempt);
    }

    /// The call reached its terminal state.
    fn on_operation_end(&self, context: &OperationContext, report: &OperationReport) {
        let _ = (context, report);
    }

    /// Span the attempt should run in. Return [`Span::none`] to opt out.
    fn attempt_span(&self, context: &OperationContext, attempt: u32) -> Span {
        let _ = (context, attempt);
        Span::none()
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}
