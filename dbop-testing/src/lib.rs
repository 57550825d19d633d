//! Test support for dbop.
//!
//! - [`ScriptedOperation`] replays a fixed sequence of results, one per attempt.
//! - [`RecordingScopes`] is an attempt-scope factory that only records the
//!   transitions the engine drives.
//! - [`ChaosScopes`] wraps any factory and injects enter, commit or rollback
//!   faults at configurable rates, deterministically when seeded.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chaos;
pub mod recording;
pub mod scripted;

pub use chaos::{ChaosConfig, ChaosScopes, InjectedFault, Probability, Transition};
pub use recording::{RecordingScopes, ScopeEvent, ScopeEventKind};
pub use scripted::ScriptedOperation;
