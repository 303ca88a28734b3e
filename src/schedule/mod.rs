//! Async dependency scheduling for deferred external operations.
//!
//! Deferred operations are tracked in a shared registry, grouped into
//! execution waves by static dependency analysis over their unevaluated
//! defining expressions, and run concurrently under a configurable cap.
//! Waves execute in emission order; operations within one wave carry no
//! ordering guarantee relative to each other.

/// Concurrency-capped wave execution.
pub mod executor;
/// Shared async-operation registry.
pub mod registry;
/// Static dependency discovery and wave construction.
pub mod waves;

pub use executor::{DEFAULT_CONCURRENCY, WaveExecutor, WaveTiming};
pub use registry::{AsyncOperation, ContextSnapshot, OpRegistry, OpStatus};
pub use waves::{AsyncWave, build_execution_waves, collect_dependencies};

use thiserror::Error;

/// Stable identifier of a deferred operation.
pub type OpId = uuid::Uuid;

/// Errors surfaced by the scheduler and registry.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The operation set contains a dependency cycle; no partial wave list
    /// is produced.
    #[error("circular dependency among async operations: {0}")]
    CircularDependency(String),

    /// An operation id was not found in the registry.
    #[error("unknown async operation {0}")]
    UnknownOperation(OpId),

    /// A status update violated the monotonic pending→running→terminal order.
    #[error("operation {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// Operation id.
        id: OpId,
        /// Status the operation currently holds.
        from: OpStatus,
        /// Status the caller attempted to set.
        to: OpStatus,
    },
}

/// Convenience result alias for scheduling operations.
pub type ScheduleResult<T> = std::result::Result<T, ScheduleError>;
