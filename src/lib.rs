//! Waverun – a continuation-style execution core for an AI-scripting language
//!
//! This crate implements the language-independent execution machinery:
//! - An explicit-stack interpreter stepped one instruction at a time, so any
//!   instruction boundary is a suspension and inspection point
//! - A unified value model where expected runtime conditions travel as
//!   error-flagged values and only structural faults terminate a run
//! - Async scheduling of deferred external operations into dependency waves,
//!   executed concurrently under a configurable cap
//! - Host traits for the collaborators the core deliberately excludes:
//!   operation execution, module loading, and type validation

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Collaborator traits the embedding host implements.
pub mod host;
/// The continuation-style interpreter core.
pub mod interpreter;
/// Registry, wave scheduling, and concurrent execution of deferred work.
pub mod schedule;

// Re-export key types for convenience
pub use host::{InterpreterHost, ModuleProvider, OperationExecutor, OperationPayload, TypeValidator};
pub use interpreter::{Driver, ExecStatus, FatalError, Program, RuntimeState, Value, step};
pub use schedule::{OpRegistry, OpStatus, WaveExecutor};

/// Current version of the Waverun execution core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a `RUST_LOG`-driven tracing subscriber.
///
/// For embedders and tests; does nothing if a subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
