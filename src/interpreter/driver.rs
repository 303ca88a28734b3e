//! Async driving loop.
//!
//! The stepper itself is synchronous; this loop is where the async world
//! plugs in. It steps while the state is running, services blocking external
//! operations one at a time, and hands batches of deferred work to the wave
//! executor whenever the state suspends on an async barrier. A paused state
//! is returned untouched so a debugger can take over.

use std::sync::Arc;

use tracing::debug;

use crate::host::{InterpreterHost, OperationExecutor};
use crate::schedule::executor::WaveExecutor;

use super::ast::Program;
use super::scope;
use super::state::{ExecStatus, RuntimeState};
use super::stepper::{resume_external, step};
use super::value::{ErrorKind, Value};
use super::FatalError;

/// Owns the host collaborators and drives a run to a resting point.
pub struct Driver<H> {
    host: H,
    executor: Arc<dyn OperationExecutor>,
    waves: WaveExecutor,
}

impl<H: InterpreterHost> Driver<H> {
    /// Build a driver with the default wave concurrency.
    pub fn new(host: H, executor: Arc<dyn OperationExecutor>) -> Self {
        let waves = WaveExecutor::new(Arc::clone(&executor));
        Self {
            host,
            executor,
            waves,
        }
    }

    /// Build a driver with an explicit wave concurrency cap.
    pub fn with_concurrency(
        host: H,
        executor: Arc<dyn OperationExecutor>,
        concurrency: usize,
    ) -> Self {
        let waves = WaveExecutor::with_concurrency(Arc::clone(&executor), concurrency);
        Self {
            host,
            executor,
            waves,
        }
    }

    /// Run a program from the start.
    pub async fn run(&mut self, program: Program) -> RuntimeState {
        self.drive(RuntimeState::new(program)).await
    }

    /// Drive a state until it completes, errors, or pauses.
    ///
    /// A blocking external failure comes back as an error-flagged value in
    /// the last-result slot; a scheduling failure (a dependency cycle) is
    /// terminal for the whole run.
    pub async fn drive(&mut self, mut state: RuntimeState) -> RuntimeState {
        loop {
            match state.status {
                ExecStatus::Running => state = step(state, &mut self.host),
                ExecStatus::Paused | ExecStatus::Completed | ExecStatus::Error => return state,
                ExecStatus::AwaitingExternal => {
                    let Some(pending) = state.pending_external.clone() else {
                        let fatal =
                            FatalError::Internal("awaiting external with no pending request".into());
                        state.fatal = Some(fatal.to_string());
                        state.status = ExecStatus::Error;
                        return state;
                    };
                    debug!(loc = %pending.loc, "servicing blocking external operation");
                    let value = match self
                        .executor
                        .execute(&pending.payload, &pending.snapshot)
                        .await
                    {
                        Ok(value) => value,
                        Err(error) => Value::error(
                            ErrorKind::OperationFailed,
                            error.to_string(),
                            Some(pending.loc),
                        ),
                    };
                    resume_external(&mut state, value);
                }
                ExecStatus::AwaitingAsync => {
                    let snapshot = scope::snapshot_visible(&state);
                    if let Err(error) = self.waves.run_pending(&state.registry, &snapshot).await {
                        let fatal = FatalError::from(error);
                        state.fatal = Some(fatal.to_string());
                        state.status = ExecStatus::Error;
                        return state;
                    }
                    state.awaiting.clear();
                    state.status = ExecStatus::Running;
                }
            }
        }
    }
}
