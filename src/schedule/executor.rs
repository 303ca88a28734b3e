//! Concurrent execution of one wave at a time.
//!
//! Every operation in a wave is spawned as its own task; a FIFO-fair
//! semaphore caps how many actually run at once. Failures are strictly per
//! operation: an executor error, a payload that cannot be resolved, and a
//! panic inside a task all mark that one operation failed and leave the
//! rest of the wave running.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::host::OperationExecutor;
use crate::interpreter::ast::Expr;
use crate::interpreter::eval;
use crate::interpreter::value::{ErrorInfo, ErrorKind, Provenance};

use super::registry::{ContextSnapshot, OpRegistry};
use super::waves::{build_execution_waves, AsyncWave};
use super::{OpId, ScheduleError, ScheduleResult};

/// Default cap on concurrently running operations within a wave.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Timestamps bracketing one executed wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveTiming {
    /// When the wave's first operation was eligible to start.
    pub started_at: DateTime<Utc>,
    /// When the wave's last operation resolved.
    pub finished_at: DateTime<Utc>,
}

/// Runs waves of deferred operations against a shared registry.
pub struct WaveExecutor {
    executor: Arc<dyn OperationExecutor>,
    concurrency: usize,
}

impl WaveExecutor {
    /// Build an executor with the default concurrency cap.
    pub fn new(executor: Arc<dyn OperationExecutor>) -> Self {
        Self::with_concurrency(executor, DEFAULT_CONCURRENCY)
    }

    /// Build an executor with an explicit concurrency cap (minimum one).
    pub fn with_concurrency(executor: Arc<dyn OperationExecutor>, concurrency: usize) -> Self {
        Self {
            executor,
            concurrency: concurrency.max(1),
        }
    }

    /// Schedule and run every pending operation, wave by wave.
    ///
    /// Later waves see the results of earlier ones through the registry:
    /// each operation's snapshot is refreshed with its resolved dependency
    /// values just before it starts.
    pub async fn run_pending(
        &self,
        registry: &OpRegistry,
        snapshot: &ContextSnapshot,
    ) -> ScheduleResult<Vec<WaveTiming>> {
        let waves = build_execution_waves(registry)?;
        let mut timings = Vec::with_capacity(waves.len());
        for (index, wave) in waves.iter().enumerate() {
            debug!(wave = index, operations = wave.len(), "running wave");
            timings.push(self.run_wave(registry, wave, snapshot).await?);
        }
        Ok(timings)
    }

    /// Run one wave to completion, returning its bracketing timestamps.
    pub async fn run_wave(
        &self,
        registry: &OpRegistry,
        wave: &AsyncWave,
        snapshot: &ContextSnapshot,
    ) -> ScheduleResult<WaveTiming> {
        let started_at = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(wave.len());

        for &id in &wave.operations {
            let semaphore = Arc::clone(&semaphore);
            let registry = registry.clone();
            let executor = Arc::clone(&self.executor);
            let base = snapshot.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ScheduleError::UnknownOperation(id))?;
                run_operation(&registry, executor.as_ref(), id, base).await
            });
            handles.push((id, handle));
        }

        for (id, handle) in handles {
            match handle.await {
                Ok(result) => result?,
                Err(join_error) => {
                    warn!(operation = %id, %join_error, "operation task aborted");
                    registry.fail(
                        id,
                        ErrorInfo::new(
                            ErrorKind::OperationFailed,
                            format!("operation panicked: {join_error}"),
                            None,
                        ),
                    )?;
                }
            }
        }
        Ok(WaveTiming {
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Run a single operation: refresh its snapshot, resolve its payload, and
/// record the outcome in the registry.
async fn run_operation(
    registry: &OpRegistry,
    executor: &dyn OperationExecutor,
    id: OpId,
    base: ContextSnapshot,
) -> ScheduleResult<()> {
    let operation = registry
        .get(id)
        .ok_or(ScheduleError::UnknownOperation(id))?;

    // Dependencies produced by earlier waves override the snapshot taken
    // when the run suspended.
    let mut context = operation.context.clone().unwrap_or(base);
    for dep in &operation.dependencies {
        if let Some(producer) = registry.producer_of(dep) {
            if let Some(value) = registry.resolved_value(producer) {
                context.variables.insert(dep.clone(), value);
            }
        }
    }
    registry.attach_context(id, context.clone());
    registry.mark_running(id)?;

    let Expr::External(external) = &operation.expr else {
        return registry.fail(
            id,
            ErrorInfo::new(
                ErrorKind::OperationFailed,
                "deferred operation is not an external expression",
                None,
            ),
        );
    };

    let payload = match eval::resolve_operation_payload(external, &context) {
        Ok(payload) => payload,
        Err(fatal) => {
            return registry.fail(
                id,
                ErrorInfo::new(ErrorKind::OperationFailed, fatal.to_string(), None),
            );
        }
    };

    match executor.execute(&payload, &context).await {
        Ok(mut value) => {
            value.provenance = Provenance::External;
            registry.complete(id, value)
        }
        Err(error) => {
            warn!(operation = %id, %error, "operation failed");
            registry.fail(
                id,
                ErrorInfo::new(ErrorKind::OperationFailed, error.to_string(), None),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::OperationPayload;
    use crate::interpreter::ast::{ExternalExpr, TemplatePart};
    use crate::interpreter::value::Value;
    use crate::schedule::registry::OpStatus;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::collections::BTreeSet;

    /// Echoes model prompts back, fails prompts containing "fail", panics
    /// on prompts containing "panic".
    struct EchoExecutor;

    impl OperationExecutor for EchoExecutor {
        fn execute<'a>(
            &'a self,
            payload: &'a OperationPayload,
            _context: &'a ContextSnapshot,
        ) -> BoxFuture<'a, anyhow::Result<Value>> {
            async move {
                match payload {
                    OperationPayload::ModelCall { prompt, .. } => {
                        if prompt.contains("panic") {
                            panic!("requested panic");
                        }
                        if prompt.contains("fail") {
                            anyhow::bail!("model refused: {prompt}");
                        }
                        Ok(Value::string(format!("echo: {prompt}")))
                    }
                    other => anyhow::bail!("unsupported payload {other:?}"),
                }
            }
            .boxed()
        }
    }

    fn model_op(registry: &OpRegistry, var: &str, prompt_parts: Vec<TemplatePart>, deps: &[&str]) -> OpId {
        registry.register(
            Some(var.to_string()),
            Expr::External(ExternalExpr::ModelCall {
                prompt: Box::new(Expr::Template(prompt_parts)),
                model: None,
                context: vec![],
            }),
            deps.iter().map(|d| d.to_string()).collect::<BTreeSet<_>>(),
        )
    }

    fn text(s: &str) -> TemplatePart {
        TemplatePart::Text(s.to_string())
    }

    #[tokio::test]
    async fn completed_operations_carry_external_provenance_and_timestamps() {
        let registry = OpRegistry::new();
        let id = model_op(&registry, "a", vec![text("hello")], &[]);

        let executor = WaveExecutor::new(Arc::new(EchoExecutor));
        let timings = executor
            .run_pending(&registry, &ContextSnapshot::default())
            .await
            .unwrap();
        assert_eq!(timings.len(), 1);

        let op = registry.get(id).unwrap();
        assert_eq!(op.status, OpStatus::Completed);
        let started = op.started_at.unwrap();
        let finished = op.finished_at.unwrap();
        assert!(finished >= started);
        // The wave's own timestamps bracket its operations.
        assert!(timings[0].started_at <= started);
        assert!(timings[0].finished_at >= finished);
        let value = op.result.unwrap();
        assert_eq!(value.as_str(), Some("echo: hello"));
        assert_eq!(value.provenance, Provenance::External);
    }

    #[tokio::test]
    async fn later_waves_see_earlier_results() {
        let registry = OpRegistry::new();
        model_op(&registry, "first", vec![text("one")], &[]);
        let second = model_op(
            &registry,
            "second",
            vec![text("based on "), TemplatePart::Expand("first".into())],
            &["first"],
        );

        let executor = WaveExecutor::new(Arc::new(EchoExecutor));
        executor
            .run_pending(&registry, &ContextSnapshot::default())
            .await
            .unwrap();

        let op = registry.get(second).unwrap();
        assert_eq!(
            op.result.unwrap().as_str(),
            Some("echo: based on echo: one")
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_poison_the_wave() {
        let registry = OpRegistry::new();
        let bad = model_op(&registry, "bad", vec![text("please fail")], &[]);
        let good = model_op(&registry, "good", vec![text("fine")], &[]);

        let executor = WaveExecutor::new(Arc::new(EchoExecutor));
        executor
            .run_pending(&registry, &ContextSnapshot::default())
            .await
            .unwrap();

        assert_eq!(registry.status(bad), Some(OpStatus::Failed));
        assert_eq!(registry.status(good), Some(OpStatus::Completed));
        let error = registry.get(bad).unwrap().error.unwrap();
        assert_eq!(error.kind, ErrorKind::OperationFailed);
        assert!(error.message.contains("model refused"));
    }

    #[tokio::test]
    async fn a_panicking_operation_becomes_a_structured_failure() {
        let registry = OpRegistry::new();
        let id = model_op(&registry, "p", vec![text("panic now")], &[]);

        let executor = WaveExecutor::new(Arc::new(EchoExecutor));
        executor
            .run_pending(&registry, &ContextSnapshot::default())
            .await
            .unwrap();

        assert_eq!(registry.status(id), Some(OpStatus::Failed));
        let error = registry.get(id).unwrap().error.unwrap();
        assert!(error.message.contains("panicked"));
    }

    #[tokio::test]
    async fn error_flagged_inputs_fail_their_operation() {
        let registry = OpRegistry::new();
        let id = model_op(
            &registry,
            "tainted",
            vec![TemplatePart::Expand("bad".into())],
            &[],
        );
        let mut snapshot = ContextSnapshot::default();
        snapshot.variables.insert(
            "bad".into(),
            Value::error(ErrorKind::MissingField, "object has no field 'x'", None),
        );

        let executor = WaveExecutor::new(Arc::new(EchoExecutor));
        executor.run_pending(&registry, &snapshot).await.unwrap();

        // The error never reaches the backend as a rendered prompt.
        assert_eq!(registry.status(id), Some(OpStatus::Failed));
        let error = registry.get(id).unwrap().error.unwrap();
        assert!(error.message.contains("no field"));
    }

    #[tokio::test]
    async fn unresolvable_payloads_fail_their_operation_only() {
        let registry = OpRegistry::new();
        // Expansion of a variable that is in no snapshot.
        let id = model_op(
            &registry,
            "broken",
            vec![TemplatePart::Expand("nowhere".into())],
            &[],
        );

        let executor = WaveExecutor::new(Arc::new(EchoExecutor));
        executor
            .run_pending(&registry, &ContextSnapshot::default())
            .await
            .unwrap();

        assert_eq!(registry.status(id), Some(OpStatus::Failed));
        let error = registry.get(id).unwrap().error.unwrap();
        assert!(error.message.contains("nowhere"));
    }
}
