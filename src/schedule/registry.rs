//! Shared registry of deferred operations.
//!
//! The registry is the one deliberate exception to the interpreter's
//! value-transition style: operations are referenced by id from frames, the
//! scheduler, and the wave executor, and the executor updates them from a
//! different concurrency domain. The arena is therefore owned behind an
//! `Arc<RwLock<…>>` and mutated in place; everything else in the runtime
//! state moves by value through the stepper.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::interpreter::ast::Expr;
use crate::interpreter::value::{ErrorInfo, ErrorKind, Value};

use super::{OpId, ScheduleError, ScheduleResult};

/// Lifecycle status of a deferred operation.
///
/// Transitions are monotonic: `Pending → Running → Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    /// Registered but not yet started.
    Pending,
    /// Currently executing inside a wave.
    Running,
    /// Resolved with a value.
    Completed,
    /// Resolved with a structured error.
    Failed,
}

impl OpStatus {
    /// Whether the status is terminal.
    pub fn is_resolved(self) -> bool {
        matches!(self, OpStatus::Completed | OpStatus::Failed)
    }

    fn can_advance_to(self, next: OpStatus) -> bool {
        matches!(
            (self, next),
            (OpStatus::Pending, OpStatus::Running)
                | (OpStatus::Running, OpStatus::Completed)
                | (OpStatus::Running, OpStatus::Failed)
        )
    }
}

/// Snapshot of the variables visible when a wave was built.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Visible variable bindings by name.
    pub variables: BTreeMap<String, Value>,
}

impl ContextSnapshot {
    /// Look up a variable in the snapshot.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

/// One deferred unit of external work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncOperation {
    /// Stable identifier.
    pub id: OpId,
    /// Variable the result will bind, when the declaration named one.
    pub variable: Option<String>,
    /// Lifecycle status.
    pub status: OpStatus,
    /// Variable names referenced by the defining expression.
    pub dependencies: BTreeSet<String>,
    /// The unevaluated defining expression.
    pub expr: Expr,
    /// Context snapshot attached when the owning wave was built.
    pub context: Option<ContextSnapshot>,
    /// Resolved value, once completed.
    pub result: Option<Value>,
    /// Structured error, once failed.
    pub error: Option<ErrorInfo>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RegistryInner {
    ops: HashMap<OpId, AsyncOperation>,
    pending: BTreeSet<OpId>,
    by_variable: HashMap<String, OpId>,
}

/// Cloneable handle to the shared operation arena.
#[derive(Clone, Default)]
pub struct OpRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl std::fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("OpRegistry")
            .field("operations", &inner.ops.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}

impl OpRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deferred operation and return its id.
    pub fn register(
        &self,
        variable: Option<String>,
        expr: Expr,
        dependencies: BTreeSet<String>,
    ) -> OpId {
        let id = uuid::Uuid::new_v4();
        let mut inner = self.inner.write();
        if let Some(name) = &variable {
            inner.by_variable.insert(name.clone(), id);
        }
        inner.pending.insert(id);
        inner.ops.insert(
            id,
            AsyncOperation {
                id,
                variable,
                status: OpStatus::Pending,
                dependencies,
                expr,
                context: None,
                result: None,
                error: None,
                started_at: None,
                finished_at: None,
            },
        );
        tracing::debug!(operation = %id, "registered deferred operation");
        id
    }

    /// Current status of an operation.
    pub fn status(&self, id: OpId) -> Option<OpStatus> {
        self.inner.read().ops.get(&id).map(|op| op.status)
    }

    /// Clone the full record of an operation.
    pub fn get(&self, id: OpId) -> Option<AsyncOperation> {
        self.inner.read().ops.get(&id).cloned()
    }

    /// Ids of operations that have not started yet, in registration order
    /// of their ids' ordering (deterministic for scheduling).
    pub fn pending_ids(&self) -> Vec<OpId> {
        self.inner.read().pending.iter().copied().collect()
    }

    /// Operation currently registered as producing the named variable.
    pub fn producer_of(&self, variable: &str) -> Option<OpId> {
        self.inner.read().by_variable.get(variable).copied()
    }

    /// Whether an operation has reached a terminal status.
    pub fn is_resolved(&self, id: OpId) -> bool {
        self.status(id).map(OpStatus::is_resolved).unwrap_or(false)
    }

    /// Attach the context snapshot captured at wave build time.
    pub fn attach_context(&self, id: OpId, context: ContextSnapshot) {
        if let Some(op) = self.inner.write().ops.get_mut(&id) {
            op.context = Some(context);
        }
    }

    /// Mark an operation running, stamping its start time.
    pub fn mark_running(&self, id: OpId) -> ScheduleResult<()> {
        self.advance(id, OpStatus::Running, |op| {
            op.started_at = Some(Utc::now());
        })
    }

    /// Mark an operation completed with its produced value.
    pub fn complete(&self, id: OpId, value: Value) -> ScheduleResult<()> {
        self.advance(id, OpStatus::Completed, |op| {
            op.finished_at = Some(Utc::now());
            op.result = Some(value);
        })
    }

    /// Mark an operation failed with structured error details.
    pub fn fail(&self, id: OpId, error: ErrorInfo) -> ScheduleResult<()> {
        self.advance(id, OpStatus::Failed, |op| {
            op.finished_at = Some(Utc::now());
            op.error = Some(error);
        })
    }

    /// Value to substitute for a resolved operation: the produced value on
    /// completion, an error-flagged value on failure, `None` while unresolved.
    pub fn resolved_value(&self, id: OpId) -> Option<Value> {
        let inner = self.inner.read();
        let op = inner.ops.get(&id)?;
        match op.status {
            OpStatus::Completed => op.result.clone(),
            OpStatus::Failed => {
                let info = op.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(ErrorKind::OperationFailed, "operation failed", None)
                });
                Some(Value::from_error(info))
            }
            _ => None,
        }
    }

    fn advance(
        &self,
        id: OpId,
        to: OpStatus,
        apply: impl FnOnce(&mut AsyncOperation),
    ) -> ScheduleResult<()> {
        let mut inner = self.inner.write();
        let op = inner
            .ops
            .get_mut(&id)
            .ok_or(ScheduleError::UnknownOperation(id))?;
        let from = op.status;
        if !from.can_advance_to(to) {
            return Err(ScheduleError::InvalidTransition { id, from, to });
        }
        op.status = to;
        apply(op);
        if to != OpStatus::Pending {
            inner.pending.remove(&id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::ast::Expr;

    fn register_simple(registry: &OpRegistry, var: &str) -> OpId {
        registry.register(
            Some(var.to_string()),
            Expr::Identifier("ignored".into()),
            BTreeSet::new(),
        )
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let registry = OpRegistry::new();
        let id = register_simple(&registry, "a");

        assert_eq!(registry.status(id), Some(OpStatus::Pending));
        registry.mark_running(id).unwrap();
        registry.complete(id, Value::number(1.0)).unwrap();
        assert_eq!(registry.status(id), Some(OpStatus::Completed));

        // No transition out of a terminal status.
        let err = registry.mark_running(id).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidTransition { .. }));
        let err = registry
            .fail(id, ErrorInfo::new(ErrorKind::OperationFailed, "late", None))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidTransition { .. }));
    }

    #[test]
    fn completing_without_running_is_rejected() {
        let registry = OpRegistry::new();
        let id = register_simple(&registry, "a");
        let err = registry.complete(id, Value::null()).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidTransition { .. }));
    }

    #[test]
    fn resolved_value_reports_failures_as_error_values() {
        let registry = OpRegistry::new();
        let id = register_simple(&registry, "a");
        registry.mark_running(id).unwrap();
        registry
            .fail(id, ErrorInfo::new(ErrorKind::OperationFailed, "boom", None))
            .unwrap();

        let value = registry.resolved_value(id).unwrap();
        assert!(value.is_error());
        assert_eq!(value.error.unwrap().message, "boom");
    }

    #[test]
    fn pending_set_shrinks_as_operations_start() {
        let registry = OpRegistry::new();
        let a = register_simple(&registry, "a");
        let b = register_simple(&registry, "b");
        assert_eq!(registry.pending_ids().len(), 2);

        registry.mark_running(a).unwrap();
        assert_eq!(registry.pending_ids(), vec![b]);
        assert_eq!(registry.producer_of("b"), Some(b));
    }
}
