//! Collaborator contracts consumed by the execution core.
//!
//! The core stays decoupled from the implementations behind these traits:
//! the backends that actually run model calls / sandboxed code / tools, the
//! module loader, and the structural type-checker. Tests drive the core with
//! small hand-rolled mocks of these traits.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::interpreter::ast::FunctionDef;
use crate::interpreter::value::{ErrorInfo, Value};
use crate::schedule::ContextSnapshot;

/// Fully resolved payload handed to the operation executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationPayload {
    /// Model call with a rendered prompt.
    ModelCall {
        /// Prompt text; deferred placeholders remain verbatim.
        prompt: String,
        /// Optional model selector.
        model: Option<String>,
        /// Context values passed alongside the prompt.
        context: Vec<Value>,
    },
    /// Sandboxed code evaluation with bound parameter values.
    CodeEval {
        /// Source text of the block.
        body: String,
        /// Parameter bindings resolved from scope.
        bindings: BTreeMap<String, Value>,
    },
    /// Tool or function invocation with resolved arguments.
    Invocation {
        /// Invocation target name.
        name: String,
        /// Resolved argument values.
        args: Vec<Value>,
    },
}

/// Executes external operations on behalf of the core.
///
/// Invoked by the wave executor for deferred operations and by the driving
/// loop for blocking ones. A returned error (or a panic inside the future)
/// becomes a structured failure for that operation only; retry policy and
/// timeouts live entirely behind this trait.
pub trait OperationExecutor: Send + Sync {
    /// Run one operation against the given context snapshot.
    fn execute<'a>(
        &'a self,
        payload: &'a OperationPayload,
        context: &'a ContextSnapshot,
    ) -> BoxFuture<'a, anyhow::Result<Value>>;
}

/// An imported module's isolated scope.
#[derive(Debug, Clone, Default)]
pub struct ModuleScope {
    /// Module-global variable bindings.
    pub globals: BTreeMap<String, Value>,
    /// Functions exported by the module.
    pub functions: BTreeMap<String, FunctionDef>,
}

/// Supplies module scopes; the interpreter never parses or loads modules.
pub trait ModuleProvider {
    /// Resolve a module path into its isolated globals and function table.
    fn load_module(&mut self, path: &str) -> anyhow::Result<ModuleScope>;
}

/// Result of a successful type validation.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    /// Possibly-adjusted value.
    pub value: Value,
    /// Type the validator inferred, when it did.
    pub inferred_type: Option<String>,
}

/// Structural type validation, called on every declaration, assignment,
/// parameter bind, and return. The core defines only this call shape, not
/// the checking rules.
pub trait TypeValidator {
    /// Validate a value against an optional declared type.
    fn validate(
        &mut self,
        value: Value,
        declared: Option<&str>,
        name: &str,
    ) -> Result<TypedValue, ErrorInfo>;
}

/// Everything the stepper needs from the embedding host.
pub trait InterpreterHost: ModuleProvider + TypeValidator {}

impl<T: ModuleProvider + TypeValidator + ?Sized> InterpreterHost for T {}
