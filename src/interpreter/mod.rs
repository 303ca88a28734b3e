//! Continuation-style interpreter core.
//!
//! The call/control stack is explicit, inspectable data: an instruction
//! stack plus a frame stack, stepped one instruction at a time. Suspension
//! is "stop popping and return the current state"; resumption is "keep
//! popping where we left off". That is what lets a debugger observe and
//! rewind execution between any two units of work without host coroutines.

/// Syntax-tree input types.
pub mod ast;
/// Async driving loop tying stepper, scheduler, and wave executor together.
pub mod driver;
/// Operator and access semantics with value-level error propagation.
pub mod eval;
/// The closed instruction vocabulary.
pub mod instruction;
/// Frame-chain variable lookup and module isolation.
pub mod scope;
/// Runtime state threaded through every step.
pub mod state;
/// The single-step execution engine and debugger entry points.
pub mod stepper;
/// The unified value/error wrapper.
pub mod value;

pub use ast::{Expr, FunctionDef, Program, SourceLoc, Stmt, StmtKind};
pub use driver::Driver;
pub use instruction::{Instruction, InstructionKind};
pub use state::{ExecStatus, RuntimeState, StackFrame};
pub use stepper::{
    next_instruction, resume_external, run_until_pause, step, step_n, step_until, step_until_op,
};
pub use value::{ErrorInfo, ErrorKind, Payload, Provenance, Value};

use thiserror::Error;

/// Structural/fatal errors: genuine interpreter faults and static-shape
/// violations. Raised at the point of detection, caught only at the stepper
/// boundary, and converted into a terminal error status. These always end
/// the run; expected runtime conditions travel as error-flagged [`Value`]s
/// instead and never appear here.
#[derive(Debug, Error)]
pub enum FatalError {
    /// Lookup walked the whole scope chain without finding the name.
    #[error("reference to undeclared variable '{0}'")]
    UndeclaredVariable(String),

    /// Assignment targeted a constant binding.
    #[error("cannot assign to constant '{0}'")]
    AssignToConstant(String),

    /// Integer index outside the collection bounds.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index (after negative-index resolution).
        index: i64,
        /// Length of the indexed collection.
        len: usize,
    },

    /// Call referenced a function that does not exist.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Call supplied the wrong number of arguments.
    #[error("function '{name}' expects {expected} arguments, received {received}")]
    ArityMismatch {
        /// Function name.
        name: String,
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        received: usize,
    },

    /// An external operation's input resolved to an error-flagged value
    /// outside the stepper, where it can no longer flow onward as data.
    #[error("operation input carried an error: {0}")]
    ErrorInput(String),

    /// Operator applied to payload categories it does not support.
    #[error("unsupported operand types for '{op}': {left} and {right}")]
    OperandTypes {
        /// Operator symbol.
        op: &'static str,
        /// Left operand category.
        left: &'static str,
        /// Right operand category.
        right: &'static str,
    },

    /// Unary operator applied to a payload category it does not support.
    #[error("unsupported operand type for unary '{op}': {operand}")]
    UnaryOperand {
        /// Operator symbol.
        op: &'static str,
        /// Operand category.
        operand: &'static str,
    },

    /// For-in applied to a non-array value.
    #[error("value of type {0} is not iterable")]
    NotIterable(&'static str),

    /// A module-qualified reference used an alias that was never imported.
    #[error("module '{0}' is not loaded")]
    UnknownModule(String),

    /// The module provider failed to resolve a path.
    #[error("failed to load module '{path}': {message}")]
    ModuleLoad {
        /// Requested module path.
        path: String,
        /// Provider error message.
        message: String,
    },

    /// An async declaration's initializer is not an operation.
    #[error("async declaration requires a model, code, or call operation")]
    InvalidAsyncInit,

    /// A deferred expression used a construct that cannot be resolved
    /// outside the stepper (e.g. a user function call nested in data).
    #[error("unsupported construct in deferred operation context: {0}")]
    UnsupportedDeferred(&'static str),

    /// Scheduling failed (circular dependency, unknown operation).
    #[error(transparent)]
    Schedule(#[from] crate::schedule::ScheduleError),

    /// An internal invariant was violated; always a bug in the core.
    #[error("interpreter invariant violated: {0}")]
    Internal(String),
}

/// Convenience result alias for interpreter operations.
pub type Result<T> = std::result::Result<T, FatalError>;
