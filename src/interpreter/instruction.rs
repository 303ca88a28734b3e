//! The closed vocabulary of suspendable work units.
//!
//! Every control-flow and data operation the interpreter performs is one of
//! these instructions. They are produced and consumed by the stepper, never
//! persisted beyond a single execution, and each carries the source location
//! of the statement it was lowered from so terminal errors can point at the
//! failing line.

use serde::{Deserialize, Serialize};

use crate::schedule::OpId;

use super::ast::{BinaryOp, Expr, Pattern, SourceLoc, Stmt, TemplatePart, UnaryOp};
use super::value::Value;

/// One instruction on the instruction stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// What to do.
    pub kind: InstructionKind,
    /// Where the originating statement sits in source text.
    pub loc: SourceLoc,
}

impl Instruction {
    /// Construct an instruction at the given location.
    pub fn new(kind: InstructionKind, loc: SourceLoc) -> Self {
        Self { kind, loc }
    }
}

/// Shape of a blocking external invocation after operand evaluation.
///
/// Tells the invoke handler how many evaluated operands to pop from the
/// value stack and how to assemble them into an operation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExternalShape {
    /// Model call: prompt (and optional model selector, then context values)
    /// already evaluated onto the value stack.
    ModelCall {
        /// Whether a model selector was evaluated.
        has_model: bool,
        /// Number of evaluated context values.
        context_len: usize,
    },
    /// Sandboxed code block; bindings are resolved from scope at invoke time.
    CodeBlock {
        /// Source text of the block.
        body: String,
        /// Scope variables to bind into the sandbox.
        params: Vec<String>,
    },
    /// Tool invocation with evaluated arguments on the value stack.
    ToolCall {
        /// Tool identifier.
        name: String,
        /// Number of evaluated arguments.
        argc: usize,
    },
}

/// The closed instruction set. No open extensibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstructionKind {
    /// Evaluate an expression into the last-result slot.
    EvalExpr(Expr),
    /// Execute one statement (lowers into further instructions).
    ExecStmt(Stmt),
    /// Bind the last result according to a declaration pattern.
    Declare {
        /// Binding pattern.
        pattern: Pattern,
        /// Declared type tag for the validator.
        declared_type: Option<String>,
        /// Whether the binding is constant.
        constant: bool,
    },
    /// Assign the last result to an existing variable.
    Assign {
        /// Target variable name.
        target: String,
    },
    /// Push the last result onto the scratch value stack.
    PushValue,
    /// Collect the top `len` scratch values into an array.
    BuildArray {
        /// Number of evaluated elements.
        len: usize,
    },
    /// Collect scratch values into an object under the given keys.
    BuildObject {
        /// Keys in evaluation order.
        keys: Vec<String>,
    },
    /// Apply a binary operator to the top two scratch values.
    ApplyBinary {
        /// Operator.
        op: BinaryOp,
    },
    /// Apply a unary operator to the top scratch value.
    ApplyUnary {
        /// Operator.
        op: UnaryOp,
    },
    /// Read a property off the top scratch value.
    AccessMember {
        /// Property name.
        property: String,
    },
    /// Index the second scratch value by the top scratch value.
    AccessIndex,
    /// Slice the receiver using optional evaluated bounds.
    AccessSlice {
        /// Whether a start bound was evaluated.
        has_start: bool,
        /// Whether an end bound was evaluated.
        has_end: bool,
    },
    /// Render a string template, expanding or preserving placeholders.
    Interpolate {
        /// Template pieces.
        parts: Vec<TemplatePart>,
    },
    /// Choose a branch based on the truthiness of the last result.
    Branch {
        /// Statements for the truthy case.
        consequent: Vec<Stmt>,
        /// Statements for the falsy case.
        alternate: Option<Vec<Stmt>>,
    },
    /// Self-re-pushing while iteration.
    IterateWhile {
        /// Loop condition.
        condition: Expr,
        /// Loop body.
        body: Vec<Stmt>,
        /// Whether the condition result is ready in the last-result slot.
        checked: bool,
    },
    /// Self-re-pushing for-in iteration.
    IterateForIn {
        /// Loop variable.
        variable: String,
        /// Materialized items; `None` until the iterable has been evaluated.
        items: Option<Vec<Value>>,
        /// Next index to visit.
        index: usize,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// Enter a new block scope.
    EnterBlock {
        /// Frame name used for diagnostics and history.
        name: String,
    },
    /// Leave the current block scope, awaiting pending work first.
    ExitBlock,
    /// Call a function with evaluated arguments on the value stack.
    CallFunction {
        /// Function name, possibly module-qualified.
        name: String,
        /// Number of evaluated arguments.
        argc: usize,
    },
    /// Return from the enclosing function.
    Return {
        /// Whether a return value was evaluated into the last-result slot.
        has_value: bool,
    },
    /// Marker closing a function body; a fall-through return.
    ExitFunction,
    /// Invoke an external operation, suspending the interpreter.
    InvokeExternal {
        /// Operand layout of the invocation.
        shape: ExternalShape,
    },
    /// Barrier: suspend until the named operations resolve.
    AwaitOps {
        /// Operation ids that must resolve before proceeding.
        ids: Vec<OpId>,
    },
    /// Load a module through the module provider and bind its alias.
    ImportModule {
        /// Module path handed to the provider.
        path: String,
        /// Alias the module is referenced by.
        alias: String,
    },
}

impl InstructionKind {
    /// Stable name of the instruction variant, used by debugger predicates.
    pub fn name(&self) -> &'static str {
        match self {
            InstructionKind::EvalExpr(_) => "eval-expr",
            InstructionKind::ExecStmt(_) => "exec-stmt",
            InstructionKind::Declare { .. } => "declare",
            InstructionKind::Assign { .. } => "assign",
            InstructionKind::PushValue => "push-value",
            InstructionKind::BuildArray { .. } => "build-array",
            InstructionKind::BuildObject { .. } => "build-object",
            InstructionKind::ApplyBinary { .. } => "apply-binary",
            InstructionKind::ApplyUnary { .. } => "apply-unary",
            InstructionKind::AccessMember { .. } => "access-member",
            InstructionKind::AccessIndex => "access-index",
            InstructionKind::AccessSlice { .. } => "access-slice",
            InstructionKind::Interpolate { .. } => "interpolate",
            InstructionKind::Branch { .. } => "branch",
            InstructionKind::IterateWhile { .. } => "iterate-while",
            InstructionKind::IterateForIn { .. } => "iterate-for-in",
            InstructionKind::EnterBlock { .. } => "enter-block",
            InstructionKind::ExitBlock => "exit-block",
            InstructionKind::CallFunction { .. } => "call-function",
            InstructionKind::Return { .. } => "return",
            InstructionKind::ExitFunction => "exit-function",
            InstructionKind::InvokeExternal { .. } => "invoke-external",
            InstructionKind::AwaitOps { .. } => "await-ops",
            InstructionKind::ImportModule { .. } => "import-module",
        }
    }
}
