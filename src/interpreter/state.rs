//! Runtime state threaded through every step.
//!
//! `RuntimeState` is exclusively owned by the driving loop between `step`
//! calls; handlers take it by value and return the successor. The async
//! operation registry inside it is the sole shared-mutation exception, a
//! cloneable arena handle updated in place by the wave executor.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::host::{ModuleScope, OperationPayload};
use crate::schedule::{ContextSnapshot, OpId, OpRegistry};

use super::ast::{FunctionDef, Program, SourceLoc, Stmt, StmtKind};
use super::instruction::{Instruction, InstructionKind};
use super::value::Value;
use super::{FatalError, Result};

/// Execution status of the run. Exactly one is active; when the status is
/// anything but `Running`, the driving loop must not call the stepper until
/// an external event resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStatus {
    /// Ready for the next step.
    Running,
    /// Suspended by a debugger; resumable at any time.
    Paused,
    /// Blocked on a single external operation.
    AwaitingExternal,
    /// Blocked on deferred async operations.
    AwaitingAsync,
    /// The instruction stack drained.
    Completed,
    /// A fatal error ended the run.
    Error,
}

/// What kind of scope a frame represents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameKind {
    /// The top-level program scope.
    Script,
    /// An if/while/explicit block scope.
    Block,
    /// A loop-iteration scope.
    Loop,
    /// A function activation.
    Function {
        /// Declared return type validated on return.
        return_type: Option<String>,
    },
}

/// One entry in a frame's execution history, kept for building external
/// context later (e.g. transcripts shown to a model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameEntry {
    /// A variable was bound or reassigned.
    Assignment {
        /// Variable name.
        name: String,
        /// Bound value.
        value: Value,
    },
    /// An external operation was requested from this scope.
    ExternalCall {
        /// Short description of the operation.
        description: String,
    },
    /// A child scope was entered.
    ScopeMarker {
        /// Name of the entered scope.
        label: String,
    },
}

/// A lexical scope on the call stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Diagnostic name of the scope.
    pub name: String,
    /// Variable bindings local to the frame.
    pub vars: BTreeMap<String, Value>,
    /// Index of the lexical parent frame, if any.
    pub parent: Option<usize>,
    /// What kind of scope this is.
    pub kind: FrameKind,
    /// Ordered assignment/external-call/scope-marker history.
    pub history: Vec<FrameEntry>,
    /// Module alias marking this frame as an isolated module scope.
    pub module: Option<String>,
}

impl StackFrame {
    /// Construct an empty frame.
    pub fn new(name: impl Into<String>, kind: FrameKind, parent: Option<usize>) -> Self {
        Self {
            name: name.into(),
            vars: BTreeMap::new(),
            parent,
            kind,
            history: Vec::new(),
            module: None,
        }
    }

    /// Ids of async operations that variables in this frame still reference.
    pub fn pending_ops(&self) -> Vec<OpId> {
        self.vars.values().filter_map(|v| v.pending_op).collect()
    }
}

/// A blocking external request waiting for the driving loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExternal {
    /// Resolved operation payload.
    pub payload: OperationPayload,
    /// Scope snapshot captured at suspension.
    pub snapshot: ContextSnapshot,
    /// Location of the invoking instruction.
    pub loc: SourceLoc,
}

/// The single transitional record threaded through every step.
///
/// Not serializable as a whole: the registry handle is shared with the wave
/// executor. Persistence/serialization of execution state is a collaborator
/// concern and works off the serializable pieces (frames, instructions,
/// operations).
#[derive(Debug)]
pub struct RuntimeState {
    /// Execution status.
    pub status: ExecStatus,
    /// Pending instructions, front = next.
    pub instructions: VecDeque<Instruction>,
    /// Call stack; last = current frame.
    pub frames: Vec<StackFrame>,
    /// Scratch area for composing arrays/objects/argument lists.
    pub values: Vec<Value>,
    /// Most recently computed result (carries its own provenance).
    pub last_result: Value,
    /// Blocking external request, set while `AwaitingExternal`.
    pub pending_external: Option<PendingExternal>,
    /// Operation ids awaited while `AwaitingAsync`.
    pub awaiting: Vec<OpId>,
    /// Shared deferred-operation registry.
    pub registry: OpRegistry,
    /// Program function table.
    pub functions: BTreeMap<String, FunctionDef>,
    /// Imported module scopes by alias.
    pub modules: HashMap<String, ModuleScope>,
    /// Formatted terminal error message, set when `status == Error`.
    pub fatal: Option<String>,
}

impl RuntimeState {
    /// Build the initial state for a program: a global frame plus one
    /// statement-execution instruction per top-level statement.
    pub fn new(program: Program) -> Self {
        Self::with_registry(program, OpRegistry::new())
    }

    /// Build the initial state sharing an existing registry.
    pub fn with_registry(program: Program, registry: OpRegistry) -> Self {
        let instructions = program
            .statements
            .into_iter()
            .map(|stmt| {
                let loc = stmt.loc;
                Instruction::new(InstructionKind::ExecStmt(stmt), loc)
            })
            .collect();
        let functions = program
            .functions
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        Self {
            status: ExecStatus::Running,
            instructions,
            frames: vec![StackFrame::new("script", FrameKind::Script, None)],
            values: Vec::new(),
            last_result: Value::null(),
            pending_external: None,
            awaiting: Vec::new(),
            registry,
            functions,
            modules: HashMap::new(),
            fatal: None,
        }
    }

    /// Index of the current frame.
    pub fn current_frame_index(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    /// The current frame.
    pub fn current_frame(&self) -> Result<&StackFrame> {
        self.frames
            .last()
            .ok_or_else(|| FatalError::Internal("frame stack is empty".into()))
    }

    /// Mutable access to the current frame.
    pub fn current_frame_mut(&mut self) -> Result<&mut StackFrame> {
        self.frames
            .last_mut()
            .ok_or_else(|| FatalError::Internal("frame stack is empty".into()))
    }

    /// Pop one scratch value, failing on interpreter bugs.
    pub fn pop_value(&mut self) -> Result<Value> {
        self.values
            .pop()
            .ok_or_else(|| FatalError::Internal("value stack underflow".into()))
    }

    /// Push instructions so they execute in the given order, ahead of
    /// everything already queued.
    pub fn push_front_all(&mut self, instructions: Vec<Instruction>) {
        for instruction in instructions.into_iter().rev() {
            self.instructions.push_front(instruction);
        }
    }

    /// Suspend the run from a debugger. Only a running state can pause.
    pub fn pause(&mut self) {
        if self.status == ExecStatus::Running {
            self.status = ExecStatus::Paused;
        }
    }

    /// Resume a paused run.
    pub fn resume(&mut self) {
        if self.status == ExecStatus::Paused {
            self.status = ExecStatus::Running;
        }
    }
}

/// Convenience for building declaration statements in tests and embeddings.
pub fn declare_stmt(name: &str, init: super::ast::Expr, loc: SourceLoc) -> Stmt {
    Stmt::new(
        StmtKind::Declare {
            pattern: super::ast::Pattern::Name(name.to_string()),
            declared_type: None,
            constant: false,
            deferred: false,
            init,
        },
        loc,
    )
}
