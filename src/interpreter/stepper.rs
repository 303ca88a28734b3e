//! The single-step execution engine.
//!
//! `step` pops exactly one instruction, executes it, and returns the
//! successor state. Statements lower into finer-grained instructions rather
//! than executing recursively, so any instruction boundary is a legal
//! suspension point: an external call, an async barrier, or a debugger pause
//! all just stop the popping and leave the remaining work on the stack.
//!
//! This is also the single fatal-error boundary. Handlers raise
//! [`FatalError`] freely; only `step` catches it, formats it with the source
//! location of the failing instruction, and moves the state to a terminal
//! error status.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::host::{InterpreterHost, OperationPayload, TypedValue};
use crate::schedule::waves::collect_dependencies;

use super::ast::{Expr, ExternalExpr, Pattern, SourceLoc, Stmt, StmtKind, TemplatePart};
use super::eval;
use super::instruction::{ExternalShape, Instruction, InstructionKind};
use super::scope::{self, Lookup};
use super::state::{
    ExecStatus, FrameEntry, FrameKind, PendingExternal, RuntimeState, StackFrame,
};
use super::value::{Payload, Provenance, Value};
use super::{FatalError, Result};

/// Execute one instruction and return the successor state.
///
/// A non-running state passes through unchanged; an empty instruction stack
/// completes the run (after the final scope-exit barrier); a fatal error
/// from the executed instruction becomes a terminal error status.
pub fn step(mut state: RuntimeState, host: &mut dyn InterpreterHost) -> RuntimeState {
    if state.status != ExecStatus::Running {
        return state;
    }

    let Some(instruction) = state.instructions.pop_front() else {
        return finish_run(state);
    };
    trace!(instruction = instruction.kind.name(), "executing");

    let loc = instruction.loc;
    if let Err(fatal) = execute(&mut state, host, instruction) {
        debug!(%fatal, %loc, "run terminated");
        state.fatal = Some(format!("{fatal} ({loc})"));
        state.status = ExecStatus::Error;
    }
    state
}

/// Barrier at the end of the program: unresolved operations referenced by
/// any live frame must resolve before the run can complete.
fn finish_run(mut state: RuntimeState) -> RuntimeState {
    let unresolved: Vec<_> = state
        .frames
        .iter()
        .flat_map(StackFrame::pending_ops)
        .filter(|id| !state.registry.is_resolved(*id))
        .collect();
    if unresolved.is_empty() {
        scope::absorb_resolved(&mut state);
        state.status = ExecStatus::Completed;
    } else {
        state.awaiting = unresolved;
        state.status = ExecStatus::AwaitingAsync;
    }
    state
}

/// The instruction the next `step` call would execute.
pub fn next_instruction(state: &RuntimeState) -> Option<&Instruction> {
    state.instructions.front()
}

/// Step at most `n` times, stopping early on any suspension.
pub fn step_n(mut state: RuntimeState, host: &mut dyn InterpreterHost, n: usize) -> RuntimeState {
    for _ in 0..n {
        if state.status != ExecStatus::Running {
            break;
        }
        state = step(state, host);
    }
    state
}

/// Step until the run suspends or terminates.
pub fn run_until_pause(mut state: RuntimeState, host: &mut dyn InterpreterHost) -> RuntimeState {
    while state.status == ExecStatus::Running {
        state = step(state, host);
    }
    state
}

/// Step until the next instruction satisfies the predicate, leaving that
/// instruction unexecuted. Stops on suspension as well.
pub fn step_until(
    mut state: RuntimeState,
    host: &mut dyn InterpreterHost,
    predicate: impl Fn(&Instruction) -> bool,
) -> RuntimeState {
    while state.status == ExecStatus::Running {
        match next_instruction(&state) {
            Some(instruction) if predicate(instruction) => break,
            Some(_) => state = step(state, host),
            None => {
                state = step(state, host);
                break;
            }
        }
    }
    state
}

/// Step until the next instruction has the given variant name
/// (see [`InstructionKind::name`]).
pub fn step_until_op(
    state: RuntimeState,
    host: &mut dyn InterpreterHost,
    name: &str,
) -> RuntimeState {
    step_until(state, host, |instruction| instruction.kind.name() == name)
}

/// Feed the result of a blocking external operation back into a state
/// suspended on it, marking the value as externally produced.
pub fn resume_external(state: &mut RuntimeState, mut value: Value) {
    if state.status != ExecStatus::AwaitingExternal {
        return;
    }
    value.provenance = Provenance::External;
    state.last_result = value;
    state.pending_external = None;
    state.status = ExecStatus::Running;
}

fn execute(
    state: &mut RuntimeState,
    host: &mut dyn InterpreterHost,
    instruction: Instruction,
) -> Result<()> {
    let loc = instruction.loc;
    match instruction.kind {
        InstructionKind::ExecStmt(stmt) => lower_stmt(state, stmt),
        InstructionKind::EvalExpr(expr) => lower_expr(state, expr, loc),
        InstructionKind::Declare {
            pattern,
            declared_type,
            constant,
        } => exec_declare(state, host, pattern, declared_type, constant, loc),
        InstructionKind::Assign { target } => {
            let declared = scope::declared_type_of(state, &target)?;
            let value = bind_validated(host, state.last_result.clone(), declared.as_deref(), &target);
            scope::assign(state, &target, value)
        }
        InstructionKind::PushValue => {
            state.values.push(state.last_result.clone());
            Ok(())
        }
        InstructionKind::BuildArray { len } => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(state.pop_value()?);
            }
            items.reverse();
            state.last_result = Value::array(items);
            Ok(())
        }
        InstructionKind::BuildObject { keys } => {
            let mut entries = BTreeMap::new();
            for key in keys.into_iter().rev() {
                entries.insert(key, state.pop_value()?);
            }
            state.last_result = Value::object(entries);
            Ok(())
        }
        InstructionKind::ApplyBinary { op } => {
            let right = state.pop_value()?;
            let left = state.pop_value()?;
            state.last_result = eval::apply_binary(op, &left, &right, loc)?;
            Ok(())
        }
        InstructionKind::ApplyUnary { op } => {
            let operand = state.pop_value()?;
            state.last_result = eval::apply_unary(op, &operand, loc)?;
            Ok(())
        }
        InstructionKind::AccessMember { property } => {
            let receiver = state.pop_value()?;
            state.last_result = eval::access_member(&receiver, &property, loc);
            Ok(())
        }
        InstructionKind::AccessIndex => {
            let index = state.pop_value()?;
            let receiver = state.pop_value()?;
            state.last_result = eval::access_index(&receiver, &index, loc)?;
            Ok(())
        }
        InstructionKind::AccessSlice { has_start, has_end } => {
            let end = if has_end { Some(state.pop_value()?) } else { None };
            let start = if has_start { Some(state.pop_value()?) } else { None };
            let receiver = state.pop_value()?;
            state.last_result = eval::access_slice(&receiver, start.as_ref(), end.as_ref(), loc)?;
            Ok(())
        }
        InstructionKind::Interpolate { parts } => exec_interpolate(state, parts, loc),
        InstructionKind::Branch {
            consequent,
            alternate,
        } => {
            if state.last_result.truthy() {
                queue_block(state, "if", consequent, loc);
            } else if let Some(alternate) = alternate {
                queue_block(state, "else", alternate, loc);
            }
            Ok(())
        }
        InstructionKind::IterateWhile {
            condition,
            body,
            checked,
        } => exec_while(state, condition, body, checked, loc),
        InstructionKind::IterateForIn {
            variable,
            items,
            index,
            body,
        } => exec_for_in(state, variable, items, index, body, loc),
        InstructionKind::EnterBlock { name } => {
            enter_frame(state, &name, FrameKind::Block);
            Ok(())
        }
        InstructionKind::ExitBlock => exec_exit_block(state, loc),
        InstructionKind::CallFunction { name, argc } => {
            exec_call(state, host, &name, argc, loc)
        }
        InstructionKind::Return { has_value } => {
            let value = if has_value {
                state.last_result.clone()
            } else {
                Value::null()
            };
            if suspend_on_pending(
                state,
                scope::pending_ops_to_function(state),
                Instruction::new(InstructionKind::Return { has_value }, loc),
            ) {
                return Ok(());
            }
            drain_to_function_exit(state)?;
            finish_function(state, host, value)
        }
        InstructionKind::ExitFunction => {
            if suspend_on_pending(
                state,
                scope::pending_ops_to_function(state),
                Instruction::new(InstructionKind::ExitFunction, loc),
            ) {
                return Ok(());
            }
            finish_function(state, host, Value::null())
        }
        InstructionKind::InvokeExternal { shape } => exec_invoke(state, shape, loc),
        InstructionKind::AwaitOps { ids } => {
            let unresolved: Vec<_> = ids
                .iter()
                .copied()
                .filter(|id| !state.registry.is_resolved(*id))
                .collect();
            if unresolved.is_empty() {
                scope::absorb_resolved(state);
                state.awaiting.clear();
            } else {
                state.awaiting = unresolved.clone();
                state
                    .instructions
                    .push_front(Instruction::new(InstructionKind::AwaitOps { ids: unresolved }, loc));
                state.status = ExecStatus::AwaitingAsync;
            }
            Ok(())
        }
        InstructionKind::ImportModule { path, alias } => {
            let module = host
                .load_module(&path)
                .map_err(|source| FatalError::ModuleLoad {
                    path: path.clone(),
                    message: source.to_string(),
                })?;
            debug!(module = %path, %alias, "module loaded");
            state.modules.insert(alias, module);
            Ok(())
        }
    }
}

/// Lower one statement into its instruction sequence.
fn lower_stmt(state: &mut RuntimeState, stmt: Stmt) -> Result<()> {
    let loc = stmt.loc;
    match stmt.kind {
        StmtKind::Declare {
            pattern,
            declared_type,
            constant,
            deferred,
            init,
        } => {
            if deferred {
                return register_deferred(state, pattern, declared_type, constant, init);
            }
            state.push_front_all(vec![
                Instruction::new(InstructionKind::EvalExpr(init), loc),
                Instruction::new(
                    InstructionKind::Declare {
                        pattern,
                        declared_type,
                        constant,
                    },
                    loc,
                ),
            ]);
        }
        StmtKind::Assign { target, expr } => {
            state.push_front_all(vec![
                Instruction::new(InstructionKind::EvalExpr(expr), loc),
                Instruction::new(InstructionKind::Assign { target }, loc),
            ]);
        }
        StmtKind::Expr(expr) => {
            state
                .instructions
                .push_front(Instruction::new(InstructionKind::EvalExpr(expr), loc));
        }
        StmtKind::If {
            condition,
            consequent,
            alternate,
        } => {
            state.push_front_all(vec![
                Instruction::new(InstructionKind::EvalExpr(condition), loc),
                Instruction::new(
                    InstructionKind::Branch {
                        consequent,
                        alternate,
                    },
                    loc,
                ),
            ]);
        }
        StmtKind::While { condition, body } => {
            state.instructions.push_front(Instruction::new(
                InstructionKind::IterateWhile {
                    condition,
                    body,
                    checked: false,
                },
                loc,
            ));
        }
        StmtKind::ForIn {
            variable,
            iterable,
            body,
        } => {
            state.push_front_all(vec![
                Instruction::new(InstructionKind::EvalExpr(iterable), loc),
                Instruction::new(
                    InstructionKind::IterateForIn {
                        variable,
                        items: None,
                        index: 0,
                        body,
                    },
                    loc,
                ),
            ]);
        }
        StmtKind::Return(expr) => match expr {
            Some(expr) => state.push_front_all(vec![
                Instruction::new(InstructionKind::EvalExpr(expr), loc),
                Instruction::new(InstructionKind::Return { has_value: true }, loc),
            ]),
            None => state
                .instructions
                .push_front(Instruction::new(InstructionKind::Return { has_value: false }, loc)),
        },
        StmtKind::Block(statements) => queue_block(state, "block", statements, loc),
        StmtKind::Import { path, alias } => {
            state
                .instructions
                .push_front(Instruction::new(InstructionKind::ImportModule { path, alias }, loc));
        }
    }
    Ok(())
}

/// Lower one expression: either produce the result directly or decompose
/// into operand evaluations plus a combining instruction.
fn lower_expr(state: &mut RuntimeState, expr: Expr, loc: SourceLoc) -> Result<()> {
    match expr {
        Expr::Null => state.last_result = Value::null(),
        Expr::Bool(b) => state.last_result = Value::bool(b),
        Expr::Number(n) => state.last_result = Value::number(n),
        Expr::Str(s) => state.last_result = Value::string(s),
        Expr::Template(parts) => {
            state
                .instructions
                .push_front(Instruction::new(InstructionKind::Interpolate { parts }, loc));
        }
        Expr::Array(items) => {
            let len = items.len();
            let mut queued = Vec::with_capacity(len * 2 + 1);
            for item in items {
                queued.push(Instruction::new(InstructionKind::EvalExpr(item), loc));
                queued.push(Instruction::new(InstructionKind::PushValue, loc));
            }
            queued.push(Instruction::new(InstructionKind::BuildArray { len }, loc));
            state.push_front_all(queued);
        }
        Expr::Object(entries) => {
            let mut keys = Vec::with_capacity(entries.len());
            let mut queued = Vec::with_capacity(entries.len() * 2 + 1);
            for (key, value) in entries {
                keys.push(key);
                queued.push(Instruction::new(InstructionKind::EvalExpr(value), loc));
                queued.push(Instruction::new(InstructionKind::PushValue, loc));
            }
            queued.push(Instruction::new(InstructionKind::BuildObject { keys }, loc));
            state.push_front_all(queued);
        }
        Expr::Identifier(name) => match scope::lookup(state, &name)? {
            Lookup::Found(value) => state.last_result = value.plain_copy(),
            Lookup::Pending(id) => {
                state.push_front_all(vec![
                    Instruction::new(InstructionKind::AwaitOps { ids: vec![id] }, loc),
                    Instruction::new(InstructionKind::EvalExpr(Expr::Identifier(name)), loc),
                ]);
            }
            Lookup::Missing => return Err(FatalError::UndeclaredVariable(name)),
        },
        Expr::Member { object, property } => {
            state.push_front_all(vec![
                Instruction::new(InstructionKind::EvalExpr(*object), loc),
                Instruction::new(InstructionKind::PushValue, loc),
                Instruction::new(InstructionKind::AccessMember { property }, loc),
            ]);
        }
        Expr::Index { object, index } => {
            state.push_front_all(vec![
                Instruction::new(InstructionKind::EvalExpr(*object), loc),
                Instruction::new(InstructionKind::PushValue, loc),
                Instruction::new(InstructionKind::EvalExpr(*index), loc),
                Instruction::new(InstructionKind::PushValue, loc),
                Instruction::new(InstructionKind::AccessIndex, loc),
            ]);
        }
        Expr::Slice { object, start, end } => {
            let has_start = start.is_some();
            let has_end = end.is_some();
            let mut queued = vec![
                Instruction::new(InstructionKind::EvalExpr(*object), loc),
                Instruction::new(InstructionKind::PushValue, loc),
            ];
            if let Some(start) = start {
                queued.push(Instruction::new(InstructionKind::EvalExpr(*start), loc));
                queued.push(Instruction::new(InstructionKind::PushValue, loc));
            }
            if let Some(end) = end {
                queued.push(Instruction::new(InstructionKind::EvalExpr(*end), loc));
                queued.push(Instruction::new(InstructionKind::PushValue, loc));
            }
            queued.push(Instruction::new(
                InstructionKind::AccessSlice { has_start, has_end },
                loc,
            ));
            state.push_front_all(queued);
        }
        Expr::Unary { op, operand } => {
            state.push_front_all(vec![
                Instruction::new(InstructionKind::EvalExpr(*operand), loc),
                Instruction::new(InstructionKind::PushValue, loc),
                Instruction::new(InstructionKind::ApplyUnary { op }, loc),
            ]);
        }
        Expr::Binary { op, left, right } => {
            state.push_front_all(vec![
                Instruction::new(InstructionKind::EvalExpr(*left), loc),
                Instruction::new(InstructionKind::PushValue, loc),
                Instruction::new(InstructionKind::EvalExpr(*right), loc),
                Instruction::new(InstructionKind::PushValue, loc),
                Instruction::new(InstructionKind::ApplyBinary { op }, loc),
            ]);
        }
        Expr::Call { callee, args } => {
            let argc = args.len();
            let mut queued = Vec::with_capacity(argc * 2 + 1);
            for arg in args {
                queued.push(Instruction::new(InstructionKind::EvalExpr(arg), loc));
                queued.push(Instruction::new(InstructionKind::PushValue, loc));
            }
            queued.push(Instruction::new(
                InstructionKind::CallFunction { name: callee, argc },
                loc,
            ));
            state.push_front_all(queued);
        }
        Expr::External(external) => lower_external(state, external, loc),
    }
    Ok(())
}

fn lower_external(state: &mut RuntimeState, external: ExternalExpr, loc: SourceLoc) {
    match external {
        ExternalExpr::ModelCall {
            prompt,
            model,
            context,
        } => {
            let has_model = model.is_some();
            let context_len = context.len();
            let mut queued = vec![
                Instruction::new(InstructionKind::EvalExpr(*prompt), loc),
                Instruction::new(InstructionKind::PushValue, loc),
            ];
            if let Some(model) = model {
                queued.push(Instruction::new(InstructionKind::EvalExpr(*model), loc));
                queued.push(Instruction::new(InstructionKind::PushValue, loc));
            }
            for value in context {
                queued.push(Instruction::new(InstructionKind::EvalExpr(value), loc));
                queued.push(Instruction::new(InstructionKind::PushValue, loc));
            }
            queued.push(Instruction::new(
                InstructionKind::InvokeExternal {
                    shape: ExternalShape::ModelCall {
                        has_model,
                        context_len,
                    },
                },
                loc,
            ));
            state.push_front_all(queued);
        }
        ExternalExpr::CodeBlock { body, params } => {
            state.instructions.push_front(Instruction::new(
                InstructionKind::InvokeExternal {
                    shape: ExternalShape::CodeBlock { body, params },
                },
                loc,
            ));
        }
        ExternalExpr::ToolCall { name, args } => {
            let argc = args.len();
            let mut queued = Vec::with_capacity(argc * 2 + 1);
            for arg in args {
                queued.push(Instruction::new(InstructionKind::EvalExpr(arg), loc));
                queued.push(Instruction::new(InstructionKind::PushValue, loc));
            }
            queued.push(Instruction::new(
                InstructionKind::InvokeExternal {
                    shape: ExternalShape::ToolCall { name, argc },
                },
                loc,
            ));
            state.push_front_all(queued);
        }
    }
}

/// Register a deferred declaration: the operation is recorded with its
/// statically discovered dependencies and the name binds a placeholder; no
/// work starts until a wave picks the operation up.
fn register_deferred(
    state: &mut RuntimeState,
    pattern: Pattern,
    declared_type: Option<String>,
    constant: bool,
    init: Expr,
) -> Result<()> {
    let Pattern::Name(name) = pattern else {
        return Err(FatalError::UnsupportedDeferred(
            "destructuring of a deferred operation",
        ));
    };
    if !matches!(init, Expr::External(_)) {
        return Err(FatalError::InvalidAsyncInit);
    }
    let dependencies = collect_dependencies(&init);
    let id = state
        .registry
        .register(Some(name.clone()), init, dependencies);
    let mut placeholder = Value::pending(id);
    placeholder.declared_type = declared_type;
    placeholder.constant = constant;
    scope::declare(state, &name, placeholder)
}

/// Run a value through the type validator; a rejection becomes an
/// error-flagged binding rather than a terminal error.
fn bind_validated(
    host: &mut dyn InterpreterHost,
    value: Value,
    declared: Option<&str>,
    name: &str,
) -> Value {
    match host.validate(value, declared, name) {
        Ok(TypedValue {
            mut value,
            inferred_type,
        }) => {
            value.declared_type = declared.map(str::to_string).or(inferred_type);
            value
        }
        Err(info) => Value::from_error(info),
    }
}

fn exec_declare(
    state: &mut RuntimeState,
    host: &mut dyn InterpreterHost,
    pattern: Pattern,
    declared_type: Option<String>,
    constant: bool,
    loc: SourceLoc,
) -> Result<()> {
    let source = state.last_result.clone();
    match pattern {
        Pattern::Name(name) => {
            let mut value = bind_validated(host, source, declared_type.as_deref(), &name);
            value.constant = constant;
            scope::declare(state, &name, value)
        }
        Pattern::Object(names) => {
            for name in names {
                let field = eval::access_member(&source, &name, loc);
                let mut value = bind_validated(host, field, declared_type.as_deref(), &name);
                value.constant = constant;
                scope::declare(state, &name, value)?;
            }
            Ok(())
        }
    }
}

fn exec_interpolate(
    state: &mut RuntimeState,
    parts: Vec<TemplatePart>,
    loc: SourceLoc,
) -> Result<()> {
    // Both placeholder modes wait for unresolved operations: a deferred
    // placeholder still hands the collaborator the variable's value context.
    let mut pending = Vec::new();
    for part in &parts {
        let name = match part {
            TemplatePart::Deferred(name) | TemplatePart::Expand(name) => name,
            TemplatePart::Text(_) => continue,
        };
        if let Lookup::Pending(id) = scope::lookup(state, name)? {
            pending.push(id);
        }
    }
    if suspend_on_pending(
        state,
        pending,
        Instruction::new(InstructionKind::Interpolate { parts: parts.clone() }, loc),
    ) {
        return Ok(());
    }

    let rendered = eval::render_template(&parts, &mut |name| {
        match scope::lookup(state, name)? {
            Lookup::Found(value) => Ok(value),
            Lookup::Missing => Err(FatalError::UndeclaredVariable(name.to_string())),
            Lookup::Pending(_) => Err(FatalError::Internal(
                "pending variable survived interpolation barrier".into(),
            )),
        }
    })?;
    state.last_result = rendered;
    Ok(())
}

/// Queue an `AwaitOps` barrier ahead of a re-queued instruction when any of
/// the given operations are unresolved. Returns whether a barrier was set.
fn suspend_on_pending(
    state: &mut RuntimeState,
    ids: Vec<crate::schedule::OpId>,
    retry: Instruction,
) -> bool {
    let unresolved: Vec<_> = ids
        .into_iter()
        .filter(|id| !state.registry.is_resolved(*id))
        .collect();
    if unresolved.is_empty() {
        return false;
    }
    let loc = retry.loc;
    state.push_front_all(vec![
        Instruction::new(InstructionKind::AwaitOps { ids: unresolved }, loc),
        retry,
    ]);
    true
}

fn enter_frame(state: &mut RuntimeState, name: &str, kind: FrameKind) {
    let parent = state.current_frame_index();
    if let Some(frame) = state.frames.last_mut() {
        frame.history.push(FrameEntry::ScopeMarker {
            label: name.to_string(),
        });
    }
    state.frames.push(StackFrame::new(name, kind, Some(parent)));
}

fn queue_block(state: &mut RuntimeState, name: &str, statements: Vec<Stmt>, loc: SourceLoc) {
    let mut queued = Vec::with_capacity(statements.len() + 2);
    queued.push(Instruction::new(
        InstructionKind::EnterBlock {
            name: name.to_string(),
        },
        loc,
    ));
    for stmt in statements {
        let stmt_loc = stmt.loc;
        queued.push(Instruction::new(InstructionKind::ExecStmt(stmt), stmt_loc));
    }
    queued.push(Instruction::new(InstructionKind::ExitBlock, loc));
    state.push_front_all(queued);
}

fn exec_exit_block(state: &mut RuntimeState, loc: SourceLoc) -> Result<()> {
    let pending = state.current_frame()?.pending_ops();
    if suspend_on_pending(
        state,
        pending,
        Instruction::new(InstructionKind::ExitBlock, loc),
    ) {
        return Ok(());
    }
    if state.frames.len() <= 1 {
        return Err(FatalError::Internal("exit from the script frame".into()));
    }
    state.frames.pop();
    Ok(())
}

fn exec_while(
    state: &mut RuntimeState,
    condition: Expr,
    body: Vec<Stmt>,
    checked: bool,
    loc: SourceLoc,
) -> Result<()> {
    if !checked {
        state.push_front_all(vec![
            Instruction::new(InstructionKind::EvalExpr(condition.clone()), loc),
            Instruction::new(
                InstructionKind::IterateWhile {
                    condition,
                    body,
                    checked: true,
                },
                loc,
            ),
        ]);
        return Ok(());
    }
    if !state.last_result.truthy() {
        return Ok(());
    }

    enter_frame(state, "while", FrameKind::Loop);
    let mut queued = Vec::with_capacity(body.len() + 2);
    for stmt in &body {
        queued.push(Instruction::new(InstructionKind::ExecStmt(stmt.clone()), stmt.loc));
    }
    queued.push(Instruction::new(InstructionKind::ExitBlock, loc));
    queued.push(Instruction::new(
        InstructionKind::IterateWhile {
            condition,
            body,
            checked: false,
        },
        loc,
    ));
    state.push_front_all(queued);
    Ok(())
}

fn exec_for_in(
    state: &mut RuntimeState,
    variable: String,
    items: Option<Vec<Value>>,
    index: usize,
    body: Vec<Stmt>,
    loc: SourceLoc,
) -> Result<()> {
    let items = match items {
        Some(items) => items,
        None => {
            let iterable = state.last_result.clone();
            if iterable.is_error() {
                // An error-flagged iterable skips the loop and flows onward.
                return Ok(());
            }
            match iterable.data {
                Payload::Array(items) => items,
                other => return Err(FatalError::NotIterable(other.type_name())),
            }
        }
    };

    let Some(item) = items.get(index).cloned() else {
        return Ok(());
    };

    enter_frame(state, "for", FrameKind::Loop);
    scope::declare(state, &variable, item.plain_copy())?;
    let mut queued = Vec::with_capacity(body.len() + 2);
    for stmt in &body {
        queued.push(Instruction::new(InstructionKind::ExecStmt(stmt.clone()), stmt.loc));
    }
    queued.push(Instruction::new(InstructionKind::ExitBlock, loc));
    queued.push(Instruction::new(
        InstructionKind::IterateForIn {
            variable,
            items: Some(items),
            index: index + 1,
            body,
        },
        loc,
    ));
    state.push_front_all(queued);
    Ok(())
}

/// Module alias the current frame chain executes under, if any.
fn current_module(state: &RuntimeState) -> Option<String> {
    let mut next = Some(state.current_frame_index());
    while let Some(index) = next {
        let frame = state.frames.get(index)?;
        if let Some(alias) = &frame.module {
            return Some(alias.clone());
        }
        next = frame.parent;
    }
    None
}

fn exec_call(
    state: &mut RuntimeState,
    host: &mut dyn InterpreterHost,
    name: &str,
    argc: usize,
    _loc: SourceLoc,
) -> Result<()> {
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(state.pop_value()?);
    }
    args.reverse();

    // A dotted callee targets an imported module; a plain callee prefers
    // the current module's own function table when executing module code.
    let (module_alias, function) = if let Some((alias, func)) = name.split_once('.') {
        let module = state
            .modules
            .get(alias)
            .ok_or_else(|| FatalError::UnknownModule(alias.to_string()))?;
        let function = module
            .functions
            .get(func)
            .cloned()
            .ok_or_else(|| FatalError::UnknownFunction(name.to_string()))?;
        (Some(alias.to_string()), function)
    } else {
        let local = current_module(state)
            .and_then(|alias| {
                state
                    .modules
                    .get(&alias)
                    .and_then(|m| m.functions.get(name).cloned())
                    .map(|f| (Some(alias), f))
            });
        match local {
            Some((alias, function)) => (alias, function),
            None => (
                None,
                state
                    .functions
                    .get(name)
                    .cloned()
                    .ok_or_else(|| FatalError::UnknownFunction(name.to_string()))?,
            ),
        }
    };

    if function.params.len() != args.len() {
        return Err(FatalError::ArityMismatch {
            name: function.name.clone(),
            expected: function.params.len(),
            received: args.len(),
        });
    }

    // Function frames chain to the global scope, never the caller; module
    // functions chain to nothing and rely on the module boundary instead.
    let mut frame = StackFrame::new(
        function.name.clone(),
        FrameKind::Function {
            return_type: function.return_type.clone(),
        },
        if module_alias.is_some() { None } else { Some(0) },
    );
    frame.module = module_alias;
    state.frames.push(frame);

    for (param, arg) in function.params.iter().zip(args) {
        let value = bind_validated(host, arg, param.declared_type.as_deref(), &param.name);
        scope::declare(state, &param.name, value)?;
    }

    let mut queued = Vec::with_capacity(function.body.len() + 1);
    for stmt in function.body {
        let stmt_loc = stmt.loc;
        queued.push(Instruction::new(InstructionKind::ExecStmt(stmt), stmt_loc));
    }
    queued.push(Instruction::new(
        InstructionKind::ExitFunction,
        SourceLoc::default(),
    ));
    state.push_front_all(queued);
    Ok(())
}

/// Drop the remaining instructions of the current function activation, up
/// to and including its closing marker.
fn drain_to_function_exit(state: &mut RuntimeState) -> Result<()> {
    while let Some(instruction) = state.instructions.pop_front() {
        if matches!(instruction.kind, InstructionKind::ExitFunction) {
            return Ok(());
        }
    }
    Err(FatalError::Internal("return outside of a function".into()))
}

/// Pop frames through the function activation and publish the validated
/// return value.
fn finish_function(
    state: &mut RuntimeState,
    host: &mut dyn InterpreterHost,
    value: Value,
) -> Result<()> {
    if !state
        .frames
        .iter()
        .any(|f| matches!(f.kind, FrameKind::Function { .. }))
    {
        return Err(FatalError::Internal("return outside of a function".into()));
    }
    loop {
        let frame = state
            .frames
            .pop()
            .ok_or_else(|| FatalError::Internal("frame stack drained by return".into()))?;
        if let FrameKind::Function { return_type } = frame.kind {
            state.last_result = bind_validated(host, value, return_type.as_deref(), "return");
            return Ok(());
        }
    }
}

fn exec_invoke(state: &mut RuntimeState, shape: ExternalShape, loc: SourceLoc) -> Result<()> {
    let payload = match shape {
        ExternalShape::ModelCall {
            has_model,
            context_len,
        } => {
            let mut context = Vec::with_capacity(context_len);
            for _ in 0..context_len {
                context.push(state.pop_value()?);
            }
            context.reverse();
            let model = if has_model {
                Some(state.pop_value()?)
            } else {
                None
            };
            let prompt = state.pop_value()?;
            // An error-flagged prompt or selector skips the invocation and
            // flows onward as data instead of being rendered.
            let mut operands = vec![&prompt];
            operands.extend(model.as_ref());
            if let Some(info) = Value::first_error(&operands) {
                state.last_result = Value::from_error(info.clone());
                return Ok(());
            }
            OperationPayload::ModelCall {
                prompt: prompt.display_string(),
                model: model.map(|v| v.display_string()),
                context,
            }
        }
        ExternalShape::CodeBlock { body, params } => {
            let mut pending = Vec::new();
            let mut bindings = BTreeMap::new();
            for name in &params {
                match scope::lookup(state, name)? {
                    Lookup::Found(value) => {
                        bindings.insert(name.clone(), value.plain_copy());
                    }
                    Lookup::Pending(id) => pending.push(id),
                    Lookup::Missing => {
                        return Err(FatalError::UndeclaredVariable(name.clone()));
                    }
                }
            }
            if suspend_on_pending(
                state,
                pending,
                Instruction::new(
                    InstructionKind::InvokeExternal {
                        shape: ExternalShape::CodeBlock { body: body.clone(), params },
                    },
                    loc,
                ),
            ) {
                return Ok(());
            }
            OperationPayload::CodeEval { body, bindings }
        }
        ExternalShape::ToolCall { name, argc } => {
            let mut args = Vec::with_capacity(argc);
            for _ in 0..argc {
                args.push(state.pop_value()?);
            }
            args.reverse();
            OperationPayload::Invocation { name, args }
        }
    };

    let description = match &payload {
        OperationPayload::ModelCall { .. } => "model call".to_string(),
        OperationPayload::CodeEval { .. } => "code evaluation".to_string(),
        OperationPayload::Invocation { name, .. } => format!("tool '{name}'"),
    };
    state
        .current_frame_mut()?
        .history
        .push(FrameEntry::ExternalCall { description });

    let snapshot = scope::snapshot_visible(state);
    state.pending_external = Some(PendingExternal {
        payload,
        snapshot,
        loc,
    });
    state.status = ExecStatus::AwaitingExternal;
    debug!(%loc, "suspended on external operation");
    Ok(())
}
