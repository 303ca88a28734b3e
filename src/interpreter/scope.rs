//! Frame-chain variable lookup, assignment, and module isolation.
//!
//! Lookup walks frames outward via the parent link. A frame tagged with a
//! module alias is a hard boundary: when the name is not local, the module's
//! isolated globals are consulted and the walk stops regardless of outcome,
//! so imported code can never read caller locals.

use crate::schedule::{ContextSnapshot, OpId};

use super::state::{FrameEntry, FrameKind, RuntimeState};
use super::value::Value;
use super::{FatalError, Result};

/// Where a binding was found during a scope walk.
enum Slot {
    /// Local binding in the frame at the given index.
    Frame(usize),
    /// Global binding of the module imported under the given alias.
    Module(String),
}

/// Outcome of a resolving lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The name is not declared anywhere in the visible chain.
    Missing,
    /// The binding still references an unresolved operation.
    Pending(OpId),
    /// The binding's current value.
    Found(Value),
}

fn locate(state: &RuntimeState, name: &str) -> Result<Option<Slot>> {
    let mut next = Some(state.current_frame_index());
    while let Some(index) = next {
        let frame = state
            .frames
            .get(index)
            .ok_or_else(|| FatalError::Internal(format!("dangling parent frame {index}")))?;
        if frame.vars.contains_key(name) {
            return Ok(Some(Slot::Frame(index)));
        }
        if let Some(alias) = &frame.module {
            // Module boundary: consult the isolated globals and stop.
            let module = state
                .modules
                .get(alias)
                .ok_or_else(|| FatalError::UnknownModule(alias.clone()))?;
            if module.globals.contains_key(name) {
                return Ok(Some(Slot::Module(alias.clone())));
            }
            return Ok(None);
        }
        next = frame.parent;
    }
    Ok(None)
}

fn slot_value<'a>(state: &'a RuntimeState, slot: &Slot, name: &str) -> Option<&'a Value> {
    match slot {
        Slot::Frame(index) => state.frames[*index].vars.get(name),
        Slot::Module(alias) => state.modules.get(alias)?.globals.get(name),
    }
}

fn slot_value_mut<'a>(
    state: &'a mut RuntimeState,
    slot: &Slot,
    name: &str,
) -> Option<&'a mut Value> {
    match slot {
        Slot::Frame(index) => state.frames[*index].vars.get_mut(name),
        Slot::Module(alias) => state.modules.get_mut(alias)?.globals.get_mut(name),
    }
}

/// Look the name up, substituting resolved async results in place.
///
/// When the binding references an operation that has since resolved, the
/// resolved value (or an error-flagged value on failure) is written back
/// into the binding before being returned, keeping the declared type and
/// constancy of the original binding.
pub fn lookup(state: &mut RuntimeState, name: &str) -> Result<Lookup> {
    let Some(slot) = locate(state, name)? else {
        return Ok(Lookup::Missing);
    };
    let current = slot_value(state, &slot, name)
        .cloned()
        .ok_or_else(|| FatalError::Internal(format!("located binding '{name}' vanished")))?;

    let Some(op) = current.pending_op else {
        return Ok(Lookup::Found(current));
    };

    match state.registry.resolved_value(op) {
        Some(mut resolved) => {
            resolved.constant = current.constant;
            resolved.declared_type = current.declared_type.clone();
            if let Some(binding) = slot_value_mut(state, &slot, name) {
                *binding = resolved.clone();
            }
            Ok(Lookup::Found(resolved))
        }
        None => Ok(Lookup::Pending(op)),
    }
}

/// Declared type of an existing binding, for validator calls on assignment.
pub fn declared_type_of(state: &RuntimeState, name: &str) -> Result<Option<String>> {
    match locate(state, name)? {
        Some(slot) => Ok(slot_value(state, &slot, name).and_then(|v| v.declared_type.clone())),
        None => Err(FatalError::UndeclaredVariable(name.to_string())),
    }
}

/// Bind a name in the current frame, recording frame history.
pub fn declare(state: &mut RuntimeState, name: &str, value: Value) -> Result<()> {
    let frame = state.current_frame_mut()?;
    frame.history.push(FrameEntry::Assignment {
        name: name.to_string(),
        value: value.clone(),
    });
    frame.vars.insert(name.to_string(), value);
    Ok(())
}

/// Assign to an existing binding found by the scope walk.
///
/// Assigning to a constant, or to a name not found anywhere in the chain,
/// is a fatal structural error. The new value inherits the binding's
/// declared type.
pub fn assign(state: &mut RuntimeState, name: &str, mut value: Value) -> Result<()> {
    let Some(slot) = locate(state, name)? else {
        return Err(FatalError::UndeclaredVariable(name.to_string()));
    };
    let existing = slot_value(state, &slot, name)
        .ok_or_else(|| FatalError::Internal(format!("located binding '{name}' vanished")))?;
    if existing.constant {
        return Err(FatalError::AssignToConstant(name.to_string()));
    }
    value.declared_type = existing.declared_type.clone();

    if let Slot::Frame(index) = slot {
        state.frames[index].history.push(FrameEntry::Assignment {
            name: name.to_string(),
            value: value.clone(),
        });
    }
    if let Some(binding) = slot_value_mut(state, &slot, name) {
        *binding = value;
    }
    Ok(())
}

/// Snapshot of all bindings visible from the current frame, inner scopes
/// shadowing outer ones.
pub fn snapshot_visible(state: &RuntimeState) -> ContextSnapshot {
    let mut snapshot = ContextSnapshot::default();
    let mut next = Some(state.current_frame_index());
    while let Some(index) = next {
        let Some(frame) = state.frames.get(index) else {
            break;
        };
        for (name, value) in &frame.vars {
            snapshot
                .variables
                .entry(name.clone())
                .or_insert_with(|| value.plain_copy());
        }
        if let Some(alias) = &frame.module {
            if let Some(module) = state.modules.get(alias) {
                for (name, value) in &module.globals {
                    snapshot
                        .variables
                        .entry(name.clone())
                        .or_insert_with(|| value.plain_copy());
                }
            }
            break;
        }
        next = frame.parent;
    }
    snapshot
}

/// Operation ids still pending in every frame from the top of the call
/// stack down to and including the nearest function frame. Used by the
/// return barrier.
pub fn pending_ops_to_function(state: &RuntimeState) -> Vec<OpId> {
    let mut ids = Vec::new();
    for frame in state.frames.iter().rev() {
        ids.extend(frame.pending_ops());
        if matches!(frame.kind, FrameKind::Function { .. }) {
            break;
        }
    }
    ids
}

/// Replace bindings that reference resolved operations with their results,
/// across all frames and imported module globals.
pub fn absorb_resolved(state: &mut RuntimeState) {
    let registry = state.registry.clone();
    let substitute = |value: &mut Value| {
        if let Some(op) = value.pending_op {
            if let Some(mut resolved) = registry.resolved_value(op) {
                resolved.constant = value.constant;
                resolved.declared_type = value.declared_type.clone();
                *value = resolved;
            }
        }
    };
    for frame in &mut state.frames {
        for value in frame.vars.values_mut() {
            substitute(value);
        }
    }
    for module in state.modules.values_mut() {
        for value in module.globals.values_mut() {
            substitute(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ModuleScope;
    use crate::interpreter::ast::Program;
    use crate::interpreter::state::StackFrame;

    fn state_with_frames() -> RuntimeState {
        let mut state = RuntimeState::new(Program::default());
        state.frames[0]
            .vars
            .insert("outer".into(), Value::number(1.0));
        state
            .frames
            .push(StackFrame::new("block", FrameKind::Block, Some(0)));
        state
    }

    #[test]
    fn lookup_walks_parent_chain() {
        let mut state = state_with_frames();
        assert_eq!(
            lookup(&mut state, "outer").unwrap(),
            Lookup::Found(Value::number(1.0))
        );
        assert_eq!(lookup(&mut state, "missing").unwrap(), Lookup::Missing);
    }

    #[test]
    fn module_boundary_stops_lookup() {
        let mut state = state_with_frames();
        // Caller local that the module must not see.
        state.frames[0]
            .vars
            .insert("secret".into(), Value::string("caller"));

        let mut module = ModuleScope::default();
        module.globals.insert("shared".into(), Value::number(7.0));
        state.modules.insert("util".into(), module);

        let mut frame = StackFrame::new("util.fn", FrameKind::Function { return_type: None }, None);
        frame.module = Some("util".into());
        state.frames.push(frame);

        assert_eq!(
            lookup(&mut state, "shared").unwrap(),
            Lookup::Found(Value::number(7.0))
        );
        // Not found even though the caller's outer frames define it.
        assert_eq!(lookup(&mut state, "secret").unwrap(), Lookup::Missing);
    }

    #[test]
    fn assigning_constant_is_fatal() {
        let mut state = state_with_frames();
        let mut constant = Value::number(3.0);
        constant.constant = true;
        state.frames[0].vars.insert("pi".into(), constant);

        let err = assign(&mut state, "pi", Value::number(4.0)).unwrap_err();
        assert!(matches!(err, FatalError::AssignToConstant(name) if name == "pi"));
    }

    #[test]
    fn assigning_undeclared_is_fatal() {
        let mut state = state_with_frames();
        let err = assign(&mut state, "ghost", Value::null()).unwrap_err();
        assert!(matches!(err, FatalError::UndeclaredVariable(name) if name == "ghost"));
    }

    #[test]
    fn snapshot_shadows_outer_bindings() {
        let mut state = state_with_frames();
        state
            .current_frame_mut()
            .unwrap()
            .vars
            .insert("outer".into(), Value::number(99.0));

        let snapshot = snapshot_visible(&state);
        assert_eq!(snapshot.get("outer"), Some(&Value::number(99.0)));
    }

    #[test]
    fn lookup_substitutes_resolved_operations() {
        let mut state = state_with_frames();
        let id = state.registry.register(
            Some("result".into()),
            crate::interpreter::ast::Expr::Null,
            Default::default(),
        );
        let mut binding = Value::pending(id);
        binding.declared_type = Some("string".into());
        state.frames[0].vars.insert("result".into(), binding);

        assert_eq!(lookup(&mut state, "result").unwrap(), Lookup::Pending(id));

        state.registry.mark_running(id).unwrap();
        state.registry.complete(id, Value::string("done")).unwrap();

        match lookup(&mut state, "result").unwrap() {
            Lookup::Found(value) => {
                assert_eq!(value.as_str(), Some("done"));
                assert_eq!(value.declared_type.as_deref(), Some("string"));
            }
            other => panic!("expected resolved value, got {other:?}"),
        }
        // Written back into the frame.
        assert!(state.frames[0].vars["result"].pending_op.is_none());
    }
}
