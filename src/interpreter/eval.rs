//! Operator, access, and interpolation semantics.
//!
//! Everything here is pure with respect to the runtime state: the stepper
//! (and the wave executor, through [`eval_static`]) hands values in and gets
//! values or fatal errors back. Expected conditions come back as
//! error-flagged values; only genuine shape violations are fatal.

use std::collections::BTreeMap;

use crate::host::OperationPayload;
use crate::schedule::ContextSnapshot;

use super::ast::{BinaryOp, Expr, ExternalExpr, SourceLoc, TemplatePart, UnaryOp};
use super::value::{ErrorKind, Payload, Value};
use super::{FatalError, Result};

/// Apply a binary operator, propagating the leftmost operand error.
///
/// Null in arithmetic produces an error-flagged value rather than a fatal
/// error; applying an arithmetic operator to categories that can never
/// combine (e.g. array + number) is fatal.
pub fn apply_binary(op: BinaryOp, left: &Value, right: &Value, loc: SourceLoc) -> Result<Value> {
    if let Some(info) = Value::first_error(&[left, right]) {
        return Ok(Value::from_error(info.clone()));
    }

    match op {
        BinaryOp::And => {
            return Ok(if left.truthy() {
                right.plain_copy()
            } else {
                left.plain_copy()
            });
        }
        BinaryOp::Or => {
            return Ok(if left.truthy() {
                left.plain_copy()
            } else {
                right.plain_copy()
            });
        }
        BinaryOp::Eq => return Ok(Value::bool(left.data == right.data)),
        BinaryOp::Ne => return Ok(Value::bool(left.data != right.data)),
        _ => {}
    }

    // String concatenation takes priority over numeric addition.
    if op == BinaryOp::Add
        && matches!(
            (&left.data, &right.data),
            (Payload::Str(_), _) | (_, Payload::Str(_))
        )
    {
        return Ok(Value::string(format!(
            "{}{}",
            left.display_string(),
            right.display_string()
        )));
    }

    if matches!(left.data, Payload::Null) || matches!(right.data, Payload::Null) {
        return Ok(Value::error(
            ErrorKind::NullArithmetic,
            format!(
                "cannot apply '{}' to {} and {}",
                op.symbol(),
                left.data.type_name(),
                right.data.type_name()
            ),
            Some(loc),
        ));
    }

    match (&left.data, &right.data) {
        (Payload::Number(a), Payload::Number(b)) => {
            let result = match op {
                BinaryOp::Add => Value::number(a + b),
                BinaryOp::Sub => Value::number(a - b),
                BinaryOp::Mul => Value::number(a * b),
                BinaryOp::Div => Value::number(a / b),
                BinaryOp::Mod => Value::number(a % b),
                BinaryOp::Lt => Value::bool(a < b),
                BinaryOp::Le => Value::bool(a <= b),
                BinaryOp::Gt => Value::bool(a > b),
                BinaryOp::Ge => Value::bool(a >= b),
                BinaryOp::And | BinaryOp::Or | BinaryOp::Eq | BinaryOp::Ne => unreachable!(),
            };
            Ok(result)
        }
        (Payload::Str(a), Payload::Str(b)) => match op {
            BinaryOp::Lt => Ok(Value::bool(a < b)),
            BinaryOp::Le => Ok(Value::bool(a <= b)),
            BinaryOp::Gt => Ok(Value::bool(a > b)),
            BinaryOp::Ge => Ok(Value::bool(a >= b)),
            _ => Err(FatalError::OperandTypes {
                op: op.symbol(),
                left: left.data.type_name(),
                right: right.data.type_name(),
            }),
        },
        _ => Err(FatalError::OperandTypes {
            op: op.symbol(),
            left: left.data.type_name(),
            right: right.data.type_name(),
        }),
    }
}

/// Apply a unary operator, propagating an operand error.
pub fn apply_unary(op: UnaryOp, operand: &Value, loc: SourceLoc) -> Result<Value> {
    if let Some(info) = &operand.error {
        return Ok(Value::from_error(info.clone()));
    }
    match op {
        UnaryOp::Not => Ok(Value::bool(!operand.truthy())),
        UnaryOp::Neg => match &operand.data {
            Payload::Number(n) => Ok(Value::number(-n)),
            Payload::Null => Ok(Value::error(
                ErrorKind::NullArithmetic,
                "cannot negate null",
                Some(loc),
            )),
            other => Err(FatalError::UnaryOperand {
                op: "-",
                operand: other.type_name(),
            }),
        },
    }
}

/// Read a property off a value.
///
/// A missing field, a null receiver, and a non-object receiver are all
/// expected conditions and come back error-flagged.
pub fn access_member(receiver: &Value, property: &str, loc: SourceLoc) -> Value {
    if let Some(info) = &receiver.error {
        return Value::from_error(info.clone());
    }
    match &receiver.data {
        Payload::Object(entries) => match entries.get(property) {
            Some(value) => value.plain_copy(),
            None => Value::error(
                ErrorKind::MissingField,
                format!("object has no field '{property}'"),
                Some(loc),
            ),
        },
        other => Value::error(
            ErrorKind::MissingField,
            format!("cannot read field '{property}' of {}", other.type_name()),
            Some(loc),
        ),
    }
}

fn integral_index(receiver: &Value, n: f64) -> Result<i64> {
    if !n.is_finite() || n.fract() != 0.0 {
        return Err(FatalError::OperandTypes {
            op: "[]",
            left: receiver.data.type_name(),
            right: "fractional number",
        });
    }
    Ok(n as i64)
}

fn resolve_array_index(index: i64, len: usize) -> Result<usize> {
    let adjusted = if index < 0 { index + len as i64 } else { index };
    if adjusted < 0 || adjusted as usize >= len {
        return Err(FatalError::IndexOutOfBounds { index, len });
    }
    Ok(adjusted as usize)
}

/// Index a value.
///
/// Arrays and strings accept integer indices (negative counts from the
/// end); an out-of-range index is fatal. Objects accept string keys with a
/// missing key coming back error-flagged.
pub fn access_index(receiver: &Value, index: &Value, loc: SourceLoc) -> Result<Value> {
    if let Some(info) = Value::first_error(&[receiver, index]) {
        return Ok(Value::from_error(info.clone()));
    }
    match (&receiver.data, &index.data) {
        (Payload::Array(items), Payload::Number(n)) => {
            let at = resolve_array_index(integral_index(receiver, *n)?, items.len())?;
            Ok(items[at].plain_copy())
        }
        (Payload::Str(s), Payload::Number(n)) => {
            let chars: Vec<char> = s.chars().collect();
            let at = resolve_array_index(integral_index(receiver, *n)?, chars.len())?;
            Ok(Value::string(chars[at].to_string()))
        }
        (Payload::Object(_), Payload::Str(key)) => Ok(access_member(receiver, key, loc)),
        _ => Err(FatalError::OperandTypes {
            op: "[]",
            left: receiver.data.type_name(),
            right: index.data.type_name(),
        }),
    }
}

fn slice_bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let clamp = |raw: i64| -> usize {
        let adjusted = if raw < 0 { raw + len as i64 } else { raw };
        adjusted.clamp(0, len as i64) as usize
    };
    let from = start.map(clamp).unwrap_or(0);
    let to = end.map(clamp).unwrap_or(len);
    (from, to.max(from))
}

/// Slice an array or string with optional bounds.
///
/// Unlike single indexing, slice bounds clamp to the collection instead of
/// failing; negative bounds count from the end.
pub fn access_slice(
    receiver: &Value,
    start: Option<&Value>,
    end: Option<&Value>,
    _loc: SourceLoc,
) -> Result<Value> {
    let mut operands = vec![receiver];
    operands.extend(start);
    operands.extend(end);
    if let Some(info) = Value::first_error(&operands) {
        return Ok(Value::from_error(info.clone()));
    }

    let bound = |value: Option<&Value>, side: &'static str| -> Result<Option<i64>> {
        match value {
            None => Ok(None),
            Some(v) => match v.as_number() {
                Some(n) => Ok(Some(n as i64)),
                None => Err(FatalError::OperandTypes {
                    op: "[:]",
                    left: side,
                    right: v.data.type_name(),
                }),
            },
        }
    };
    let from = bound(start, "slice start")?;
    let to = bound(end, "slice end")?;

    match &receiver.data {
        Payload::Array(items) => {
            let (a, b) = slice_bounds(from, to, items.len());
            Ok(Value::array(
                items[a..b].iter().map(Value::plain_copy).collect(),
            ))
        }
        Payload::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (a, b) = slice_bounds(from, to, chars.len());
            Ok(Value::string(chars[a..b].iter().collect::<String>()))
        }
        other => Err(FatalError::OperandTypes {
            op: "[:]",
            left: other.type_name(),
            right: "range",
        }),
    }
}

/// Render a string template through a name resolver.
///
/// `Deferred` placeholders are written back verbatim for the external
/// collaborator; `Expand` placeholders resolve through the callback. An
/// error-flagged expansion flags the whole rendering.
pub fn render_template(
    parts: &[TemplatePart],
    resolve: &mut dyn FnMut(&str) -> Result<Value>,
) -> Result<Value> {
    let mut rendered = String::new();
    for part in parts {
        match part {
            TemplatePart::Text(text) => rendered.push_str(text),
            TemplatePart::Deferred(name) => {
                rendered.push('{');
                rendered.push_str(name);
                rendered.push('}');
            }
            TemplatePart::Expand(name) => {
                let value = resolve(name)?;
                if value.is_error() {
                    return Ok(value);
                }
                rendered.push_str(&value.display_string());
            }
        }
    }
    Ok(Value::string(rendered))
}

/// Evaluate an expression against a frozen snapshot, outside the stepper.
///
/// Used when resolving deferred operation payloads inside a wave: no scope
/// chain, no suspension, no user function calls. Constructs that need the
/// stepper are rejected as fatal.
pub fn eval_static(expr: &Expr, snapshot: &ContextSnapshot) -> Result<Value> {
    let loc = SourceLoc::default();
    match expr {
        Expr::Null => Ok(Value::null()),
        Expr::Bool(b) => Ok(Value::bool(*b)),
        Expr::Number(n) => Ok(Value::number(*n)),
        Expr::Str(s) => Ok(Value::string(s.clone())),
        Expr::Template(parts) => render_template(parts, &mut |name| {
            snapshot
                .get(name)
                .map(Value::plain_copy)
                .ok_or_else(|| FatalError::UndeclaredVariable(name.to_string()))
        }),
        Expr::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_static(item, snapshot)?);
            }
            Ok(Value::array(values))
        }
        Expr::Object(entries) => {
            let mut object = BTreeMap::new();
            for (key, value) in entries {
                object.insert(key.clone(), eval_static(value, snapshot)?);
            }
            Ok(Value::object(object))
        }
        Expr::Identifier(name) => snapshot
            .get(name)
            .map(Value::plain_copy)
            .ok_or_else(|| FatalError::UndeclaredVariable(name.clone())),
        Expr::Member { object, property } => {
            let receiver = eval_static(object, snapshot)?;
            Ok(access_member(&receiver, property, loc))
        }
        Expr::Index { object, index } => {
            let receiver = eval_static(object, snapshot)?;
            let index = eval_static(index, snapshot)?;
            access_index(&receiver, &index, loc)
        }
        Expr::Slice { object, start, end } => {
            let receiver = eval_static(object, snapshot)?;
            let start = start
                .as_deref()
                .map(|e| eval_static(e, snapshot))
                .transpose()?;
            let end = end
                .as_deref()
                .map(|e| eval_static(e, snapshot))
                .transpose()?;
            access_slice(&receiver, start.as_ref(), end.as_ref(), loc)
        }
        Expr::Unary { op, operand } => {
            let operand = eval_static(operand, snapshot)?;
            apply_unary(*op, &operand, loc)
        }
        Expr::Binary { op, left, right } => {
            let left = eval_static(left, snapshot)?;
            let right = eval_static(right, snapshot)?;
            apply_binary(*op, &left, &right, loc)
        }
        Expr::Call { .. } => Err(FatalError::UnsupportedDeferred("function call")),
        Expr::External(_) => Err(FatalError::UnsupportedDeferred("nested external operation")),
    }
}

/// Resolve a deferred external expression into an executable payload using
/// the snapshot the wave attached to the operation.
pub fn resolve_operation_payload(
    external: &ExternalExpr,
    snapshot: &ContextSnapshot,
) -> Result<OperationPayload> {
    match external {
        ExternalExpr::ModelCall {
            prompt,
            model,
            context,
        } => {
            // An error-flagged prompt or selector must fail the operation;
            // rendering it would read a meaningless payload.
            let prompt = eval_static(prompt, snapshot)?;
            if let Some(info) = &prompt.error {
                return Err(FatalError::ErrorInput(info.message.clone()));
            }
            let prompt = prompt.display_string();
            let model = model
                .as_deref()
                .map(|e| eval_static(e, snapshot))
                .transpose()?;
            if let Some(info) = model.as_ref().and_then(|v| v.error.as_ref()) {
                return Err(FatalError::ErrorInput(info.message.clone()));
            }
            let model = model.map(|v| v.display_string());
            let mut values = Vec::with_capacity(context.len());
            for expr in context {
                values.push(eval_static(expr, snapshot)?);
            }
            Ok(OperationPayload::ModelCall {
                prompt,
                model,
                context: values,
            })
        }
        ExternalExpr::CodeBlock { body, params } => {
            let mut bindings = BTreeMap::new();
            for name in params {
                let value = snapshot
                    .get(name)
                    .map(Value::plain_copy)
                    .ok_or_else(|| FatalError::UndeclaredVariable(name.clone()))?;
                bindings.insert(name.clone(), value);
            }
            Ok(OperationPayload::CodeEval {
                body: body.clone(),
                bindings,
            })
        }
        ExternalExpr::ToolCall { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for expr in args {
                values.push(eval_static(expr, snapshot)?);
            }
            Ok(OperationPayload::Invocation {
                name: name.clone(),
                args: values,
            })
        }
    }
}
