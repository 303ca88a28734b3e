//! Unified value/error wrapper for every runtime datum.
//!
//! Every value the interpreter touches is a [`Value`]: a tagged payload plus
//! error state, provenance, constancy, an optional declared type, and an
//! optional reference to a still-pending async operation. Expected runtime
//! conditions (null arithmetic, missing fields, failed external operations)
//! travel through ordinary data paths as error-flagged values and never
//! unwind the instruction stack.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schedule::OpId;

use super::ast::SourceLoc;

/// Raw payload carried by a [`Value`].
///
/// An explicit discriminant: value category is a compile-time-checked tag,
/// never a runtime shape probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// The null sentinel.
    Null,
    /// Boolean.
    Bool(bool),
    /// Number (IEEE double).
    Number(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered array of values.
    Array(Vec<Value>),
    /// Keyed object with deterministic field ordering.
    Object(BTreeMap<String, Value>),
}

impl Payload {
    /// Human-readable name of the payload category, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Null => "null",
            Payload::Bool(_) => "boolean",
            Payload::Number(_) => "number",
            Payload::Str(_) => "string",
            Payload::Array(_) => "array",
            Payload::Object(_) => "object",
        }
    }
}

/// Category of a value-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Arithmetic involving the null sentinel.
    NullArithmetic,
    /// A destructured or accessed field was absent.
    MissingField,
    /// An external operation resolved to a failure.
    OperationFailed,
}

/// Structured details of a value-level error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Where the error arose, when known.
    pub location: Option<SourceLoc>,
}

impl ErrorInfo {
    /// Construct error details.
    pub fn new(kind: ErrorKind, message: impl Into<String>, location: Option<SourceLoc>) -> Self {
        Self {
            kind,
            message: message.into(),
            location,
        }
    }
}

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Provenance {
    /// Computed by the interpreter itself.
    #[default]
    None,
    /// Produced by an external operation (model, sandbox, tool).
    External,
    /// Supplied by the embedding user/application.
    User,
}

/// Record of one tool invocation made while producing a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    /// Tool identifier.
    pub name: String,
    /// Arguments the tool was called with.
    pub arguments: serde_json::Value,
    /// Output returned by the tool, if any.
    pub output: Option<serde_json::Value>,
}

/// Usage counters reported by an external operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    /// Tokens consumed by the request side.
    pub input_tokens: u64,
    /// Tokens produced by the response side.
    pub output_tokens: u64,
}

/// Auxiliary metadata attached to externally produced values.
///
/// Preserved only across direct external-call assignment; stripped by
/// [`Value::plain_copy`] on ordinary copies.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueMeta {
    /// Tool invocations made while producing the value.
    pub tool_calls: Vec<ToolRecord>,
    /// Usage counters for the producing operation.
    pub usage: UsageCounters,
}

/// The universal wrapper around every runtime datum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    /// Raw payload. Meaningless when `error` is set.
    pub data: Payload,
    /// Error state; `Some` marks the value as error-flagged.
    pub error: Option<ErrorInfo>,
    /// Whether the binding holding this value is constant.
    pub constant: bool,
    /// Declared type tag, when the binding carried one.
    pub declared_type: Option<String>,
    /// Provenance tag.
    pub provenance: Provenance,
    /// Async operation this value stands in for, while unresolved.
    pub pending_op: Option<OpId>,
    /// Auxiliary metadata from external production.
    pub meta: Option<ValueMeta>,
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}

impl Value {
    /// The null value.
    pub fn null() -> Self {
        Value::of(Payload::Null)
    }

    /// Wrap a payload with no flags set.
    pub fn of(data: Payload) -> Self {
        Self {
            data,
            error: None,
            constant: false,
            declared_type: None,
            provenance: Provenance::None,
            pending_op: None,
            meta: None,
        }
    }

    /// Boolean value.
    pub fn bool(b: bool) -> Self {
        Value::of(Payload::Bool(b))
    }

    /// Numeric value.
    pub fn number(n: f64) -> Self {
        Value::of(Payload::Number(n))
    }

    /// String value.
    pub fn string(s: impl Into<String>) -> Self {
        Value::of(Payload::Str(s.into()))
    }

    /// Array value.
    pub fn array(items: Vec<Value>) -> Self {
        Value::of(Payload::Array(items))
    }

    /// Object value.
    pub fn object(entries: BTreeMap<String, Value>) -> Self {
        Value::of(Payload::Object(entries))
    }

    /// Error-flagged value carrying the given details.
    pub fn from_error(info: ErrorInfo) -> Self {
        Self {
            error: Some(info),
            ..Value::null()
        }
    }

    /// Convenience constructor for an error-flagged value.
    pub fn error(kind: ErrorKind, message: impl Into<String>, location: Option<SourceLoc>) -> Self {
        Value::from_error(ErrorInfo::new(kind, message, location))
    }

    /// Placeholder value for a not-yet-resolved async operation.
    pub fn pending(op: OpId) -> Self {
        Self {
            pending_op: Some(op),
            ..Value::null()
        }
    }

    /// Whether the error flag is set.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the value still stands in for an unresolved operation.
    pub fn is_pending(&self) -> bool {
        self.pending_op.is_some()
    }

    /// Ordinary copy: payload and flags survive, auxiliary metadata does not.
    pub fn plain_copy(&self) -> Value {
        Value {
            meta: None,
            constant: false,
            ..self.clone()
        }
    }

    /// Leftmost error among the operands, if any.
    pub fn first_error<'a>(operands: &[&'a Value]) -> Option<&'a ErrorInfo> {
        operands.iter().find_map(|v| v.error.as_ref())
    }

    /// Truthiness used by branches and logical operators.
    ///
    /// Error-flagged values are falsy so a failed operation steers control
    /// flow without a third error channel.
    pub fn truthy(&self) -> bool {
        if self.is_error() {
            return false;
        }
        match &self.data {
            Payload::Null => false,
            Payload::Bool(b) => *b,
            Payload::Number(n) => *n != 0.0 && !n.is_nan(),
            Payload::Str(s) => !s.is_empty(),
            Payload::Array(_) | Payload::Object(_) => true,
        }
    }

    /// String reference when the payload is a string.
    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload when present.
    pub fn as_number(&self) -> Option<f64> {
        match &self.data {
            Payload::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Render the payload for interpolation and string concatenation.
    ///
    /// Null renders as the empty string in string contexts.
    pub fn display_string(&self) -> String {
        match &self.data {
            Payload::Null => String::new(),
            Payload::Bool(b) => b.to_string(),
            Payload::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Payload::Str(s) => s.clone(),
            Payload::Array(_) | Payload::Object(_) => self.to_json().to_string(),
        }
    }

    /// Convert the payload into a plain JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match &self.data {
            Payload::Null => serde_json::Value::Null,
            Payload::Bool(b) => serde_json::Value::Bool(*b),
            Payload::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    serde_json::Value::Number((*n as i64).into())
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Payload::Str(s) => serde_json::Value::String(s.clone()),
            Payload::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Payload::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Build a value from a plain JSON payload.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::null(),
            serde_json::Value::Bool(b) => Value::bool(*b),
            serde_json::Value::Number(n) => Value::number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::string(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_copy_strips_metadata_and_constancy() {
        let mut value = Value::string("answer");
        value.constant = true;
        value.provenance = Provenance::External;
        value.meta = Some(ValueMeta {
            tool_calls: vec![ToolRecord {
                name: "search".into(),
                arguments: serde_json::json!({"q": "rust"}),
                output: None,
            }],
            usage: UsageCounters {
                input_tokens: 10,
                output_tokens: 3,
            },
        });

        let copy = value.plain_copy();
        assert!(copy.meta.is_none());
        assert!(!copy.constant);
        assert_eq!(copy.provenance, Provenance::External);
        assert_eq!(copy.data, value.data);
        assert!(value.meta.is_some());
    }

    #[test]
    fn error_values_are_falsy_and_flagged() {
        let err = Value::error(ErrorKind::NullArithmetic, "null - 1", None);
        assert!(err.is_error());
        assert!(!err.truthy());
    }

    #[test]
    fn truthiness_follows_payload() {
        assert!(!Value::null().truthy());
        assert!(!Value::number(0.0).truthy());
        assert!(Value::number(2.5).truthy());
        assert!(!Value::string("").truthy());
        assert!(Value::string("x").truthy());
        assert!(Value::array(vec![]).truthy());
    }

    #[test]
    fn first_error_picks_leftmost() {
        let left = Value::error(ErrorKind::MissingField, "no field a", None);
        let right = Value::error(ErrorKind::NullArithmetic, "null * 2", None);
        let ok = Value::number(1.0);

        let found = Value::first_error(&[&left, &right]).unwrap();
        assert_eq!(found.kind, ErrorKind::MissingField);
        let found = Value::first_error(&[&ok, &right]).unwrap();
        assert_eq!(found.kind, ErrorKind::NullArithmetic);
        assert!(Value::first_error(&[&ok]).is_none());
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let json = serde_json::json!({"items": [1, "two", null], "ok": true});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);

        // Integral numbers stay integers; fractions stay floats.
        assert_eq!(Value::number(1.0).to_json(), serde_json::json!(1));
        assert_eq!(Value::number(1.5).to_json(), serde_json::json!(1.5));
    }

    #[test]
    fn numbers_display_without_trailing_fraction() {
        assert_eq!(Value::number(3.0).display_string(), "3");
        assert_eq!(Value::number(3.5).display_string(), "3.5");
        assert_eq!(Value::null().display_string(), "");
    }
}
