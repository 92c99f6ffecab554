//! The evaluator's value model.
//!
//! A tagged variant over undefined, null, booleans, IEEE-754 numbers,
//! strings, arrays, insertion-ordered objects and functions. Arrays carry
//! the sequence flags the evaluator uses to decide flattening and singleton
//! unwrapping; FLASH rules evaluate to a dedicated result value that the
//! composer consumes.

use std::fmt;
use std::rc::Rc;

use flash_model::StructureKind;
use flash_parser::ast::NodeRef;
use indexmap::IndexMap;

use crate::frame::FrameRef;
use crate::regex_engine::CompiledRegex;
use crate::signature::Signature;
use crate::NativeImpl;

/// Flags carried by array values.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ArrayFlags {
    /// A query-result sequence (subject to flattening and singleton rules).
    pub sequence: bool,
    /// Keep a singleton sequence an array.
    pub keep_singleton: bool,
    /// An explicit array constructor; never re-flattened.
    pub cons: bool,
    /// Wraps the whole input document.
    pub outer_wrapper: bool,
    /// Items are tuple-stream binding objects.
    pub tuple_stream: bool,
}

/// An array value plus its sequence flags.
#[derive(Clone, Debug)]
pub struct ArrayValue {
    pub items: Vec<Value>,
    pub flags: ArrayFlags,
}

/// An insertion-ordered object.
pub type ObjectValue = IndexMap<String, Value>;

/// The result of evaluating a FLASH rule: which JSON key (or `name:slice`
/// grouping key) it writes, the composed value, and the element kind.
#[derive(Clone, Debug)]
pub struct FlashRuleResult {
    pub key: String,
    pub value: Value,
    pub kind: Option<StructureKind>,
}

/// A lambda closure: the body node plus the captured environment and input.
pub struct LambdaValue {
    pub params: Vec<String>,
    pub body: NodeRef,
    pub env: FrameRef,
    pub input: Value,
    pub signature: Option<Signature>,
    /// A deferred tail call: the trampoline re-enters `body` instead of
    /// growing the stack.
    pub thunk: bool,
}

impl fmt::Debug for LambdaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LambdaValue")
            .field("params", &self.params)
            .field("thunk", &self.thunk)
            .finish_non_exhaustive()
    }
}

/// A host-registered native function.
pub struct NativeValue {
    pub name: String,
    pub signature: Option<Signature>,
    pub implementation: NativeImpl,
}

impl fmt::Debug for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeValue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// One argument slot of a partial application.
#[derive(Clone, Debug)]
pub enum PartialArg {
    Bound(Value),
    Placeholder,
}

/// A partially applied function: the underlying procedure plus bound and
/// placeholder argument slots.
#[derive(Debug)]
pub struct PartialValue {
    pub procedure: FunctionValue,
    pub args: Vec<PartialArg>,
}

/// A function value.
#[derive(Clone, Debug)]
pub enum FunctionValue {
    Lambda(Rc<LambdaValue>),
    Native(Rc<NativeValue>),
    Partial(Rc<PartialValue>),
    /// A compiled regex literal; applying it to a string yields a match
    /// object.
    Regex(Rc<CompiledRegex>),
}

/// A value produced by evaluation.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(ArrayValue),
    Object(ObjectValue),
    Function(FunctionValue),
    FlashRule(Rc<FlashRuleResult>),
}

impl Value {
    /// An empty result sequence.
    pub fn sequence(items: Vec<Value>) -> Value {
        Value::Array(ArrayValue {
            items,
            flags: ArrayFlags { sequence: true, ..ArrayFlags::default() },
        })
    }

    /// A plain (user-visible) array.
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(ArrayValue { items, flags: ArrayFlags::default() })
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Whether the value is an integer-valued number.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    /// Effective boolean value (the `$boolean` casting rules): empty
    /// strings, zero, null, undefined, empty arrays/objects and functions
    /// are false; arrays reduce over their items.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => match a.items.len() {
                0 => false,
                1 => a.items[0].truthy(),
                _ => a.items.iter().any(|v| v.truthy()),
            },
            Value::Object(o) => !o.is_empty(),
            Value::Function(_) => false,
            Value::FlashRule(r) => r.value.truthy(),
        }
    }

    /// Deep structural equality. Arrays compare item-wise (flags ignored),
    /// objects compare as maps. Functions never compare equal.
    pub fn deep_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.items.len() == b.items.len()
                    && a.items.iter().zip(&b.items).all(|(x, y)| x.deep_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).map(|w| v.deep_eq(w)).unwrap_or(false))
            }
            _ => false,
        }
    }

    /// Append `other` onto `self`, the sequence-building primitive: either
    /// side undefined yields the other; arrays concatenate into a sequence.
    pub fn append(self, other: Value) -> Value {
        if self.is_undefined() {
            return other;
        }
        if other.is_undefined() {
            return self;
        }
        let mut items = match self {
            Value::Array(a) => a.items,
            v => vec![v],
        };
        match other {
            Value::Array(b) => items.extend(b.items),
            v => items.push(v),
        }
        Value::sequence(items)
    }

    /// Convert to a JSON value. Functions (and undefined) have no JSON
    /// representation and yield `None`.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Undefined => None,
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .or(Some(serde_json::Value::Null)),
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
            Value::Array(a) => Some(serde_json::Value::Array(
                a.items.iter().filter_map(|v| v.to_json()).collect(),
            )),
            Value::Object(o) => {
                let mut map = serde_json::Map::new();
                for (k, v) in o {
                    if let Some(j) = v.to_json() {
                        map.insert(k.clone(), j);
                    }
                }
                Some(serde_json::Value::Object(map))
            }
            Value::Function(_) => None,
            Value::FlashRule(r) => r.value.to_json(),
        }
    }

    /// Build a value from JSON.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let mut obj = ObjectValue::default();
                for (k, v) in map {
                    obj.insert(k.clone(), Value::from_json(v));
                }
                Value::Object(obj)
            }
        }
    }

    /// String rendering used by `&` concatenation and diagnostics: strings
    /// pass through, numbers drop a trailing `.0`, structures serialize as
    /// JSON, functions and undefined render empty.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => String::new(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Function(_) => String::new(),
            other => other
                .to_json()
                .map(|j| j.to_string())
                .unwrap_or_default(),
        }
    }
}

/// Format a number the way JSON does: integers without a decimal point.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::string("").truthy());
        assert!(Value::string("x").truthy());
        assert!(!Value::array(vec![]).truthy());
        assert!(Value::array(vec![Value::Bool(true)]).truthy());
        assert!(!Value::array(vec![Value::Bool(false)]).truthy());
        assert!(!Value::Object(ObjectValue::default()).truthy());
    }

    #[test]
    fn deep_equality_is_structural() {
        let a = Value::from_json(&serde_json::json!({"a": [1, 2], "b": "x"}));
        let b = Value::from_json(&serde_json::json!({"b": "x", "a": [1, 2]}));
        assert!(a.deep_eq(&b));
        let c = Value::from_json(&serde_json::json!({"a": [1, 3], "b": "x"}));
        assert!(!a.deep_eq(&c));
    }

    #[test]
    fn append_builds_sequences() {
        let appended = Value::Number(1.0).append(Value::Number(2.0));
        let arr = appended.as_array().unwrap();
        assert_eq!(arr.items.len(), 2);
        assert!(arr.flags.sequence);

        assert!(Value::Undefined.append(Value::Undefined).is_undefined());
        assert_eq!(
            Value::Undefined.append(Value::Number(5.0)).as_f64(),
            Some(5.0)
        );
    }

    #[test]
    fn json_round_trip_preserves_key_order() {
        let json = serde_json::json!({"z": 1, "a": 2, "m": 3});
        let value = Value::from_json(&json);
        let back = value.to_json().unwrap();
        let keys: Vec<&String> = back.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-0.0), "0");
    }
}
