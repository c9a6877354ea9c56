use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use crate::error::EngineError;

pub type ObjectMap = Rc<RefCell<HashMap<String, Value>>>;
pub type ArrayVec = Rc<RefCell<Vec<Value>>>;

/// A dynamic value observed by watchers and produced by accessors.
/// Containers have reference semantics: cloning a `Value` clones the
/// handle, not the contents.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Array(ArrayVec),
    Object(ObjectMap),
    Func(Rc<NativeFunction>),
    Opaque(Rc<OpaqueValue>),
}

/// Host function callable from expressions. Receives the bound
/// receiver and evaluated arguments.
pub struct NativeFunction {
    f: Box<dyn Fn(&FuncCtx) -> Result<Value, EngineError>>,
}

pub struct FuncCtx<'a> {
    pub this: &'a Value,
    pub args: &'a [Value],
}

impl NativeFunction {
    pub fn new(f: impl Fn(&FuncCtx) -> Result<Value, EngineError> + 'static) -> Rc<Self> {
        Rc::new(NativeFunction { f: Box::new(f) })
    }

    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value, EngineError> {
        (self.f)(&FuncCtx { this, args })
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativeFunction")
    }
}

/// Host object the expression language can hold but never inspect.
/// The kind drives the sandbox checks.
#[derive(Debug)]
pub struct OpaqueValue {
    pub kind: OpaqueKind,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpaqueKind {
    HostGlobal,
    DomNode,
    Other,
}

impl Value {
    pub fn object() -> Value {
        Value::Object(Rc::new(RefCell::new(HashMap::new())))
    }

    pub fn object_from<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Value {
        let map = pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Value::Object(Rc::new(RefCell::new(map)))
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items.into_iter().collect())))
    }

    pub fn native(f: impl Fn(&FuncCtx) -> Result<Value, EngineError> + 'static) -> Value {
        Value::Func(NativeFunction::new(f))
    }

    pub fn opaque(kind: OpaqueKind, label: impl Into<String>) -> Value {
        Value::Opaque(Rc::new(OpaqueValue { kind, label: label.into() }))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Undefined or null: the values member access short-circuits on.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Func(_) | Value::Opaque(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Func(_) => "function",
            Value::Opaque(_) => "opaque",
        }
    }

    /// Numeric coercion used by the arithmetic operators.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Num(n) => *n,
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            _ => f64::NAN,
        }
    }

    /// String coercion used by concatenation and the default filter
    /// comparator.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => num_to_string(*n),
            Value::Str(s) => s.clone(),
            Value::Array(items) => {
                let parts: Vec<String> =
                    items.borrow().iter().map(|v| v.to_display_string()).collect();
                parts.join(",")
            }
            Value::Object(_) => "[object]".to_string(),
            Value::Func(_) => "[function]".to_string(),
            Value::Opaque(o) => format!("[opaque {}]", o.label),
        }
    }

    /// Own-property read on objects; index read on arrays. Returns
    /// `Undefined` for anything else (no delegation here).
    pub fn get_member(&self, key: &str) -> Value {
        match self {
            Value::Object(map) => map.borrow().get(key).cloned().unwrap_or(Value::Undefined),
            Value::Array(items) => {
                if key == "length" {
                    return Value::Num(items.borrow().len() as f64);
                }
                match key.parse::<usize>() {
                    Ok(i) => items.borrow().get(i).cloned().unwrap_or(Value::Undefined),
                    Err(_) => Value::Undefined,
                }
            }
            _ => Value::Undefined,
        }
    }

    /// The collection-watcher predicate: arrays always qualify; an
    /// object qualifies only with a numeric `length` that is zero or
    /// accompanied by the `length - 1` index key. A bare object that
    /// merely carries a `length` property does not.
    pub fn is_array_like(&self) -> bool {
        match self {
            Value::Array(_) => true,
            Value::Object(map) => {
                let map = map.borrow();
                match map.get("length") {
                    Some(Value::Num(n)) if *n >= 0.0 && n.fract() == 0.0 => {
                        *n == 0.0 || map.contains_key(&num_to_string(n - 1.0))
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

/// JS-style number rendering: integral values print without a
/// fractional part.
pub fn num_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Reference identity / primitive equality. NaN is not equal to NaN
/// here; the watch loop adds that case separately.
pub fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
        (Value::Func(x), Value::Func(y)) => Rc::ptr_eq(x, y),
        (Value::Opaque(x), Value::Opaque(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Loose equality for the `==`/`!=` operators: null and undefined
/// match each other, numbers and strings compare numerically, and
/// booleans coerce to numbers. Containers only match by identity.
pub fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
        (Value::Num(n), Value::Str(_)) => b.to_number() == *n,
        (Value::Str(_), Value::Num(n)) => a.to_number() == *n,
        (Value::Bool(_), _) => {
            let n = a.to_number();
            loose_equals(&Value::Num(n), b)
        }
        (_, Value::Bool(_)) => {
            let n = b.to_number();
            loose_equals(a, &Value::Num(n))
        }
        _ => strict_equals(a, b),
    }
}

/// The comparison the digest loop uses: strict identity, with NaN
/// considered equal to itself so a NaN-valued watch settles.
pub fn watch_equals(a: &Value, b: &Value) -> bool {
    if let (Value::Num(x), Value::Num(y)) = (a, b) {
        if x.is_nan() && y.is_nan() {
            return true;
        }
    }
    strict_equals(a, b)
}

/// Structural equality. Cyclic graphs terminate via the visited set;
/// a revisited container pair is assumed equal. NaN equals NaN.
pub fn deep_equals(a: &Value, b: &Value) -> bool {
    fn go(a: &Value, b: &Value, visited: &mut HashSet<(usize, usize)>) -> bool {
        match (a, b) {
            (Value::Num(x), Value::Num(y)) => x == y || (x.is_nan() && y.is_nan()),
            (Value::Array(x), Value::Array(y)) => {
                if Rc::ptr_eq(x, y) {
                    return true;
                }
                let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
                if !visited.insert(pair) {
                    return true;
                }
                let (x, y) = (x.borrow(), y.borrow());
                x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| go(a, b, visited))
            }
            (Value::Object(x), Value::Object(y)) => {
                if Rc::ptr_eq(x, y) {
                    return true;
                }
                let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
                if !visited.insert(pair) {
                    return true;
                }
                let (x, y) = (x.borrow(), y.borrow());
                let keys: HashSet<&String> = x.keys().chain(y.keys()).collect();
                keys.into_iter().all(|k| {
                    let a = x.get(k).unwrap_or(&Value::Undefined);
                    let b = y.get(k).unwrap_or(&Value::Undefined);
                    go(a, b, visited)
                })
            }
            _ => strict_equals(a, b),
        }
    }
    go(a, b, &mut HashSet::new())
}

/// Deep copy preserving shared and cyclic structure. Functions and
/// opaques are shared, not copied.
pub fn deep_clone(value: &Value) -> Value {
    fn go(value: &Value, seen: &mut HashMap<usize, Value>) -> Value {
        match value {
            Value::Array(items) => {
                let key = Rc::as_ptr(items) as usize;
                if let Some(copy) = seen.get(&key) {
                    return copy.clone();
                }
                let copy = Rc::new(RefCell::new(Vec::with_capacity(items.borrow().len())));
                seen.insert(key, Value::Array(copy.clone()));
                for item in items.borrow().iter() {
                    copy.borrow_mut().push(go(item, seen));
                }
                Value::Array(copy)
            }
            Value::Object(map) => {
                let key = Rc::as_ptr(map) as usize;
                if let Some(copy) = seen.get(&key) {
                    return copy.clone();
                }
                let copy: ObjectMap = Rc::new(RefCell::new(HashMap::new()));
                seen.insert(key, Value::Object(copy.clone()));
                for (k, v) in map.borrow().iter() {
                    copy.borrow_mut().insert(k.clone(), go(v, seen));
                }
                Value::Object(copy)
            }
            other => other.clone(),
        }
    }
    go(value, &mut HashMap::new())
}

/// One-level copy: fresh container, shared element handles.
pub fn shallow_copy(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(Rc::new(RefCell::new(items.borrow().clone()))),
        Value::Object(map) => Value::Object(Rc::new(RefCell::new(map.borrow().clone()))),
        other => other.clone(),
    }
}

impl PartialEq for Value {
    /// Strict (identity) equality, mirroring the `===` operator.
    fn eq(&self, other: &Self) -> bool {
        strict_equals(self, other)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Num(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::array(items.into_iter().map(Value::from))
            }
            serde_json::Value::Object(map) => {
                Value::object_from(map.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}

impl Value {
    /// Lossy projection back to JSON; functions, opaques, and
    /// undefined become `null`, revisited containers too (cycles are
    /// not representable).
    pub fn to_json(&self) -> serde_json::Value {
        fn go(value: &Value, visited: &mut HashSet<usize>) -> serde_json::Value {
            match value {
                Value::Undefined | Value::Null => serde_json::Value::Null,
                Value::Bool(b) => serde_json::Value::Bool(*b),
                Value::Num(n) => serde_json::Number::from_f64(*n)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
                Value::Str(s) => serde_json::Value::String(s.clone()),
                Value::Array(items) => {
                    let key = Rc::as_ptr(items) as usize;
                    if !visited.insert(key) {
                        return serde_json::Value::Null;
                    }
                    let out = items.borrow().iter().map(|v| go(v, visited)).collect();
                    visited.remove(&key);
                    serde_json::Value::Array(out)
                }
                Value::Object(map) => {
                    let key = Rc::as_ptr(map) as usize;
                    if !visited.insert(key) {
                        return serde_json::Value::Null;
                    }
                    let out = map
                        .borrow()
                        .iter()
                        .map(|(k, v)| (k.clone(), go(v, visited)))
                        .collect();
                    visited.remove(&key);
                    serde_json::Value::Object(out)
                }
                Value::Func(_) | Value::Opaque(_) => serde_json::Value::Null,
            }
        }
        go(self, &mut HashSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_follows_host_rules() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Num(0.0).is_truthy());
        assert!(!Value::Num(f64::NAN).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Num(-1.0).is_truthy());
        assert!(Value::array([]).is_truthy());
    }

    #[test]
    fn strict_equality_is_identity_for_containers() {
        let a = Value::array([Value::Num(1.0)]);
        let b = Value::array([Value::Num(1.0)]);
        assert!(!strict_equals(&a, &b));
        assert!(strict_equals(&a, &a.clone()));
    }

    #[test]
    fn loose_equality_coerces() {
        assert!(loose_equals(&Value::Null, &Value::Undefined));
        assert!(loose_equals(&Value::Num(42.0), &Value::Str("42".into())));
        assert!(loose_equals(&Value::Bool(true), &Value::Num(1.0)));
        assert!(!loose_equals(&Value::Num(42.0), &Value::Str("43".into())));
    }

    #[test]
    fn watch_equals_settles_nan() {
        assert!(watch_equals(&Value::Num(f64::NAN), &Value::Num(f64::NAN)));
        assert!(!strict_equals(&Value::Num(f64::NAN), &Value::Num(f64::NAN)));
    }

    #[test]
    fn deep_equals_is_structural() {
        let a = Value::from(json!({"x": [1, 2], "y": {"z": "w"}}));
        let b = Value::from(json!({"x": [1, 2], "y": {"z": "w"}}));
        assert!(deep_equals(&a, &b));
        let c = Value::from(json!({"x": [1, 3], "y": {"z": "w"}}));
        assert!(!deep_equals(&a, &c));
    }

    #[test]
    fn deep_equals_terminates_on_cycles() {
        let a = Value::object();
        let b = Value::object();
        if let (Value::Object(ma), Value::Object(mb)) = (&a, &b) {
            ma.borrow_mut().insert("self".into(), a.clone());
            mb.borrow_mut().insert("self".into(), b.clone());
        }
        assert!(deep_equals(&a, &b));
    }

    #[test]
    fn deep_clone_detaches_structure() {
        let original = Value::from(json!({"inner": {"n": 1}}));
        let copy = deep_clone(&original);
        if let Value::Object(map) = &original {
            if let Some(Value::Object(inner)) = map.borrow().get("inner").cloned() {
                inner.borrow_mut().insert("n".into(), Value::Num(2.0));
            }
        }
        assert_eq!(copy.get_member("inner").get_member("n"), Value::Num(1.0));
    }

    #[test]
    fn deep_clone_preserves_cycles() {
        let a = Value::object();
        if let Value::Object(map) = &a {
            map.borrow_mut().insert("me".into(), a.clone());
        }
        let copy = deep_clone(&a);
        let inner = copy.get_member("me");
        assert!(strict_equals(&copy, &inner));
        assert!(!strict_equals(&copy, &a));
    }

    #[test]
    fn array_like_requires_last_index() {
        let arrayish = Value::object_from([
            ("length", Value::Num(2.0)),
            ("0", Value::from("a")),
            ("1", Value::from("b")),
        ]);
        assert!(arrayish.is_array_like());

        let bare = Value::object_from([("length", Value::Num(2.0))]);
        assert!(!bare.is_array_like());

        let empty = Value::object_from([("length", Value::Num(0.0))]);
        assert!(empty.is_array_like());
    }

    #[test]
    fn number_rendering_drops_integral_fraction() {
        assert_eq!(num_to_string(1.0), "1");
        assert_eq!(num_to_string(1.5), "1.5");
        assert_eq!(num_to_string(-0.0), "0");
    }

    #[test]
    fn json_roundtrip() {
        let v = Value::from(json!({"a": [1, "x", null, true]}));
        assert_eq!(v.to_json(), json!({"a": [1.0, "x", null, true]}));
    }
}
