use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::EngineError;
use crate::value::{deep_equals, Value};

pub type FilterFn = dyn Fn(&Value, &[Value]) -> Result<Value, EngineError>;

/// A named value transformer invokable through the pipe operator.
/// `stateful` marks filters whose output depends on out-of-band state,
/// which disables constant classification of expressions containing
/// them.
#[derive(Clone)]
pub struct Filter {
    func: Rc<FilterFn>,
    stateful: bool,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("stateful", &self.stateful)
            .finish()
    }
}

impl Filter {
    pub fn new(f: impl Fn(&Value, &[Value]) -> Result<Value, EngineError> + 'static) -> Self {
        Filter { func: Rc::new(f), stateful: false }
    }

    pub fn stateful(f: impl Fn(&Value, &[Value]) -> Result<Value, EngineError> + 'static) -> Self {
        Filter { func: Rc::new(f), stateful: true }
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    pub fn call(&self, input: &Value, args: &[Value]) -> Result<Value, EngineError> {
        (self.func)(input, args)
    }
}

/// Name → filter store. The process-wide instance lives in a
/// thread-local (the engine is single-threaded by design); the free
/// functions below operate on it.
pub struct FilterRegistry {
    filters: HashMap<String, Filter>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        FilterRegistry { filters: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("filter", filter_filter)
            .expect("valid builtin name");
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: impl FnOnce() -> Filter,
    ) -> Result<Filter, EngineError> {
        if !is_valid_name(name) {
            return Err(EngineError::registration(format!(
                "'{}' is not a valid filter name",
                name
            )));
        }
        let filter = factory();
        self.filters.insert(name.to_string(), filter.clone());
        Ok(filter)
    }

    pub fn register_many(
        &mut self,
        entries: Vec<(&str, Box<dyn FnOnce() -> Filter>)>,
    ) -> Result<Vec<Filter>, EngineError> {
        let mut out = Vec::with_capacity(entries.len());
        for (name, factory) in entries {
            out.push(self.register(name, factory)?);
        }
        Ok(out)
    }

    pub fn lookup(&self, name: &str) -> Option<Filter> {
        self.filters.get(name).cloned()
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

thread_local! {
    static REGISTRY: RefCell<FilterRegistry> = RefCell::new(FilterRegistry::with_builtins());
}

pub fn register(name: &str, factory: impl FnOnce() -> Filter) -> Result<Filter, EngineError> {
    REGISTRY.with(|r| r.borrow_mut().register(name, factory))
}

pub fn register_many(
    entries: Vec<(&str, Box<dyn FnOnce() -> Filter>)>,
) -> Result<Vec<Filter>, EngineError> {
    REGISTRY.with(|r| r.borrow_mut().register_many(entries))
}

pub fn lookup(name: &str) -> Option<Filter> {
    REGISTRY.with(|r| r.borrow().lookup(name))
}

/// Empties the registry, builtins included. Intended for test
/// isolation; `install_builtins` restores the stock set.
pub fn clear() {
    REGISTRY.with(|r| r.borrow_mut().clear());
}

pub fn install_builtins() {
    REGISTRY.with(|r| {
        r.borrow_mut()
            .register("filter", filter_filter)
            .expect("valid builtin name");
    });
}

type Comparator = Rc<dyn Fn(&Value, &Value) -> Result<bool, EngineError>>;

/// The built-in "filter" filter: `(array, criterion, cmp?)`. The
/// criterion is a predicate function, a primitive matched by the
/// comparator, or an object pattern matched key-by-key with `$` as the
/// wildcard key. `cmp` is `true` for structural equality, a binary
/// function, or absent for case-insensitive substring containment.
pub fn filter_filter() -> Filter {
    Filter::new(|input, args| {
        let items = match input {
            Value::Array(items) => items.clone(),
            v if v.is_nil() => return Ok(input.clone()),
            _ => {
                return Err(EngineError::user(format!(
                    "expected an array to filter, got {}",
                    input.type_name()
                )))
            }
        };
        let criterion = args.first().cloned().unwrap_or(Value::Undefined);
        let comparator = make_comparator(args.get(1).cloned().unwrap_or(Value::Undefined));

        let source: Vec<Value> = items.borrow().clone();
        let mut out = Vec::new();
        match &criterion {
            Value::Func(predicate) => {
                for item in &source {
                    if predicate.call(&Value::Undefined, &[item.clone()])?.is_truthy() {
                        out.push(item.clone());
                    }
                }
            }
            Value::Undefined => return Ok(input.clone()),
            _ => {
                // An object pattern carrying `$` also matches bare
                // primitives against the wildcard alone.
                let wildcard = match &criterion {
                    Value::Object(map) => map.borrow().get("$").cloned(),
                    _ => None,
                };
                for item in &source {
                    let matched = match (&wildcard, item.is_object()) {
                        (Some(expected), false) => {
                            deep_compare(item, expected, &comparator, false, false)?
                        }
                        _ => deep_compare(item, &criterion, &comparator, true, false)?,
                    };
                    if matched {
                        out.push(item.clone());
                    }
                }
            }
        }
        Ok(Value::array(out))
    })
}

fn make_comparator(cmp: Value) -> Comparator {
    match cmp {
        Value::Bool(true) => Rc::new(|actual, expected| Ok(deep_equals(actual, expected))),
        Value::Func(f) => Rc::new(move |actual, expected| {
            Ok(f.call(&Value::Undefined, &[actual.clone(), expected.clone()])?
                .is_truthy())
        }),
        _ => Rc::new(|actual, expected| Ok(default_comparator(actual, expected))),
    }
}

/// Default match: undefined never matches, null matches only null,
/// containers never match, otherwise case-insensitive substring
/// containment of the expected text in the actual text.
fn default_comparator(actual: &Value, expected: &Value) -> bool {
    if actual.is_undefined() {
        return false;
    }
    if matches!(actual, Value::Null) || matches!(expected, Value::Null) {
        return matches!(actual, Value::Null) && matches!(expected, Value::Null);
    }
    if is_container(expected) || is_container(actual) {
        return false;
    }
    let actual = actual.to_display_string().to_lowercase();
    let expected = expected.to_display_string().to_lowercase();
    actual.contains(&expected)
}

fn is_container(v: &Value) -> bool {
    matches!(v, Value::Array(_) | Value::Object(_) | Value::Func(_) | Value::Opaque(_))
}

/// Recursive criterion match. A string criterion starting with `!`
/// negates the match on the remainder. Arrays match when any element
/// matches. With `match_any_prop`, an object matches when any of its
/// values matches; `dont_match_whole` suppresses the fallback
/// comparison against the object itself during that descent.
pub fn deep_compare(
    actual: &Value,
    expected: &Value,
    comparator: &Comparator,
    match_any_prop: bool,
    dont_match_whole: bool,
) -> Result<bool, EngineError> {
    if let Value::Str(s) = expected {
        if let Some(rest) = s.strip_prefix('!') {
            let inner = Value::Str(rest.to_string());
            return Ok(!deep_compare(actual, &inner, comparator, match_any_prop, dont_match_whole)?);
        }
    }

    match actual {
        Value::Array(items) => {
            let snapshot: Vec<Value> = items.borrow().clone();
            for item in &snapshot {
                if deep_compare(item, expected, comparator, match_any_prop, false)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Object(map) => {
            if match_any_prop {
                let snapshot: Vec<(String, Value)> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (key, item) in &snapshot {
                    if key == "$" {
                        continue;
                    }
                    if deep_compare(item, expected, comparator, true, true)? {
                        return Ok(true);
                    }
                }
                if dont_match_whole {
                    Ok(false)
                } else {
                    deep_compare(actual, expected, comparator, false, false)
                }
            } else if let Value::Object(expected_map) = expected {
                let pattern: Vec<(String, Value)> = expected_map
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (key, expected_val) in &pattern {
                    if matches!(expected_val, Value::Undefined | Value::Func(_)) {
                        continue;
                    }
                    let is_wildcard = key == "$";
                    let actual_val = if is_wildcard {
                        actual.clone()
                    } else {
                        actual.get_member(key)
                    };
                    if !deep_compare(&actual_val, expected_val, comparator, is_wildcard, is_wildcard)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            } else {
                comparator(actual, expected)
            }
        }
        Value::Func(_) => Ok(false),
        _ => comparator(actual, expected),
    }
}
