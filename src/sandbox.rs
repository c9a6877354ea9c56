use std::collections::HashSet;
use std::rc::Rc;

use once_cell::sync::Lazy;

use crate::error::SecurityError;
use crate::value::{OpaqueKind, Value};

/// Member names expressions may never dereference, on any object.
static FORBIDDEN_MEMBERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "constructor",
        "__proto__",
        "__defineGetter__",
        "__defineSetter__",
        "__lookupGetter__",
        "__lookupSetter__",
    ]
    .into_iter()
    .collect()
});

/// Function members that re-bind or re-enter the host call machinery.
static FORBIDDEN_INVOCATIONS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["call", "apply", "bind"].into_iter().collect());

pub fn ensure_safe_member_name(name: &str) -> Result<(), SecurityError> {
    if FORBIDDEN_MEMBERS.contains(name) {
        return Err(SecurityError::ForbiddenMember(name.to_string()));
    }
    Ok(())
}

/// Checks a value flowing out of a dereference or call. Opaque host
/// objects are classified by kind; plain objects are screened with the
/// same heuristics the reference sandbox uses.
pub fn ensure_safe_object(value: &Value) -> Result<(), SecurityError> {
    match value {
        Value::Opaque(o) => match o.kind {
            OpaqueKind::HostGlobal => Err(SecurityError::HostGlobal),
            OpaqueKind::DomNode => Err(SecurityError::DomNode),
            OpaqueKind::Other => Ok(()),
        },
        Value::Object(map) => {
            let map_ref = map.borrow();
            // Host global: timer + document + location + alert present
            // at once.
            let has_timer =
                map_ref.contains_key("setTimeout") || map_ref.contains_key("setInterval");
            if has_timer
                && map_ref.contains_key("document")
                && map_ref.contains_key("location")
                && map_ref.contains_key("alert")
            {
                return Err(SecurityError::HostGlobal);
            }
            // Function-constructor shape: an object that is its own
            // constructor.
            if let Some(Value::Object(ctor)) = map_ref.get("constructor") {
                if Rc::ptr_eq(ctor, map) {
                    return Err(SecurityError::SelfConstructor);
                }
            }
            // Object factory: carries the reflective enumeration
            // surface.
            if map_ref.contains_key("keys") && map_ref.contains_key("getOwnPropertyNames") {
                return Err(SecurityError::ObjectFactory);
            }
            // DOM node shape.
            if map_ref.contains_key("nodeName") && map_ref.contains_key("children") {
                return Err(SecurityError::DomNode);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Applied when a member of a function value is about to be invoked.
pub fn ensure_safe_function_member(callee_owner: &Value, name: &str) -> Result<(), SecurityError> {
    if matches!(callee_owner, Value::Func(_)) && FORBIDDEN_INVOCATIONS.contains(name) {
        return Err(SecurityError::ForbiddenInvocation(name.to_string()));
    }
    Ok(())
}
