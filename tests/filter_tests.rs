//! Process-wide filter registry behaviour and the built-in "filter"
//! filter exercised through expressions.

use serde_json::json;
use vigil::{filter, EngineError, Filter, Scope, Value};

#[test]
fn builtin_filter_is_preinstalled() {
    assert!(filter::lookup("filter").is_some());
}

#[test]
fn register_and_lookup_roundtrip() {
    filter::register("shout", || {
        Filter::new(|input, _| Ok(Value::Str(input.to_display_string().to_uppercase())))
    })
    .expect("registers");

    let f = filter::lookup("shout").expect("found");
    assert_eq!(
        f.call(&Value::from("hey"), &[]).expect("runs"),
        Value::from("HEY")
    );
}

#[test]
fn register_many_returns_produced_filters() {
    let produced = filter::register_many(vec![
        (
            "first_of",
            Box::new(|| Filter::new(|input, _| Ok(input.get_member("0")))),
        ),
        (
            "last_of",
            Box::new(|| {
                Filter::new(|input, _| {
                    let len = input.get_member("length").to_number();
                    if len > 0.0 {
                        Ok(input.get_member(&((len - 1.0) as usize).to_string()))
                    } else {
                        Ok(Value::Undefined)
                    }
                })
            }),
        ),
    ])
    .expect("registers");
    assert_eq!(produced.len(), 2);

    let scope = Scope::new();
    scope.set("arr", Value::from(json!([10, 20, 30])));
    assert_eq!(scope.eval("arr | first_of").expect("eval"), Value::Num(10.0));
    assert_eq!(scope.eval("arr | last_of").expect("eval"), Value::Num(30.0));
}

#[test]
fn invalid_registration_is_an_error() {
    let err = filter::register("not a name", || {
        Filter::new(|input, _| Ok(input.clone()))
    })
    .expect_err("should fail");
    assert!(matches!(err, EngineError::Registration(_)));
}

#[test]
fn clear_empties_and_install_builtins_restores() {
    // Thread-local registry: this test's view is isolated from other
    // test threads.
    filter::register("temp", || Filter::new(|input, _| Ok(input.clone())))
        .expect("registers");
    filter::clear();
    assert!(filter::lookup("temp").is_none());
    assert!(filter::lookup("filter").is_none());

    filter::install_builtins();
    assert!(filter::lookup("filter").is_some());
}

#[test]
fn filter_criterion_by_substring() {
    filter::install_builtins();
    let scope = Scope::new();
    scope.set("arr", Value::from(json!(["aji", "buck", "llaji"])));
    assert_eq!(
        scope.eval("arr | filter:'a'").expect("eval").to_json(),
        json!(["aji", "llaji"])
    );
}

#[test]
fn filter_criterion_by_object_pattern() {
    filter::install_builtins();
    let scope = Scope::new();
    scope.set(
        "people",
        Value::from(json!([
            {"name": "keal", "admin": true},
            {"name": "buck", "admin": false}
        ])),
    );
    let out = scope
        .eval("people | filter:{admin: true}")
        .expect("eval");
    assert_eq!(out.get_member("length"), Value::Num(1.0));
    assert_eq!(out.get_member("0").get_member("name"), Value::from("keal"));
}

#[test]
fn filter_criterion_by_predicate_on_scope() {
    filter::install_builtins();
    let scope = Scope::new();
    scope.set("nums", Value::from(json!([1, 2, 3, 4, 5])));
    scope.set(
        "isBig",
        Value::native(|ctx| Ok(Value::Bool(ctx.args[0].to_number() > 3.0))),
    );
    assert_eq!(
        scope.eval("nums | filter:isBig").expect("eval").to_json(),
        json!([4.0, 5.0])
    );
}

#[test]
fn filter_with_strict_comparator_in_expression() {
    filter::install_builtins();
    let scope = Scope::new();
    scope.set("arr", Value::from(json!(["aji", "ajii"])));
    assert_eq!(
        scope
            .eval("arr | filter:'aji':true")
            .expect("eval")
            .to_json(),
        json!(["aji"])
    );
}

#[test]
fn negated_criterion_in_expression() {
    filter::install_builtins();
    let scope = Scope::new();
    scope.set("arr", Value::from(json!(["aji", "buck"])));
    assert_eq!(
        scope.eval("arr | filter:'!a'").expect("eval").to_json(),
        json!(["buck"])
    );
}

#[test]
fn stateful_filters_reevaluate_every_call() {
    use std::cell::Cell;
    use std::rc::Rc;

    let counter = Rc::new(Cell::new(0u32));
    let seen = counter.clone();
    filter::register("stamp", move || {
        let seen = seen.clone();
        Filter::stateful(move |input, _| {
            seen.set(seen.get() + 1);
            Ok(input.clone())
        })
    })
    .expect("registers");

    let scope = Scope::new();
    scope.eval("1 | stamp").expect("eval");
    scope.eval("1 | stamp").expect("eval");
    assert_eq!(counter.get(), 2, "resolved and invoked at each call");
}
