//! Expression language end-to-end through the scope: parsing, member
//! access, assignment, locals, filters in expressions, and the
//! sandbox.

use std::rc::Rc;

use serde_json::json;
use vigil::{EngineError, OpaqueKind, Scope, Value};

#[test]
fn eval_reads_through_the_value_graph() {
    let scope = Scope::new();
    scope.set("user", Value::from(json!({"name": "Keal", "tags": ["a", "b"]})));
    assert_eq!(scope.eval("user.name").expect("eval"), Value::from("Keal"));
    assert_eq!(scope.eval("user.tags[1]").expect("eval"), Value::from("b"));
    assert_eq!(scope.eval("user.tags.length").expect("eval"), Value::Num(2.0));
    assert_eq!(
        scope.eval("user['na' + 'me']").expect("eval"),
        Value::from("Keal")
    );
}

#[test]
fn eval_handles_multi_statement_programs() {
    let scope = Scope::new();
    let result = scope.eval("a = 2; b = 3; a * b").expect("eval");
    assert_eq!(result, Value::Num(6.0));
}

#[test]
fn assignment_expression_materialises_the_path() {
    let scope = Scope::new();
    let result = scope.eval("a[\"b\"].c.d = 233").expect("eval");
    assert_eq!(result, Value::Num(233.0));
    assert_eq!(
        scope.get("a").to_json(),
        json!({"b": {"c": {"d": 233.0}}})
    );
}

#[test]
fn assignments_write_to_the_evaluating_scope_not_the_parent() {
    let root = Scope::new();
    let child = root.new_child(false);
    root.set("x", Value::Num(1.0));
    child.eval("x = 2").expect("eval");
    assert_eq!(child.get("x"), Value::Num(2.0));
    assert_eq!(root.get("x"), Value::Num(1.0), "parent untouched");
}

#[test]
fn this_is_the_scope_data_object() {
    let scope = Scope::new();
    scope.set("n", Value::Num(5.0));
    assert_eq!(scope.eval("this.n").expect("eval"), Value::Num(5.0));
    scope.eval("this.m = 6").expect("eval");
    assert_eq!(scope.get("m"), Value::Num(6.0));
}

#[test]
fn locals_shadow_scope_properties() {
    let scope = Scope::new();
    scope.set("n", Value::Num(1.0));
    let locals = match Value::object_from([("n", Value::Num(2.0))]) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    assert_eq!(scope.eval_with("n + 10", &locals).expect("eval"), Value::Num(12.0));
    // A name the locals do not own falls through to the scope.
    assert_eq!(scope.eval_with("n + m", &locals).expect("eval"), Value::Num(2.0));
}

#[test]
fn filter_pipe_in_expression() {
    let scope = Scope::new();
    scope.set("arr", Value::from(json!(["aji", "buck", "llaji"])));
    let result = scope.eval("arr | filter:'a'").expect("eval");
    assert_eq!(result.to_json(), json!(["aji", "llaji"]));
}

#[test]
fn chained_filters_with_arguments() {
    vigil::filter::register("append", || {
        vigil::Filter::new(|input, args| {
            let suffix = args.first().map(|v| v.to_display_string()).unwrap_or_default();
            Ok(Value::Str(format!("{}{}", input.to_display_string(), suffix)))
        })
    })
    .expect("register");

    let scope = Scope::new();
    scope.set("name", Value::from("K"));
    let result = scope.eval("name | append:'@' | append:'@'").expect("eval");
    assert_eq!(result, Value::from("K@@"));
}

#[test]
fn unknown_filter_is_a_registration_error() {
    let scope = Scope::new();
    let err = scope.eval("1 | nonexistent").expect_err("should fail");
    assert!(matches!(err, EngineError::Registration(_)));
}

#[test]
fn lexical_errors_surface_from_eval() {
    let scope = Scope::new();
    assert!(matches!(
        scope.eval("'unterminated").expect_err("should fail"),
        EngineError::Lex(_)
    ));
    assert!(matches!(
        scope.eval("233e-").expect_err("should fail"),
        EngineError::Lex(_)
    ));
}

#[test]
fn parse_errors_surface_from_eval() {
    let scope = Scope::new();
    assert!(matches!(
        scope.eval("a +").expect_err("should fail"),
        EngineError::Parse(_)
    ));
    assert!(matches!(
        scope.eval("a[1").expect_err("should fail"),
        EngineError::Parse(_)
    ));
}

#[test]
fn sandbox_blocks_constructor_escape() {
    let scope = Scope::new();
    scope.set("fn", Value::native(|_| Ok(Value::Undefined)));
    let err = scope
        .eval("fn.constructor(\"return window;\")()")
        .expect_err("should fail");
    assert!(matches!(err, EngineError::Security(_)));
}

#[test]
fn sandbox_blocks_proto_and_accessor_members() {
    let scope = Scope::new();
    scope.set("obj", Value::object());
    for src in [
        "obj.__proto__",
        "obj['__proto__']",
        "obj.__defineGetter__",
        "obj.__lookupSetter__('x')",
        "obj.constructor",
    ] {
        let err = scope.eval(src).expect_err(src);
        assert!(matches!(err, EngineError::Security(_)), "{}", src);
    }
}

#[test]
fn sandbox_blocks_host_global_shapes() {
    let scope = Scope::new();
    scope.set(
        "win",
        Value::from(json!({
            "setInterval": null,
            "document": null,
            "location": null,
            "alert": null
        })),
    );
    assert!(matches!(
        scope.eval("win").expect_err("should fail"),
        EngineError::Security(_)
    ));

    scope.set("node", Value::opaque(OpaqueKind::DomNode, "div"));
    assert!(matches!(
        scope.eval("node").expect_err("should fail"),
        EngineError::Security(_)
    ));
}

#[test]
fn sandbox_blocks_function_rebinding() {
    let scope = Scope::new();
    scope.set("fn", Value::native(|_| Ok(Value::Undefined)));
    for src in ["fn.call(this)", "fn.apply(this)", "fn.bind(this)"] {
        assert!(
            matches!(scope.eval(src).expect_err(src), EngineError::Security(_)),
            "{}",
            src
        );
    }
}

#[test]
fn safe_expressions_pass_the_sandbox() {
    let scope = Scope::new();
    scope.set("obj", Value::from(json!({"keys": [1, 2]})));
    // "keys" alone is a plain property; only the full reflective
    // surface is refused.
    assert_eq!(scope.eval("obj.keys.length").expect("eval"), Value::Num(2.0));
}

#[test]
fn method_calls_bind_the_object_receiver() {
    let scope = Scope::new();
    let counter = Value::object_from([
        ("n", Value::Num(41.0)),
        (
            "next",
            Value::native(|ctx| Ok(Value::Num(ctx.this.get_member("n").to_number() + 1.0))),
        ),
    ]);
    scope.set("counter", counter);
    assert_eq!(scope.eval("counter.next()").expect("eval"), Value::Num(42.0));
}

#[test]
fn native_function_errors_are_user_errors() {
    let scope = Scope::new();
    scope.set(
        "explode",
        Value::native(|_| Err(EngineError::user("kaboom"))),
    );
    let err = scope.eval("explode()").expect_err("should fail");
    assert!(matches!(err, EngineError::User(_)));
}

#[test]
fn function_arguments_are_evaluated_in_order() {
    let scope = Scope::new();
    scope.set(
        "join",
        Value::native(|ctx| {
            let parts: Vec<String> = ctx.args.iter().map(|v| v.to_display_string()).collect();
            Ok(Value::Str(parts.join("-")))
        }),
    );
    scope.set("x", Value::Num(2.0));
    assert_eq!(
        scope.eval("join(1, x, 'three')").expect("eval"),
        Value::from("1-2-three")
    );
}

#[test]
fn string_escapes_reach_the_value_layer() {
    let scope = Scope::new();
    assert_eq!(
        scope.eval(r#"'line\none'"#).expect("eval"),
        Value::from("line\none")
    );
    assert_eq!(
        scope.eval(r#"'\u0041ji'"#).expect("eval"),
        Value::from("Aji")
    );
}

#[test]
fn object_and_array_literals_evaluate_members() {
    let scope = Scope::new();
    scope.set("n", Value::Num(3.0));
    let value = scope.eval("{list: [1, n], 'n x2': n * 2}").expect("eval");
    assert_eq!(value.to_json(), json!({"list": [1.0, 3.0], "n x2": 6.0}));
}

#[test]
fn nested_scopes_share_one_expression_cache() {
    let scope = Scope::new();
    let child = scope.new_child(false);
    scope.set("v", Value::Num(1.0));
    // Same source evaluated from two scopes: both work, compiled once
    // on the shared root parser.
    assert_eq!(scope.eval("v + 1").expect("eval"), Value::Num(2.0));
    assert_eq!(child.eval("v + 1").expect("eval"), Value::Num(2.0));
}

#[test]
fn compiled_expressions_are_reusable() {
    let compiled = vigil::CompiledExpression::compile("a + b").expect("compiles");
    let scope = Scope::new();
    scope.set("a", Value::Num(1.0));
    scope.set("b", Value::Num(2.0));
    assert_eq!(compiled.eval(&scope).expect("eval"), Value::Num(3.0));

    let other = Scope::new();
    other.set("a", Value::from("x"));
    other.set("b", Value::from("y"));
    assert_eq!(
        Rc::clone(&compiled).eval(&other).expect("eval"),
        Value::from("xy")
    );
}
