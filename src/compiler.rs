use std::rc::Rc;

use crate::ast::{AstNode, BinaryOp, LogicalOp, UnaryOp};
use crate::error::EngineError;
use crate::filter;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::sandbox::{ensure_safe_function_member, ensure_safe_member_name, ensure_safe_object};
use crate::scope::Scope;
use crate::value::{loose_equals, num_to_string, strict_equals, ObjectMap, Value};

/// A parsed expression ready to evaluate against `(scope, locals)`.
/// The tree is walked directly; the sandbox checks run at every
/// dynamic dereference and invocation, exactly where generated code
/// would perform them.
pub struct CompiledExpression {
    source: String,
    program: AstNode,
    /// Evaluates identically regardless of scope.
    pub constant: bool,
    /// Source began with `::`.
    pub one_time: bool,
    /// A single array/object/scalar literal statement.
    pub literal: bool,
}

impl CompiledExpression {
    pub fn compile(source: &str) -> Result<Rc<CompiledExpression>, EngineError> {
        let trimmed = source.trim();
        let (one_time, body_src) = match trimmed.strip_prefix("::") {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let tokens = Lexer::new(body_src).tokenize()?;
        let program = Parser::new(tokens).parse_program()?;
        let constant = is_constant(&program);
        let literal = is_literal(&program);
        Ok(Rc::new(CompiledExpression {
            source: trimmed.to_string(),
            program,
            constant,
            one_time,
            literal,
        }))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the expression is a single l-value path `assign` can
    /// write through.
    pub fn is_assignable(&self) -> bool {
        match &self.program {
            AstNode::Program { body } => body.len() == 1 && body[0].is_assignable(),
            _ => false,
        }
    }

    pub fn eval(&self, scope: &Scope) -> Result<Value, EngineError> {
        self.eval_with(scope, None)
    }

    pub fn eval_with(&self, scope: &Scope, locals: Option<&ObjectMap>) -> Result<Value, EngineError> {
        let interp = Interp { scope, locals };
        match &self.program {
            AstNode::Program { body } => {
                let mut last = Value::Undefined;
                for stmt in body {
                    last = interp.eval(stmt)?;
                }
                Ok(last)
            }
            _ => Ok(Value::Undefined),
        }
    }

    /// Writes `value` through the expression's l-value path, creating
    /// missing intermediate objects on the scope. Returns the written
    /// value.
    pub fn assign(&self, scope: &Scope, value: Value) -> Result<Value, EngineError> {
        let target = match &self.program {
            AstNode::Program { body } if body.len() == 1 && body[0].is_assignable() => &body[0],
            _ => {
                return Err(EngineError::user(format!(
                    "expression '{}' is not assignable",
                    self.source
                )))
            }
        };
        let interp = Interp { scope, locals: None };
        interp.assign_into(target, value.clone())?;
        Ok(value)
    }
}

/// `constant` classification: literals, literal containers of
/// constants, operators over constants, and non-stateful filter calls
/// over constants. Unregistered filters are assumed stateful.
fn is_constant(node: &AstNode) -> bool {
    match node {
        AstNode::Program { body } => body.iter().all(is_constant),
        AstNode::Literal { .. } => true,
        AstNode::Identifier { .. } | AstNode::This => false,
        AstNode::ArrayLiteral { elements } => elements.iter().all(is_constant),
        AstNode::ObjectLiteral { properties } => {
            properties.iter().all(|p| is_constant(&p.value))
        }
        AstNode::Member { object, property, computed } => {
            is_constant(object) && (!computed || is_constant(property))
        }
        AstNode::Call { callee, args, filter: true } => {
            let stateful = match &**callee {
                AstNode::Identifier { name } => filter::lookup(name)
                    .map(|f| f.is_stateful())
                    .unwrap_or(true),
                _ => true,
            };
            !stateful && args.iter().all(is_constant)
        }
        AstNode::Call { .. } => false,
        AstNode::Assign { target, value } => is_constant(target) && is_constant(value),
        AstNode::Unary { operand, .. } => is_constant(operand),
        AstNode::Binary { left, right, .. } | AstNode::Logical { left, right, .. } => {
            is_constant(left) && is_constant(right)
        }
        AstNode::Conditional { test, consequent, alternate } => {
            is_constant(test) && is_constant(consequent) && is_constant(alternate)
        }
    }
}

fn is_literal(node: &AstNode) -> bool {
    match node {
        AstNode::Program { body } => {
            body.is_empty()
                || (body.len() == 1
                    && matches!(
                        body[0],
                        AstNode::Literal { .. }
                            | AstNode::ArrayLiteral { .. }
                            | AstNode::ObjectLiteral { .. }
                    ))
        }
        _ => false,
    }
}

struct Interp<'a> {
    scope: &'a Scope,
    locals: Option<&'a ObjectMap>,
}

impl<'a> Interp<'a> {
    fn eval(&self, node: &AstNode) -> Result<Value, EngineError> {
        match node {
            AstNode::Program { .. } => Ok(Value::Undefined),
            AstNode::Literal { value } => Ok(value.clone()),
            AstNode::This => Ok(self.scope.data_value()),
            AstNode::Identifier { name } => {
                let value = self.read_identifier(name);
                ensure_safe_object(&value)?;
                Ok(value)
            }
            AstNode::ArrayLiteral { elements } => {
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    items.push(self.eval(element)?);
                }
                Ok(Value::array(items))
            }
            AstNode::ObjectLiteral { properties } => {
                let mut pairs = Vec::with_capacity(properties.len());
                for property in properties {
                    pairs.push((property.key.clone(), self.eval(&property.value)?));
                }
                Ok(Value::object_from(pairs))
            }
            AstNode::Member { object, property, computed } => {
                let obj = self.eval(object)?;
                let key = self.member_key(property, *computed)?;
                ensure_safe_member_name(&key)?;
                if obj.is_nil() {
                    return Ok(Value::Undefined);
                }
                ensure_safe_object(&obj)?;
                let value = obj.get_member(&key);
                ensure_safe_object(&value)?;
                Ok(value)
            }
            AstNode::Call { callee, args, filter } => {
                if *filter {
                    self.eval_filter_call(callee, args)
                } else {
                    self.eval_call(callee, args)
                }
            }
            AstNode::Assign { target, value } => {
                let value = self.eval(value)?;
                self.assign_into(target, value.clone())?;
                Ok(value)
            }
            AstNode::Unary { op, operand } => {
                let operand = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!operand.is_truthy()),
                    UnaryOp::Plus => Value::Num(number_or_zero(&operand)),
                    UnaryOp::Minus => Value::Num(-number_or_zero(&operand)),
                })
            }
            AstNode::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(apply_binary(*op, &left, &right))
            }
            AstNode::Logical { op, left, right } => {
                let left = self.eval(left)?;
                match op {
                    LogicalOp::And => {
                        if left.is_truthy() {
                            self.eval(right)
                        } else {
                            Ok(left)
                        }
                    }
                    LogicalOp::Or => {
                        if left.is_truthy() {
                            Ok(left)
                        } else {
                            self.eval(right)
                        }
                    }
                }
            }
            AstNode::Conditional { test, consequent, alternate } => {
                if self.eval(test)?.is_truthy() {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
        }
    }

    /// Own-property locals first, then the delegating scope read.
    fn read_identifier(&self, name: &str) -> Value {
        if let Some(locals) = self.locals {
            if let Some(value) = locals.borrow().get(name) {
                return value.clone();
            }
        }
        self.scope.get(name)
    }

    fn member_key(&self, property: &AstNode, computed: bool) -> Result<String, EngineError> {
        if computed {
            let key = self.eval(property)?;
            Ok(match key {
                Value::Str(s) => s,
                Value::Num(n) => num_to_string(n),
                other => other.to_display_string(),
            })
        } else {
            match property {
                AstNode::Identifier { name } => Ok(name.clone()),
                _ => Ok(String::new()),
            }
        }
    }

    fn eval_filter_call(&self, callee: &AstNode, args: &[AstNode]) -> Result<Value, EngineError> {
        let name = match callee {
            AstNode::Identifier { name } => name.as_str(),
            _ => return Err(EngineError::user("filter reference must be a name")),
        };
        let f = filter::lookup(name).ok_or_else(|| {
            EngineError::registration(format!("unknown filter '{}'", name))
        })?;
        let input = self.eval(&args[0])?;
        let mut rest = Vec::with_capacity(args.len().saturating_sub(1));
        for arg in &args[1..] {
            rest.push(self.eval(arg)?);
        }
        f.call(&input, &rest)
    }

    fn eval_call(&self, callee: &AstNode, args: &[AstNode]) -> Result<Value, EngineError> {
        let (func, receiver) = match callee {
            AstNode::Member { object, property, computed } => {
                let obj = self.eval(object)?;
                let key = self.member_key(property, *computed)?;
                ensure_safe_member_name(&key)?;
                ensure_safe_function_member(&obj, &key)?;
                if obj.is_nil() {
                    (Value::Undefined, obj)
                } else {
                    ensure_safe_object(&obj)?;
                    (obj.get_member(&key), obj)
                }
            }
            AstNode::Identifier { name } => {
                if let Some(locals) = self.locals {
                    let owned = locals.borrow().get(name).cloned();
                    if let Some(value) = owned {
                        (value, Value::Object(locals.clone()))
                    } else {
                        (self.scope.get(name), self.scope.data_value())
                    }
                } else {
                    (self.scope.get(name), self.scope.data_value())
                }
            }
            other => (self.eval(other)?, Value::Undefined),
        };

        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval(arg)?);
        }

        match func {
            Value::Func(f) => {
                let result = f.call(&receiver, &arg_values)?;
                ensure_safe_object(&result)?;
                Ok(result)
            }
            v if v.is_nil() => Ok(Value::Undefined),
            other => Err(EngineError::user(format!(
                "{} is not a function",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn assign_into(&self, target: &AstNode, value: Value) -> Result<(), EngineError> {
        match target {
            AstNode::Identifier { name } => {
                ensure_safe_member_name(name)?;
                self.scope.set(name, value);
                Ok(())
            }
            AstNode::Member { object, property, computed } => {
                let container = match self.resolve_container(object)? {
                    Some(container) => container,
                    // A primitive somewhere in the path: the write is
                    // silently dropped, matching host semantics.
                    None => return Ok(()),
                };
                let key = self.member_key(property, *computed)?;
                ensure_safe_member_name(&key)?;
                ensure_safe_object(&container)?;
                write_member(&container, &key, value);
                Ok(())
            }
            _ => Err(EngineError::user("assignment target is not an l-value")),
        }
    }

    /// Resolves the container an assignment path writes into, creating
    /// missing intermediates as fresh objects on the scope. Only the
    /// assign path creates; plain reads never fabricate.
    fn resolve_container(&self, node: &AstNode) -> Result<Option<Value>, EngineError> {
        match node {
            AstNode::Identifier { name } => {
                ensure_safe_member_name(name)?;
                let existing = self.scope.get(name);
                match existing {
                    Value::Object(_) | Value::Array(_) => {
                        ensure_safe_object(&existing)?;
                        Ok(Some(existing))
                    }
                    v if v.is_nil() => {
                        let fresh = Value::object();
                        self.scope.set(name, fresh.clone());
                        Ok(Some(fresh))
                    }
                    _ => Ok(None),
                }
            }
            AstNode::This => Ok(Some(self.scope.data_value())),
            AstNode::Member { object, property, computed } => {
                let parent = match self.resolve_container(object)? {
                    Some(parent) => parent,
                    None => return Ok(None),
                };
                let key = self.member_key(property, *computed)?;
                ensure_safe_member_name(&key)?;
                let current = parent.get_member(&key);
                match current {
                    Value::Object(_) | Value::Array(_) => {
                        ensure_safe_object(&current)?;
                        Ok(Some(current))
                    }
                    v if v.is_nil() => {
                        let fresh = Value::object();
                        write_member(&parent, &key, fresh.clone());
                        Ok(Some(fresh))
                    }
                    _ => Ok(None),
                }
            }
            other => {
                let value = self.eval(other)?;
                match value {
                    Value::Object(_) | Value::Array(_) => Ok(Some(value)),
                    _ => Ok(None),
                }
            }
        }
    }
}

fn write_member(container: &Value, key: &str, value: Value) {
    match container {
        Value::Object(map) => {
            map.borrow_mut().insert(key.to_string(), value);
        }
        Value::Array(items) => {
            if let Ok(index) = key.parse::<usize>() {
                let mut items = items.borrow_mut();
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                items[index] = value;
            }
        }
        _ => {}
    }
}

fn number_or_zero(v: &Value) -> f64 {
    if v.is_undefined() {
        0.0
    } else {
        v.to_number()
    }
}

fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => {
            // A missing operand yields the other one.
            if left.is_undefined() {
                return right.clone();
            }
            if right.is_undefined() {
                return left.clone();
            }
            if is_stringish(left) || is_stringish(right) {
                Value::Str(format!(
                    "{}{}",
                    left.to_display_string(),
                    right.to_display_string()
                ))
            } else {
                Value::Num(left.to_number() + right.to_number())
            }
        }
        BinaryOp::Subtract => Value::Num(number_or_zero(left) - number_or_zero(right)),
        BinaryOp::Multiply => Value::Num(left.to_number() * right.to_number()),
        BinaryOp::Divide => Value::Num(left.to_number() / right.to_number()),
        BinaryOp::Modulo => Value::Num(left.to_number() % right.to_number()),
        BinaryOp::Equal => Value::Bool(loose_equals(left, right)),
        BinaryOp::NotEqual => Value::Bool(!loose_equals(left, right)),
        BinaryOp::StrictEqual => Value::Bool(strict_equals(left, right)),
        BinaryOp::StrictNotEqual => Value::Bool(!strict_equals(left, right)),
        BinaryOp::Less => compare(left, right, |o| o == std::cmp::Ordering::Less),
        BinaryOp::Greater => compare(left, right, |o| o == std::cmp::Ordering::Greater),
        BinaryOp::LessEqual => compare(left, right, |o| o != std::cmp::Ordering::Greater),
        BinaryOp::GreaterEqual => compare(left, right, |o| o != std::cmp::Ordering::Less),
    }
}

fn is_stringish(v: &Value) -> bool {
    matches!(
        v,
        Value::Str(_) | Value::Array(_) | Value::Object(_) | Value::Func(_) | Value::Opaque(_)
    )
}

/// Relational comparison: string-to-string is lexicographic, anything
/// else is numeric, and NaN never compares true.
fn compare(left: &Value, right: &Value, test: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        return Value::Bool(test(a.cmp(b)));
    }
    let (a, b) = (left.to_number(), right.to_number());
    match a.partial_cmp(&b) {
        Some(ordering) => Value::Bool(test(ordering)),
        None => Value::Bool(false),
    }
}
