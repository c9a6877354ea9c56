use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::compiler::CompiledExpression;
use crate::error::EngineError;
use crate::scope::Scope;
use crate::value::Value;

/// Anything a watch/eval position accepts: expression source, an
/// already-compiled expression, a plain getter closure, a fallible
/// accessor, or the explicit no-op.
#[derive(Clone)]
pub enum WatchExpr {
    Source(String),
    Compiled(Rc<CompiledExpression>),
    Getter(Rc<dyn Fn(&Scope) -> Value>),
    Fallible(Rc<dyn Fn(&Scope) -> Result<Value, EngineError>>),
    Noop,
}

impl WatchExpr {
    pub fn getter(f: impl Fn(&Scope) -> Value + 'static) -> Self {
        WatchExpr::Getter(Rc::new(f))
    }

    pub fn fallible(f: impl Fn(&Scope) -> Result<Value, EngineError> + 'static) -> Self {
        WatchExpr::Fallible(Rc::new(f))
    }

    pub fn noop() -> Self {
        WatchExpr::Noop
    }

    pub(crate) fn into_accessor(self, parser: &ExpressionParser) -> Result<Accessor, EngineError> {
        Ok(match self {
            WatchExpr::Source(src) => Accessor::Compiled(parser.parse(&src)?),
            WatchExpr::Compiled(compiled) => Accessor::Compiled(compiled),
            WatchExpr::Getter(f) => Accessor::Getter(f),
            WatchExpr::Fallible(f) => Accessor::Fallible(f),
            WatchExpr::Noop => Accessor::Noop,
        })
    }
}

impl From<&str> for WatchExpr {
    fn from(src: &str) -> Self {
        WatchExpr::Source(src.to_string())
    }
}

impl From<String> for WatchExpr {
    fn from(src: String) -> Self {
        WatchExpr::Source(src)
    }
}

impl From<Rc<CompiledExpression>> for WatchExpr {
    fn from(compiled: Rc<CompiledExpression>) -> Self {
        WatchExpr::Compiled(compiled)
    }
}

/// The resolved form watchers hold. Compiled expressions keep their
/// classification flags reachable for the watch delegates.
#[derive(Clone)]
pub(crate) enum Accessor {
    Compiled(Rc<CompiledExpression>),
    Getter(Rc<dyn Fn(&Scope) -> Value>),
    Fallible(Rc<dyn Fn(&Scope) -> Result<Value, EngineError>>),
    Noop,
}

impl Accessor {
    pub(crate) fn invoke(&self, scope: &Scope) -> Result<Value, EngineError> {
        match self {
            Accessor::Compiled(compiled) => compiled.eval(scope),
            Accessor::Getter(f) => Ok(f(scope)),
            Accessor::Fallible(f) => f(scope),
            Accessor::Noop => Ok(Value::Undefined),
        }
    }

    pub(crate) fn compiled(&self) -> Option<&Rc<CompiledExpression>> {
        match self {
            Accessor::Compiled(compiled) => Some(compiled),
            _ => None,
        }
    }
}

/// Compiles expression source, caching by trimmed text so repeated
/// watches of the same expression share one compilation.
pub struct ExpressionParser {
    cache: RefCell<HashMap<String, Rc<CompiledExpression>>>,
}

impl ExpressionParser {
    pub fn new() -> Self {
        ExpressionParser { cache: RefCell::new(HashMap::new()) }
    }

    pub fn parse(&self, source: &str) -> Result<Rc<CompiledExpression>, EngineError> {
        let key = source.trim();
        if let Some(hit) = self.cache.borrow().get(key) {
            return Ok(hit.clone());
        }
        let compiled = CompiledExpression::compile(key)?;
        self.cache
            .borrow_mut()
            .insert(key.to_string(), compiled.clone());
        Ok(compiled)
    }

    #[cfg(test)]
    pub(crate) fn cached_count(&self) -> usize {
        self.cache.borrow().len()
    }
}

impl Default for ExpressionParser {
    fn default() -> Self {
        Self::new()
    }
}
