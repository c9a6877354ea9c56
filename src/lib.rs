//! Reactive core for data binding: a tree of observation scopes with
//! a dirty-checking digest engine, plus an embedded expression
//! compiler producing sandboxed accessors over dynamic value graphs.
//!
//! The pipeline: [`lexer`] turns expression source into tokens,
//! [`parser`] builds the AST, [`compiler`] walks it against a
//! `(scope, locals)` pair with capability checks from [`sandbox`],
//! and [`scope`] runs watch expressions to a fixed point. Filters
//! compose into the expression language through the pipe operator and
//! the process-wide [`filter`] registry.

pub mod ast;
pub mod compiler;
pub mod error;
pub mod expression;
pub mod filter;
pub mod lexer;
pub mod parser;
pub mod sandbox;
mod scheduler;
pub mod scope;
pub mod token;
pub mod value;

pub use compiler::CompiledExpression;
pub use error::{
    CollectingExceptionHandler, EngineError, ExceptionHandler, LexError, LexErrorKind,
    LogExceptionHandler, ParseError, SecurityError,
};
pub use expression::{ExpressionParser, WatchExpr};
pub use filter::{Filter, FilterRegistry};
pub use scope::{Scope, ScopeEvent, ScopeOptions, WatchHandle, DEFAULT_TTL};
pub use value::{FuncCtx, NativeFunction, OpaqueKind, OpaqueValue, Value};
