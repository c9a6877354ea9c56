use std::fmt;
use std::rc::Rc;

use crate::token::Span;

/// Error raised while tokenizing expression source.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub kind: LexErrorKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LexErrorKind {
    UnexpectedCharacter(char),
    InvalidExponent,
    InvalidUnicodeEscape,
    UnterminatedString,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LexErrorKind::UnexpectedCharacter(c) => {
                write!(f, "unexpected character '{}' at {}", c, self.span.start)
            }
            LexErrorKind::InvalidExponent => {
                write!(f, "invalid exponent at {}", self.span.start)
            }
            LexErrorKind::InvalidUnicodeEscape => {
                write!(f, "invalid unicode escape at {}", self.span.start)
            }
            LexErrorKind::UnterminatedString => {
                write!(f, "unterminated string starting at {}", self.span.start)
            }
        }
    }
}

/// Error raised while building the AST. A single kind carrying the
/// expectation that was violated.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self { message: message.into(), span }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {}: {}", self.span.start, self.message)
    }
}

/// Violation of the expression sandbox capability checks.
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityError {
    /// Member name on the forbidden identifier blacklist.
    ForbiddenMember(String),
    /// Expression reached the host global object.
    HostGlobal,
    /// Object that is its own constructor (the function constructor).
    SelfConstructor,
    /// The object factory (reflective enumeration surface).
    ObjectFactory,
    /// A DOM node.
    DomNode,
    /// Invocation of call/apply/bind on a function value.
    ForbiddenInvocation(String),
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityError::ForbiddenMember(name) => {
                write!(f, "referencing \"{}\" in expressions is disallowed", name)
            }
            SecurityError::HostGlobal => {
                write!(f, "referencing the host global in expressions is disallowed")
            }
            SecurityError::SelfConstructor => {
                write!(f, "referencing the function constructor in expressions is disallowed")
            }
            SecurityError::ObjectFactory => {
                write!(f, "referencing the object factory in expressions is disallowed")
            }
            SecurityError::DomNode => {
                write!(f, "referencing DOM nodes in expressions is disallowed")
            }
            SecurityError::ForbiddenInvocation(name) => {
                write!(f, "invoking \"{}\" in expressions is disallowed", name)
            }
        }
    }
}

/// Every failure mode of the engine. Structural errors (lex, parse,
/// security, phase, TTL, registration) propagate to the caller at the
/// entry point that produced them; user errors are caught at each
/// call site inside the digest and routed to the exception sink.
#[derive(Debug, Clone)]
pub enum EngineError {
    Lex(LexError),
    Parse(ParseError),
    Security(SecurityError),
    /// Attempted to enter a phase while another was active.
    PhaseConflict { active: &'static str },
    /// Digest failed to stabilise within the TTL.
    MaxDigestIterations { ttl: usize },
    /// Invalid filter registry call, or an unregistered filter name
    /// reached at call time.
    Registration(String),
    /// Raised from user accessors, listeners, filters, or native
    /// functions.
    User(String),
}

impl EngineError {
    pub fn user(message: impl Into<String>) -> Self {
        EngineError::User(message.into())
    }

    pub fn registration(message: impl Into<String>) -> Self {
        EngineError::Registration(message.into())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Lex(e) => write!(f, "{}", e),
            EngineError::Parse(e) => write!(f, "{}", e),
            EngineError::Security(e) => write!(f, "{}", e),
            EngineError::PhaseConflict { active } => {
                write!(f, "{} already in progress", active)
            }
            EngineError::MaxDigestIterations { ttl } => {
                write!(f, "{} digest iterations reached without stabilising", ttl)
            }
            EngineError::Registration(msg) => write!(f, "{}", msg),
            EngineError::User(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LexError> for EngineError {
    fn from(e: LexError) -> Self {
        EngineError::Lex(e)
    }
}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        EngineError::Parse(e)
    }
}

impl From<SecurityError> for EngineError {
    fn from(e: SecurityError) -> Self {
        EngineError::Security(e)
    }
}

/// Sink for errors the engine swallows to keep a digest or event
/// dispatch alive. The default routes to the `log` crate.
pub trait ExceptionHandler {
    fn handle(&self, error: &EngineError);
}

pub struct LogExceptionHandler;

impl ExceptionHandler for LogExceptionHandler {
    fn handle(&self, error: &EngineError) {
        log::error!("{}", error);
    }
}

/// Sink that collects errors, for tests and embedders that assert on
/// what the engine swallowed.
#[derive(Default)]
pub struct CollectingExceptionHandler {
    errors: std::cell::RefCell<Vec<EngineError>>,
}

impl CollectingExceptionHandler {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn take(&self) -> Vec<EngineError> {
        self.errors.borrow_mut().drain(..).collect()
    }

    pub fn count(&self) -> usize {
        self.errors.borrow().len()
    }
}

impl ExceptionHandler for CollectingExceptionHandler {
    fn handle(&self, error: &EngineError) {
        self.errors.borrow_mut().push(error.clone());
    }
}
