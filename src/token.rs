#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Payload classification for a lexed token. Operators and punctuation
/// carry no payload; the parser matches them on `Token::text`.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Numeric literal, already folded to its f64 value.
    Number(f64),
    /// String literal with escapes decoded. `Token::text` keeps the
    /// raw form including the surrounding quotes.
    Str(String),
    Identifier,
    Operator,
    Punctuation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Identifier)
    }

    /// True when this token is the literal text `text` and not a
    /// string or number that happens to render the same way.
    pub fn is_text(&self, text: &str) -> bool {
        !matches!(self.kind, TokenKind::Str(_) | TokenKind::Number(_)) && self.text == text
    }
}
