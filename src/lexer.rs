use crate::error::{LexError, LexErrorKind};
use crate::token::{Span, Token, TokenKind};

/// The fixed operator vocabulary. Matched greedily, longest first.
const OPERATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "!", "=", "<", ">",
    "|",
];

const PUNCTUATION: &[char] = &['[', ']', '(', ')', '{', '}', ',', ':', '.', ';', '?'];

pub type LexResult<T> = Result<T, LexError>;

/// Hand-written scanner for the expression language. One pass over the
/// source, producing the full token stream or the first lexical error.
pub struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
            tokens: Vec::new(),
        }
    }

    pub fn tokenize(mut self) -> LexResult<Vec<Token>> {
        while let Some(ch) = self.current() {
            if is_whitespace(ch) {
                self.pos += 1;
            } else if ch.is_ascii_digit() || (ch == '.' && self.peek_ahead(1).is_some_and(|c| c.is_ascii_digit())) {
                self.read_number()?;
            } else if is_identifier_start(ch) {
                self.read_identifier();
            } else if ch == '\'' || ch == '"' {
                self.read_string(ch)?;
            } else if PUNCTUATION.contains(&ch) {
                let start = self.offset();
                self.pos += 1;
                self.push(ch.to_string(), TokenKind::Punctuation, start);
            } else if let Some(op) = self.match_operator() {
                let start = self.offset();
                self.pos += op.chars().count();
                self.push(op, TokenKind::Operator, start);
            } else {
                return Err(LexError {
                    kind: LexErrorKind::UnexpectedCharacter(ch),
                    span: Span::new(self.offset(), self.offset() + ch.len_utf8()),
                });
            }
        }
        Ok(self.tokens)
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn peek_ahead(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).map(|&(_, c)| c)
    }

    /// Byte offset of the current position (source length at EOF).
    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|&(i, _)| i)
            .unwrap_or(self.source.len())
    }

    fn push(&mut self, text: String, kind: TokenKind, start: usize) {
        let end = self.offset();
        self.tokens.push(Token {
            text,
            kind,
            span: Span::new(start, end),
        });
    }

    fn match_operator(&self) -> Option<String> {
        for len in (1..=3).rev() {
            if self.pos + len > self.chars.len() {
                continue;
            }
            let candidate: String = self.chars[self.pos..self.pos + len]
                .iter()
                .map(|&(_, c)| c)
                .collect();
            if OPERATORS.contains(&candidate.as_str()) {
                return Some(candidate);
            }
        }
        None
    }

    fn read_number(&mut self) -> LexResult<()> {
        let start = self.offset();
        let mut text = String::new();
        let mut seen_dot = false;

        while let Some(ch) = self.current() {
            let lower = ch.to_ascii_lowercase();
            if lower == '.' {
                if seen_dot {
                    break;
                }
                seen_dot = true;
                text.push(ch);
                self.pos += 1;
            } else if lower.is_ascii_digit() {
                text.push(ch);
                self.pos += 1;
            } else {
                let peek = self.peek_ahead(1);
                let last_is_e = text.ends_with('e') || text.ends_with('E');
                if lower == 'e' && peek.is_some_and(is_exp_operator) {
                    text.push(ch);
                    self.pos += 1;
                } else if is_exp_operator(ch) && last_is_e && peek.is_some_and(|c| c.is_ascii_digit()) {
                    text.push(ch);
                    self.pos += 1;
                } else if is_exp_operator(ch) && last_is_e {
                    // "233e-" and "233e-a" are malformed exponents
                    return Err(LexError {
                        kind: LexErrorKind::InvalidExponent,
                        span: Span::new(start, self.offset()),
                    });
                } else {
                    break;
                }
            }
        }

        let value: f64 = text.parse().map_err(|_| LexError {
            kind: LexErrorKind::InvalidExponent,
            span: Span::new(start, self.offset()),
        })?;
        self.push(text, TokenKind::Number(value), start);
        Ok(())
    }

    fn read_identifier(&mut self) {
        let start = self.offset();
        let mut text = String::new();
        while let Some(ch) = self.current() {
            if is_identifier_start(ch) || ch.is_ascii_digit() {
                text.push(ch);
                self.pos += 1;
            } else {
                break;
            }
        }
        self.push(text, TokenKind::Identifier, start);
    }

    fn read_string(&mut self, quote: char) -> LexResult<()> {
        let start = self.offset();
        self.pos += 1; // opening quote
        let mut value = String::new();

        while let Some(ch) = self.current() {
            if ch == '\\' {
                self.pos += 1;
                match self.current() {
                    Some('u') => {
                        self.pos += 1;
                        let mut hex = String::new();
                        for _ in 0..4 {
                            match self.current() {
                                Some(c) if c.is_ascii_hexdigit() => {
                                    hex.push(c);
                                    self.pos += 1;
                                }
                                _ => {
                                    return Err(LexError {
                                        kind: LexErrorKind::InvalidUnicodeEscape,
                                        span: Span::new(start, self.offset()),
                                    })
                                }
                            }
                        }
                        let code = u32::from_str_radix(&hex, 16).expect("validated hex");
                        match char::from_u32(code) {
                            Some(c) => value.push(c),
                            None => {
                                return Err(LexError {
                                    kind: LexErrorKind::InvalidUnicodeEscape,
                                    span: Span::new(start, self.offset()),
                                })
                            }
                        }
                    }
                    Some(c) => {
                        value.push(unescape(c));
                        self.pos += 1;
                    }
                    None => break,
                }
            } else if ch == quote {
                self.pos += 1;
                let end = self.offset();
                let text = self.source[start..end].to_string();
                self.tokens.push(Token {
                    text,
                    kind: TokenKind::Str(value),
                    span: Span::new(start, end),
                });
                return Ok(());
            } else {
                value.push(ch);
                self.pos += 1;
            }
        }

        Err(LexError {
            kind: LexErrorKind::UnterminatedString,
            span: Span::new(start, self.offset()),
        })
    }
}

fn is_whitespace(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\r' | '\n' | '\u{000B}' | '\u{00A0}')
}

fn is_identifier_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '$'
}

fn is_exp_operator(ch: char) -> bool {
    ch == '-' || ch == '+' || ch.is_ascii_digit()
}

fn unescape(ch: char) -> char {
    match ch {
        'n' => '\n',
        'f' => '\u{000C}',
        'r' => '\r',
        't' => '\t',
        'v' => '\u{000B}',
        // Unknown escapes yield the character itself; this covers
        // \' \" and \\ as well.
        other => other,
    }
}
