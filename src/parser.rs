use crate::ast::{AstNode, BinaryOp, LogicalOp, Property, UnaryOp};
use crate::error::ParseError;
use crate::token::{Span, Token, TokenKind};
use crate::value::{num_to_string, Value};

pub type ParseResult<T> = Result<T, ParseError>;

/// Recursive-descent builder over the lexed token stream. One method
/// per precedence level, highest binding at the bottom.
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, current: 0 }
    }

    pub fn parse_program(mut self) -> ParseResult<AstNode> {
        let mut body = Vec::new();
        loop {
            if !self.at_end() && !self.peek_any(&["}", ")", ";", "]"]) {
                body.push(self.filter_chain()?);
            }
            if !self.expect(";") {
                break;
            }
        }
        if let Some(token) = self.peek() {
            return Err(self.unexpected(token.clone()));
        }
        Ok(AstNode::Program { body })
    }

    // filter := assignment ('|' identifier (':' assignment)*)*
    fn filter_chain(&mut self) -> ParseResult<AstNode> {
        let mut left = self.assignment()?;
        while self.expect("|") {
            let name = self.consume_identifier("filter name")?;
            let mut args = vec![left];
            while self.expect(":") {
                args.push(self.assignment()?);
            }
            left = AstNode::Call {
                callee: Box::new(AstNode::Identifier { name }),
                args,
                filter: true,
            };
        }
        Ok(left)
    }

    fn assignment(&mut self) -> ParseResult<AstNode> {
        let target = self.ternary()?;
        if self.expect("=") {
            if !target.is_assignable() {
                return Err(ParseError::new(
                    "trying to assign a value to a non l-value",
                    self.here(),
                ));
            }
            let value = self.ternary()?;
            return Ok(AstNode::Assign {
                target: Box::new(target),
                value: Box::new(value),
            });
        }
        Ok(target)
    }

    fn ternary(&mut self) -> ParseResult<AstNode> {
        let test = self.logical_or()?;
        if self.expect("?") {
            let consequent = self.assignment()?;
            self.consume(":")?;
            let alternate = self.assignment()?;
            return Ok(AstNode::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            });
        }
        Ok(test)
    }

    fn logical_or(&mut self) -> ParseResult<AstNode> {
        let mut left = self.logical_and()?;
        while self.expect("||") {
            let right = self.logical_and()?;
            left = AstNode::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn logical_and(&mut self) -> ParseResult<AstNode> {
        let mut left = self.equality()?;
        while self.expect("&&") {
            let right = self.equality()?;
            left = AstNode::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> ParseResult<AstNode> {
        let mut left = self.relational()?;
        while let Some(op) = self.expect_operator(&["===", "!==", "==", "!="]) {
            let right = self.relational()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn relational(&mut self) -> ParseResult<AstNode> {
        let mut left = self.additive()?;
        while let Some(op) = self.expect_operator(&["<=", ">=", "<", ">"]) {
            let right = self.additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> ParseResult<AstNode> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.expect_operator(&["+", "-"]) {
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> ParseResult<AstNode> {
        let mut left = self.unary()?;
        while let Some(op) = self.expect_operator(&["*", "/", "%"]) {
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> ParseResult<AstNode> {
        let op = if self.expect("+") {
            UnaryOp::Plus
        } else if self.expect("-") {
            UnaryOp::Minus
        } else if self.expect("!") {
            UnaryOp::Not
        } else {
            return self.primary();
        };
        let operand = self.unary()?;
        Ok(AstNode::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn primary(&mut self) -> ParseResult<AstNode> {
        let mut node = if self.expect("(") {
            let inner = self.filter_chain()?;
            self.consume(")")?;
            inner
        } else if self.expect("[") {
            self.array_literal()?
        } else if self.expect("{") {
            self.object_literal()?
        } else {
            let token = match self.peek() {
                Some(t) => t.clone(),
                None => {
                    return Err(ParseError::new(
                        "unexpected end of expression",
                        self.here(),
                    ))
                }
            };
            self.current += 1;
            match &token.kind {
                TokenKind::Number(n) => AstNode::Literal { value: Value::Num(*n) },
                TokenKind::Str(s) => AstNode::Literal { value: Value::Str(s.clone()) },
                TokenKind::Identifier => match token.text.as_str() {
                    "true" => AstNode::Literal { value: Value::Bool(true) },
                    "false" => AstNode::Literal { value: Value::Bool(false) },
                    "null" => AstNode::Literal { value: Value::Null },
                    "undefined" => AstNode::Literal { value: Value::Undefined },
                    "this" => AstNode::This,
                    name => AstNode::Identifier { name: name.to_string() },
                },
                _ => return Err(self.unexpected(token)),
            }
        };

        loop {
            if self.expect("(") {
                let args = self.call_args()?;
                self.consume(")")?;
                node = AstNode::Call {
                    callee: Box::new(node),
                    args,
                    filter: false,
                };
            } else if self.expect("[") {
                let property = self.filter_chain()?;
                self.consume("]")?;
                node = AstNode::Member {
                    object: Box::new(node),
                    property: Box::new(property),
                    computed: true,
                };
            } else if self.expect(".") {
                let name = self.consume_identifier("property name")?;
                node = AstNode::Member {
                    object: Box::new(node),
                    property: Box::new(AstNode::Identifier { name }),
                    computed: false,
                };
            } else {
                break;
            }
        }
        Ok(node)
    }

    // Opening '[' already consumed. A trailing comma before ']' is
    // permitted.
    fn array_literal(&mut self) -> ParseResult<AstNode> {
        let mut elements = Vec::new();
        if !self.peek_text("]") {
            loop {
                if self.peek_text("]") {
                    break;
                }
                elements.push(self.assignment()?);
                if !self.expect(",") {
                    break;
                }
            }
        }
        self.consume("]")?;
        Ok(AstNode::ArrayLiteral { elements })
    }

    // Opening '{' already consumed. Keys are identifiers, strings, or
    // numbers; a trailing comma before '}' is permitted.
    fn object_literal(&mut self) -> ParseResult<AstNode> {
        let mut properties = Vec::new();
        if !self.peek_text("}") {
            loop {
                if self.peek_text("}") {
                    break;
                }
                let token = match self.peek() {
                    Some(t) => t.clone(),
                    None => {
                        return Err(ParseError::new(
                            "unexpected end of expression, expecting a key",
                            self.here(),
                        ))
                    }
                };
                let key = match &token.kind {
                    TokenKind::Identifier => token.text.clone(),
                    TokenKind::Str(s) => s.clone(),
                    TokenKind::Number(n) => num_to_string(*n),
                    _ => {
                        return Err(ParseError::new(
                            format!("'{}' is not a valid object key", token.text),
                            token.span,
                        ))
                    }
                };
                self.current += 1;
                self.consume(":")?;
                let value = self.assignment()?;
                properties.push(Property { key, value });
                if !self.expect(",") {
                    break;
                }
            }
        }
        self.consume("}")?;
        Ok(AstNode::ObjectLiteral { properties })
    }

    fn call_args(&mut self) -> ParseResult<Vec<AstNode>> {
        let mut args = Vec::new();
        if !self.peek_text(")") {
            loop {
                args.push(self.assignment()?);
                if !self.expect(",") {
                    break;
                }
            }
        }
        Ok(args)
    }

    // Token helpers

    fn at_end(&self) -> bool {
        self.current >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.current)
    }

    fn peek_text(&self, text: &str) -> bool {
        self.peek().is_some_and(|t| t.is_text(text))
    }

    fn peek_any(&self, texts: &[&str]) -> bool {
        self.peek()
            .is_some_and(|t| texts.iter().any(|x| t.is_text(x)))
    }

    /// Consume the token if it matches.
    fn expect(&mut self, text: &str) -> bool {
        if self.peek_text(text) {
            self.current += 1;
            return true;
        }
        false
    }

    fn expect_operator(&mut self, ops: &[&str]) -> Option<BinaryOp> {
        for op in ops {
            if self.peek_text(op) {
                self.current += 1;
                return BinaryOp::from_text(op);
            }
        }
        None
    }

    fn consume(&mut self, text: &str) -> ParseResult<()> {
        if self.expect(text) {
            return Ok(());
        }
        match self.peek() {
            Some(token) => Err(ParseError::new(
                format!("'{}' is unexpected, expecting [{}]", token.text, text),
                token.span,
            )),
            None => Err(ParseError::new(
                format!("unexpected end of expression, expecting [{}]", text),
                self.here(),
            )),
        }
    }

    fn consume_identifier(&mut self, what: &str) -> ParseResult<String> {
        match self.peek() {
            Some(token) if token.is_identifier() => {
                let name = token.text.clone();
                self.current += 1;
                Ok(name)
            }
            Some(token) => Err(ParseError::new(
                format!("'{}' is unexpected, expecting [{}]", token.text, what),
                token.span,
            )),
            None => Err(ParseError::new(
                format!("unexpected end of expression, expecting [{}]", what),
                self.here(),
            )),
        }
    }

    fn unexpected(&self, token: Token) -> ParseError {
        ParseError::new(format!("'{}' is an unexpected token", token.text), token.span)
    }

    /// Span at the current position, for errors with no token to
    /// anchor on.
    fn here(&self) -> Span {
        self.peek()
            .map(|t| t.span)
            .or_else(|| self.tokens.last().map(|t| Span::new(t.span.end, t.span.end)))
            .unwrap_or_default()
    }
}

fn binary(op: BinaryOp, left: AstNode, right: AstNode) -> AstNode {
    AstNode::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
