use std::{cell::RefCell, rc::Rc};

use crate::{
    ast::{Node, Operator},
    span::Span,
    tokenizer::{Token, TokenType, Tokenizer},
};

/// Upper bound on simultaneously active grammar rules. Only parentheses and
/// calls nest rules; operator chains and signs are folded in a loop.
const MAX_RULE_DEPTH: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("Expected \"{0}\"")]
    Expected(TokenType),
    #[error("Invalid number literal")]
    InvalidNumber(#[from] std::num::ParseFloatError),
    #[error("Expression is nested too deeply")]
    TooDeep,
}

/// Parse failure, carrying the grammar rules that were active and the
/// token the parser gave up on.
#[derive(Debug)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    rules: Vec<&'static str>,
    found: TokenType,
    lexeme: Option<String>,
    span: Span,
}

impl ParseError {
    /// Token type the parser required, if the failure was a missing token.
    pub fn expected(&self) -> Option<TokenType> {
        match self.kind {
            ParseErrorKind::Expected(token_type) => Some(token_type),
            _ => None,
        }
    }

    pub fn found(&self) -> TokenType {
        self.found
    }

    pub fn lexeme(&self) -> Option<&str> {
        self.lexeme.as_deref()
    }

    pub fn span(&self) -> Span {
        self.span
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ParseErrorKind::InvalidNumber(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "While parsing {}", self.rules.join(" > "))?;
        write!(f, "{} at {} but found \"{}\"", self.kind, self.span.start, self.found)?;
        if let Some(lexeme) = &self.lexeme {
            write!(f, " ({})", lexeme)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ParseContext {
    stack: RefCell<Vec<&'static str>>,
}

impl ParseContext {
    fn new() -> Self {
        Self {
            stack: RefCell::new(Vec::new()),
        }
    }

    fn push(self: &Rc<Self>, name: &'static str) -> ParseContextGuard {
        self.stack.borrow_mut().push(name);
        ParseContextGuard::new(self.clone())
    }

    fn pop(&self) {
        self.stack.borrow_mut().pop();
    }

    fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    fn snapshot(&self) -> Vec<&'static str> {
        self.stack.borrow().clone()
    }
}

struct ParseContextGuard {
    context: Rc<ParseContext>,
}

impl ParseContextGuard {
    fn new(context: Rc<ParseContext>) -> Self {
        Self { context }
    }
}

impl Drop for ParseContextGuard {
    fn drop(&mut self) {
        self.context.pop();
    }
}

/// Parses a complete expression. Trailing tokens are an error.
pub fn parse(source: &str) -> Result<Node, ParseError> {
    Parser::new(Tokenizer::new(source)).parse()
}

/// Recursive-descent parser with one token of lookahead.
///
/// ```text
/// expression := term (('+' | '-') term)*
/// term       := exponent (('*' | '/' | '%') exponent)*
/// exponent   := factor ('^' exponent)?
/// factor     := identifier ('(' parameters? ')')?
///             | '(' expression ')'
///             | ('+' | '-') factor
///             | number
/// parameters := expression (',' expression)*
/// ```
pub struct Parser<'a> {
    tokenizer: Tokenizer<'a>,
    context: Rc<ParseContext>,
}

impl<'a> Parser<'a> {
    pub fn new(tokenizer: Tokenizer<'a>) -> Self {
        Self {
            tokenizer,
            context: Rc::new(ParseContext::new()),
        }
    }

    pub fn parse(mut self) -> Result<Node, ParseError> {
        let _guard = self.enter("root")?;
        let node = self.expression()?;
        self.consume(TokenType::Eof)?;
        Ok(node)
    }

    fn enter(&self, name: &'static str) -> Result<ParseContextGuard, ParseError> {
        let guard = self.context.push(name);
        if self.context.depth() > MAX_RULE_DEPTH {
            return Err(self.error(ParseErrorKind::TooDeep));
        }
        Ok(guard)
    }

    fn binary(
        &mut self,
        precedence: fn(&mut Self) -> Result<Node, ParseError>,
        operator: fn(TokenType) -> Option<Operator>,
    ) -> Result<Node, ParseError> {
        let mut node = precedence(self)?;

        while let Some(op) = operator(self.peek()) {
            self.advance();
            let right = precedence(self)?;
            node = Node::operator(op, node, right);
        }

        Ok(node)
    }

    fn expression(&mut self) -> Result<Node, ParseError> {
        let _guard = self.enter("expression")?;
        self.binary(Self::term, |token_type| match token_type {
            TokenType::Plus => Some(Operator::Plus),
            TokenType::Minus => Some(Operator::Minus),
            _ => None,
        })
    }

    fn term(&mut self) -> Result<Node, ParseError> {
        let _guard = self.enter("term")?;
        self.binary(Self::exponent, |token_type| match token_type {
            TokenType::Star => Some(Operator::Multiply),
            TokenType::Slash => Some(Operator::Divide),
            TokenType::Percent => Some(Operator::Modulo),
            _ => None,
        })
    }

    fn exponent(&mut self) -> Result<Node, ParseError> {
        let _guard = self.enter("exponent")?;
        let mut node = self.factor()?;
        let mut bases = Vec::new();

        while self.tokenizer.consume(TokenType::Caret) {
            bases.push(node);
            node = self.factor()?;
        }

        // Right associative: the last factor is the innermost exponent
        Ok(bases.into_iter().rev().fold(node, |exponent, base| {
            Node::operator(Operator::Exponent, base, exponent)
        }))
    }

    fn factor(&mut self) -> Result<Node, ParseError> {
        let _guard = self.enter("factor")?;
        let mut signs = Vec::new();
        loop {
            match self.peek() {
                TokenType::Plus => signs.push(Operator::Plus),
                TokenType::Minus => signs.push(Operator::Minus),
                _ => break,
            }
            self.advance();
        }

        let token = *self.tokenizer.current();
        let node = match token.token_type {
            TokenType::Identifier => {
                self.advance();
                let identifier = token.lexeme.unwrap_or_default().to_string();
                if self.tokenizer.consume(TokenType::LeftParen) {
                    let parameters = self.parameters()?;
                    self.consume(TokenType::RightParen)?;
                    Node::Function(identifier, parameters)
                } else {
                    Node::Variable(identifier)
                }
            }
            TokenType::LeftParen => {
                self.advance();
                let node = self.expression()?;
                self.consume(TokenType::RightParen)?;
                node
            }
            _ => {
                self.consume(TokenType::Number)?;
                let value = token
                    .lexeme
                    .unwrap_or_default()
                    .parse::<f64>()
                    .map_err(|e| self.error_at(&token, e.into()))?;
                Node::Number(value)
            }
        };

        Ok(signs
            .into_iter()
            .rev()
            .fold(node, |child, sign| Node::unary(sign, child)))
    }

    fn parameters(&mut self) -> Result<Vec<Node>, ParseError> {
        let _guard = self.enter("parameters")?;
        let mut parameters = Vec::new();
        if self.peek() == TokenType::RightParen {
            return Ok(parameters);
        }

        parameters.push(self.expression()?);
        while self.tokenizer.consume(TokenType::Comma) {
            parameters.push(self.expression()?);
        }

        Ok(parameters)
    }

    fn peek(&self) -> TokenType {
        self.tokenizer.current().token_type
    }

    fn advance(&mut self) {
        let token_type = self.peek();
        self.tokenizer.consume(token_type);
    }

    fn consume(&mut self, token_type: TokenType) -> Result<(), ParseError> {
        if self.tokenizer.consume(token_type) {
            Ok(())
        } else {
            Err(self.error(ParseErrorKind::Expected(token_type)))
        }
    }

    fn error(&self, kind: ParseErrorKind) -> ParseError {
        self.error_at(self.tokenizer.current(), kind)
    }

    fn error_at(&self, token: &Token<'_>, kind: ParseErrorKind) -> ParseError {
        ParseError {
            kind,
            rules: self.context.snapshot(),
            found: token.token_type,
            lexeme: token.lexeme.map(str::to_string),
            span: token.span,
        }
    }
}
