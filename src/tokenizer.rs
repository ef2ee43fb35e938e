use crate::span::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    // Single-character tokens
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LeftParen,
    RightParen,
    Comma,

    // Literals
    Identifier,
    Number,

    // Anything we don't understand, carried through for the parser to reject
    Unknown,

    // End of input
    Eof,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Plus => write!(f, "+"),
            TokenType::Minus => write!(f, "-"),
            TokenType::Star => write!(f, "*"),
            TokenType::Slash => write!(f, "/"),
            TokenType::Percent => write!(f, "%"),
            TokenType::Caret => write!(f, "^"),
            TokenType::LeftParen => write!(f, "("),
            TokenType::RightParen => write!(f, ")"),
            TokenType::Comma => write!(f, ","),
            TokenType::Identifier => write!(f, "identifier"),
            TokenType::Number => write!(f, "number"),
            TokenType::Unknown => write!(f, "unknown"),
            TokenType::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub token_type: TokenType,
    /// Source text for identifiers, numbers and unknown characters.
    pub lexeme: Option<&'a str>,
    pub span: Span,
}

impl<'a> Token<'a> {
    fn new(token_type: TokenType, lexeme: Option<&'a str>, span: Span) -> Self {
        Self {
            token_type,
            lexeme,
            span,
        }
    }

    pub fn token_type(&self) -> TokenType {
        self.token_type
    }
}

impl std::fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.lexeme {
            Some(lexeme) => write!(f, "{} \"{}\"", self.token_type, lexeme),
            None => write!(f, "{}", self.token_type),
        }
    }
}

/// Pull-based tokenizer. Holds one token of lookahead and never scans backwards.
#[derive(Debug, Clone)]
pub struct Tokenizer<'a> {
    source: &'a str,
    cursor: usize,
    current: Token<'a>,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut tokenizer = Self {
            source,
            cursor: 0,
            current: Token::new(TokenType::Eof, None, Span::default()),
        };
        tokenizer.current = tokenizer.scan();
        tokenizer
    }

    pub fn current(&self) -> &Token<'a> {
        &self.current
    }

    /// Advances past the current token if it has the given type.
    pub fn consume(&mut self, token_type: TokenType) -> bool {
        if self.current.token_type != token_type {
            return false;
        }
        self.current = self.scan();
        true
    }

    fn scan(&mut self) -> Token<'a> {
        let rest = &self.source[self.cursor..];
        let trimmed = rest.trim_start();
        self.cursor += rest.len() - trimmed.len();

        let start = self.cursor;
        let Some(c) = trimmed.chars().next() else {
            return Token::new(TokenType::Eof, None, Span::new(start, start));
        };

        let single = match c {
            '+' => Some(TokenType::Plus),
            '-' => Some(TokenType::Minus),
            '*' => Some(TokenType::Star),
            '/' => Some(TokenType::Slash),
            '%' => Some(TokenType::Percent),
            '^' => Some(TokenType::Caret),
            '(' => Some(TokenType::LeftParen),
            ')' => Some(TokenType::RightParen),
            ',' => Some(TokenType::Comma),
            _ => None,
        };
        if let Some(token_type) = single {
            self.cursor += 1;
            return Token::new(token_type, None, Span::new(start, self.cursor));
        }

        let (token_type, len) = if c.is_ascii_digit() {
            (TokenType::Number, number(trimmed))
        } else if is_identifier_start(c) {
            (TokenType::Identifier, identifier(trimmed))
        } else {
            (TokenType::Unknown, c.len_utf8())
        };

        self.cursor += len;
        Token::new(
            token_type,
            Some(&self.source[start..self.cursor]),
            Span::new(start, self.cursor),
        )
    }
}

/// Tokenizes the whole source, including the trailing `Eof`.
pub fn tokens(source: &str) -> Vec<Token<'_>> {
    let mut tokenizer = Tokenizer::new(source);
    let mut tokens = Vec::new();

    loop {
        let token = *tokenizer.current();
        tokens.push(token);
        if token.token_type == TokenType::Eof || !tokenizer.consume(token.token_type) {
            break;
        }
    }

    tokens
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '_' | '@' | '$' | '#')
}

fn is_identifier_continue(c: char) -> bool {
    is_identifier_start(c) || c.is_ascii_digit()
}

fn digits(source: &str) -> usize {
    source.bytes().take_while(u8::is_ascii_digit).count()
}

fn number(source: &str) -> usize {
    let whole = digits(source);
    match source[whole..].strip_prefix('.') {
        Some(fraction) => whole + 1 + digits(fraction),
        None => whole,
    }
}

fn identifier(source: &str) -> usize {
    source
        .chars()
        .take_while(|c| is_identifier_continue(*c))
        .map(char::len_utf8)
        .sum()
}

#[cfg(test)]
mod test {
    use super::*;

    fn types(source: &str) -> Vec<TokenType> {
        tokens(source).iter().map(Token::token_type).collect()
    }

    #[test]
    fn test_tokens() {
        let source = "2 + x1 * (3.5 - f(a, b)) ^ 2 % 4 / y";
        let expected = vec![
            TokenType::Number,
            TokenType::Plus,
            TokenType::Identifier,
            TokenType::Star,
            TokenType::LeftParen,
            TokenType::Number,
            TokenType::Minus,
            TokenType::Identifier,
            TokenType::LeftParen,
            TokenType::Identifier,
            TokenType::Comma,
            TokenType::Identifier,
            TokenType::RightParen,
            TokenType::RightParen,
            TokenType::Caret,
            TokenType::Number,
            TokenType::Percent,
            TokenType::Number,
            TokenType::Slash,
            TokenType::Identifier,
            TokenType::Eof,
        ];
        assert_eq!(types(source), expected);
    }

    #[test]
    fn test_tokens_with_whitespace() {
        let tokens = tokens("  \t12.25\n ");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].lexeme, Some("12.25"));
        assert_eq!(tokens[0].span, Span::new(3, 8));
        assert_eq!(tokens[1].token_type, TokenType::Eof);
    }

    #[test]
    fn test_number_without_exponent_or_sign() {
        let tokens = tokens("1e5");
        assert_eq!(tokens[0].lexeme, Some("1"));
        assert_eq!(tokens[1].lexeme, Some("e5"));

        let tokens = super::tokens("-7");
        assert_eq!(tokens[0].token_type, TokenType::Minus);
        assert_eq!(tokens[1].lexeme, Some("7"));
    }

    #[test]
    fn test_trailing_dot_belongs_to_number() {
        let tokens = tokens("3.");
        assert_eq!(tokens[0].lexeme, Some("3."));
        assert_eq!(tokens[1].token_type, TokenType::Eof);
    }

    #[test]
    fn test_identifier_characters() {
        let tokens = tokens("_a@b$c#d9 x");
        assert_eq!(tokens[0].token_type, TokenType::Identifier);
        assert_eq!(tokens[0].lexeme, Some("_a@b$c#d9"));
        assert_eq!(tokens[1].lexeme, Some("x"));
    }

    #[test]
    fn test_unknown_characters() {
        let tokens = tokens("1 ? é");
        assert_eq!(tokens[1].token_type, TokenType::Unknown);
        assert_eq!(tokens[1].lexeme, Some("?"));
        assert_eq!(tokens[2].token_type, TokenType::Unknown);
        assert_eq!(tokens[2].lexeme, Some("é"));
        assert_eq!(tokens[3].token_type, TokenType::Eof);
    }

    #[test]
    fn test_consume_only_advances_on_match() {
        let mut tokenizer = Tokenizer::new("a +");
        assert!(!tokenizer.consume(TokenType::Number));
        assert_eq!(tokenizer.current().lexeme, Some("a"));
        assert!(tokenizer.consume(TokenType::Identifier));
        assert!(tokenizer.consume(TokenType::Plus));
        assert!(tokenizer.consume(TokenType::Eof));
        assert_eq!(tokenizer.current().token_type, TokenType::Eof);
        assert!(tokenizer.consume(TokenType::Eof));
        assert_eq!(tokenizer.current().token_type, TokenType::Eof);
    }
}
