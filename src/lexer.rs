use logos::Logos;
use num_bigint::BigInt;
use std::fmt;

use crate::Span;
use crate::parser::ParseError;

// Raw lexemes as logos sees them. Unrecognized input surfaces as `Err(())`
// and is turned into an in-place `TokenKind::Error`.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")] // Skip whitespace
#[logos(skip r";[^\n]*")] // Skip comments
enum Lexeme {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("'")]
    Quote,
    #[token("`")]
    SyntaxQuote,
    #[token("~")]
    Unquote,
    #[token("~@")]
    SplicingUnquote,
    #[token(".")]
    Dot,
    #[token("#_")]
    CommentNext,
    #[regex(r"#![^\n]*", |lex| lex.slice().to_string())]
    Shebang(String),
    // A sign only starts a number when a digit follows.
    #[regex(r"[+-]?[0-9]+", |lex| lex.slice().trim_start_matches('+').parse::<BigInt>().ok())]
    Number(BigInt),
    #[regex(r"[^ \t\n\r()~@#;`'0-9+\-.][^ \t\n\r()~@#;`']*", |lex| lex.slice().to_string())]
    #[regex(r"[+\-]([^ \t\n\r()~@#;`'0-9][^ \t\n\r()~@#;`']*)?", |lex| lex.slice().to_string())]
    Atom(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    LParen,
    RParen,
    Quote,
    SyntaxQuote,
    Unquote,
    SplicingUnquote,
    Dot,
    CommentNext,
    Shebang(String),
    Number(BigInt),
    Atom(String),
    Error(String), // The offending text
}

impl From<Lexeme> for TokenKind {
    fn from(lexeme: Lexeme) -> Self {
        match lexeme {
            Lexeme::LParen => TokenKind::LParen,
            Lexeme::RParen => TokenKind::RParen,
            Lexeme::Quote => TokenKind::Quote,
            Lexeme::SyntaxQuote => TokenKind::SyntaxQuote,
            Lexeme::Unquote => TokenKind::Unquote,
            Lexeme::SplicingUnquote => TokenKind::SplicingUnquote,
            Lexeme::Dot => TokenKind::Dot,
            Lexeme::CommentNext => TokenKind::CommentNext,
            Lexeme::Shebang(s) => TokenKind::Shebang(s),
            Lexeme::Number(n) => TokenKind::Number(n),
            Lexeme::Atom(s) => TokenKind::Atom(s),
        }
    }
}

// Implement Display for easy printing
impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::Quote => write!(f, "'"),
            TokenKind::SyntaxQuote => write!(f, "`"),
            TokenKind::Unquote => write!(f, "~"),
            TokenKind::SplicingUnquote => write!(f, "~@"),
            TokenKind::Dot => write!(f, "."),
            TokenKind::CommentNext => write!(f, "#_"),
            TokenKind::Shebang(s) => write!(f, "{}", s),
            TokenKind::Number(n) => write!(f, "{}", n),
            TokenKind::Atom(s) => write!(f, "{}", s),
            TokenKind::Error(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span, // Byte offsets into the joined source
    pub line: usize, // 1-based
}

/// Tokenizes source given as lines. Spans are offsets into the lines joined
/// with '\n', so they line up with the source text for diagnostics.
pub fn tokenize(lines: &[&str]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut line_start = 0;
    for (index, line) in lines.iter().enumerate() {
        for (result, range) in Lexeme::lexer(line).spanned() {
            let span = Span::new(range.start, range.end).offset(line_start);
            let kind = match result {
                Ok(lexeme) => TokenKind::from(lexeme),
                Err(()) => TokenKind::Error(line[range].to_string()),
            };
            tokens.push(Token {
                kind,
                span,
                line: index + 1,
            });
        }
        line_start += line.len() + 1;
    }
    tokens
}

// Helper function to tokenize a string directly (useful for tests and drivers)
pub fn tokenize_str(source: &str) -> Vec<Token> {
    let lines: Vec<&str> = source.split('\n').collect();
    tokenize(&lines)
}

/// Reports whether the parens in `tokens` close out. `Ok(false)` means more
/// input is needed; a closer with nothing to close is an error.
pub fn is_balanced(tokens: &[Token]) -> Result<bool, ParseError> {
    let mut depth: usize = 0;
    for token in tokens {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen if depth == 0 => {
                return Err(ParseError::UnexpectedRightParen {
                    line: token.line,
                    span: token.span,
                });
            }
            TokenKind::RParen => depth -= 1,
            _ => {}
        }
    }
    Ok(depth == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Helper to simplify testing token sequences
    fn assert_tokens(input: &str, expected: Vec<TokenKind>) {
        let kinds: Vec<TokenKind> = tokenize_str(input).into_iter().map(|t| t.kind).collect();
        assert_eq!(kinds, expected, "Input: '{}'", input);
    }

    fn atom(s: &str) -> TokenKind {
        TokenKind::Atom(s.to_string())
    }

    fn num(n: i64) -> TokenKind {
        TokenKind::Number(BigInt::from(n))
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert_tokens("", vec![]);
        assert_tokens(" \t ", vec![]);
        assert_tokens("; just a comment", vec![]);
    }

    #[test]
    fn test_numbers() {
        assert_tokens("1", vec![num(1)]);
        assert_tokens("-5", vec![num(-5)]);
        assert_tokens("+5", vec![num(5)]);
        assert_tokens("1 2 3", vec![num(1), num(2), num(3)]);
        let big: BigInt = "1309875618907812098".parse().unwrap();
        assert_tokens("1309875618907812098", vec![TokenKind::Number(big)]);
    }

    #[test]
    fn test_signs_fall_through_to_atoms() {
        assert_tokens("+", vec![atom("+")]);
        assert_tokens("-", vec![atom("-")]);
        assert_tokens("-foo", vec![atom("-foo")]);
        assert_tokens("--5", vec![atom("--5")]);
        assert_tokens("-5x", vec![num(-5), atom("x")]);
    }

    #[test]
    fn test_atoms() {
        assert_tokens("a", vec![atom("a")]);
        assert_tokens("a1 b2", vec![atom("a1"), atom("b2")]);
        assert_tokens("a.b", vec![atom("a.b")]);
        assert_tokens("list?", vec![atom("list?")]);
        assert_tokens("set!", vec![atom("set!")]);
        assert_tokens("<=", vec![atom("<=")]);
        assert_tokens("λ", vec![atom("λ")]);
        assert_tokens("foo'bar", vec![atom("foo"), TokenKind::Quote, atom("bar")]);
    }

    #[test]
    fn test_parens_and_sugar() {
        assert_tokens(
            "(a (b))",
            vec![
                TokenKind::LParen,
                atom("a"),
                TokenKind::LParen,
                atom("b"),
                TokenKind::RParen,
                TokenKind::RParen,
            ],
        );
        assert_tokens(
            "'a `b ~c ~@d #_e",
            vec![
                TokenKind::Quote,
                atom("a"),
                TokenKind::SyntaxQuote,
                atom("b"),
                TokenKind::Unquote,
                atom("c"),
                TokenKind::SplicingUnquote,
                atom("d"),
                TokenKind::CommentNext,
                atom("e"),
            ],
        );
        assert_tokens(
            "(1 . 2)",
            vec![
                TokenKind::LParen,
                num(1),
                TokenKind::Dot,
                num(2),
                TokenKind::RParen,
            ],
        );
    }

    #[test]
    fn test_comments() {
        assert_tokens("a ; the rest (is ignored", vec![atom("a")]);
        assert_tokens("a ; one\nb", vec![atom("a"), atom("b")]);
    }

    #[test]
    fn test_shebang() {
        assert_tokens(
            "#!/usr/bin/env conslisp\n1",
            vec![TokenKind::Shebang("#!/usr/bin/env conslisp".to_string()), num(1)],
        );
    }

    #[test]
    fn test_error_tokens_do_not_stop_lexing() {
        assert_tokens(
            "(a @ b)",
            vec![
                TokenKind::LParen,
                atom("a"),
                TokenKind::Error("@".to_string()),
                atom("b"),
                TokenKind::RParen,
            ],
        );
    }

    #[test]
    fn test_lines_and_spans() {
        let tokens = tokenize(&["a", "  (b"]);
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[0].span, Span::new(0, 1));
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[1].span, Span::new(4, 5));
        assert_eq!(tokens[2].span, Span::new(5, 6));
    }

    #[test]
    fn test_is_balanced() {
        assert_eq!(is_balanced(&tokenize_str("(a (b))")), Ok(true));
        assert_eq!(is_balanced(&tokenize_str("(a (b)")), Ok(false));
        assert_eq!(is_balanced(&tokenize_str("a")), Ok(true));
        assert!(is_balanced(&tokenize_str("a)")).is_err());
    }
}
