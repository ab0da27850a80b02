use crate::Span;
use crate::lexer::{Token, TokenKind, tokenize_str};
use crate::types::Sexpr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unexpected character '{found}' in input on line {line}")]
    Lex {
        found: String,
        line: usize,
        span: Span,
    },
    #[error("unexpected right paren on line {line}")]
    UnexpectedRightParen { line: usize, span: Span },
    #[error("unexpected lexeme '{lexeme}' on line {line}")]
    UnexpectedLexeme {
        lexeme: String,
        line: usize,
        span: Span,
    },
    #[error("unbalanced parens")]
    UnbalancedParens { line: usize, span: Span }, // Points at the unclosed paren
    #[error("unexpected end of input")]
    UnexpectedEof { line: usize, span: Span },
    #[error("malformed dotted pair on line {line}")]
    InvalidDotSyntax { line: usize, span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::Lex { span, .. }
            | ParseError::UnexpectedRightParen { span, .. }
            | ParseError::UnexpectedLexeme { span, .. }
            | ParseError::UnbalancedParens { span, .. }
            | ParseError::UnexpectedEof { span, .. }
            | ParseError::InvalidDotSyntax { span, .. } => *span,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            ParseError::Lex { line, .. }
            | ParseError::UnexpectedRightParen { line, .. }
            | ParseError::UnexpectedLexeme { line, .. }
            | ParseError::UnbalancedParens { line, .. }
            | ParseError::UnexpectedEof { line, .. }
            | ParseError::InvalidDotSyntax { line, .. } => *line,
        }
    }
}

// Result type alias for convenience
pub type ParseResult<T> = Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<Token>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens }
    }

    /// Parses every top-level form. A shebang is skipped only as the very first token.
    pub fn parse(self) -> ParseResult<Vec<Sexpr>> {
        parse(&self.tokens)
    }
}

pub fn parse(tokens: &[Token]) -> ParseResult<Vec<Sexpr>> {
    match tokens.first() {
        Some(Token {
            kind: TokenKind::Shebang(_),
            ..
        }) => parse_forms(&tokens[1..]),
        _ => parse_forms(tokens),
    }
}

// Helper to parse a string directly
pub fn parse_str(input: &str) -> ParseResult<Vec<Sexpr>> {
    Parser::new(tokenize_str(input)).parse()
}

fn parse_forms(tokens: &[Token]) -> ParseResult<Vec<Sexpr>> {
    let mut forms = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let (form, consumed) = parse_next(tokens, i)?;
        forms.push(form);
        i += consumed;
    }
    Ok(forms)
}

/// Parses the form starting at `tokens[i]`, returning it with the number of tokens used.
fn parse_next(tokens: &[Token], i: usize) -> ParseResult<(Sexpr, usize)> {
    let token = &tokens[i];
    let quote_symbol = match &token.kind {
        TokenKind::Number(n) => return Ok((Sexpr::Number(n.clone()), 1)),
        TokenKind::Atom(name) => return Ok((Sexpr::Atom(name.clone()), 1)),
        TokenKind::LParen => return parse_list(&tokens[i..]),
        TokenKind::RParen => {
            return Err(ParseError::UnexpectedRightParen {
                line: token.line,
                span: token.span,
            });
        }
        TokenKind::Error(found) => {
            return Err(ParseError::Lex {
                found: found.clone(),
                line: token.line,
                span: token.span,
            });
        }
        TokenKind::Dot | TokenKind::Shebang(_) => {
            return Err(ParseError::UnexpectedLexeme {
                lexeme: token.kind.to_string(),
                line: token.line,
                span: token.span,
            });
        }
        TokenKind::Quote => "quote",
        TokenKind::SyntaxQuote => "syntax-quote",
        TokenKind::Unquote => "unquote",
        TokenKind::SplicingUnquote => "splicing-unquote",
        TokenKind::CommentNext => "comment",
    };
    // Quote-family sugar wraps whatever form comes next.
    if i + 1 >= tokens.len() {
        return Err(ParseError::UnexpectedEof {
            line: token.line,
            span: token.span,
        });
    }
    let (quoted, consumed) = parse_next(tokens, i + 1)?;
    Ok((Sexpr::list([Sexpr::atom(quote_symbol), quoted]), consumed + 1))
}

/// `tokens[0]` is the opening paren.
fn parse_list(tokens: &[Token]) -> ParseResult<(Sexpr, usize)> {
    let (chunk_end, ends_in_dot) = list_chunk(tokens)?;
    if !ends_in_dot {
        let contents = parse_forms(&tokens[1..chunk_end])?;
        return Ok((Sexpr::list(contents), chunk_end + 1));
    }
    let heads = parse_forms(&tokens[1..chunk_end])?;
    let tail_end = dot_chunk(&tokens[chunk_end..], &tokens[0])?;
    let mut tail = parse_forms(&tokens[chunk_end + 1..chunk_end + tail_end])?;
    if tail.len() != 1 {
        let dot = &tokens[chunk_end];
        return Err(ParseError::InvalidDotSyntax {
            line: dot.line,
            span: dot.span,
        });
    }
    let tail = tail.remove(0);
    Ok((Sexpr::list_with_tail(heads, tail), chunk_end + tail_end + 1))
}

/// Finds the closing paren of the list opened at `tokens[0]`, or a dot at
/// depth one. Returns its index and whether it was a dot.
fn list_chunk(tokens: &[Token]) -> ParseResult<(usize, bool)> {
    let mut depth = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Ok((i, false));
                }
            }
            TokenKind::Dot if depth == 1 => return Ok((i, true)),
            _ => {}
        }
    }
    Err(unbalanced(&tokens[0]))
}

/// `tokens[0]` is the dot; finds the paren closing the enclosing list.
fn dot_chunk(tokens: &[Token], open: &Token) -> ParseResult<usize> {
    let mut depth = 1;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(unbalanced(open))
}

fn unbalanced(open: &Token) -> ParseError {
    ParseError::UnbalancedParens {
        line: open.line,
        span: open.span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Helper to check the rendering of everything parsed from `input`
    fn assert_parse(input: &str, expected: &[&str]) {
        match parse_str(input) {
            Ok(forms) => {
                let rendered: Vec<String> = forms.iter().map(|f| f.to_string()).collect();
                assert_eq!(rendered, expected, "Input: '{}'", input);
            }
            Err(e) => panic!("Parsing failed for input '{}': {}", input, e),
        }
    }

    fn assert_parse_error(input: &str, expected_message: &str) {
        match parse_str(input) {
            Ok(forms) => panic!("Expected error for '{}', got {:?}", input, forms),
            Err(e) => assert_eq!(e.to_string(), expected_message, "Input: '{}'", input),
        }
    }

    fn num(n: i64) -> Sexpr {
        Sexpr::number(n)
    }

    #[test]
    fn test_parse_atoms() {
        assert_parse("", &[]);
        assert_parse("1", &["1"]);
        assert_parse("-12", &["-12"]);
        assert_parse("a b", &["a", "b"]);
        assert_parse("12349807213490872130987", &["12349807213490872130987"]);
    }

    #[test]
    fn test_parse_lists() {
        assert_parse("()", &["()"]);
        assert_parse("(1 2 3)", &["(1 2 3)"]);
        assert_parse("(a (b c) ())", &["(a (b c) ())"]);
        assert_parse("(1) (2)", &["(1)", "(2)"]);
        assert_parse("(\n1\n2)", &["(1 2)"]);
    }

    #[test]
    fn test_parse_dotted_pairs() {
        let forms = parse_str("(1 2 . 3)").unwrap();
        assert_eq!(
            forms,
            vec![Sexpr::cons(num(1), Sexpr::cons(num(2), num(3)))]
        );
        assert_parse("(1 2 . 3)", &["(1 2 . 3)"]);
        assert_parse("(1 . (2 . (3 . ())))", &["(1 2 3)"]);
        assert_parse("((a . b) . (c))", &["((a . b) c)"]);
        assert_parse("(a . (b c))", &["(a b c)"]);
        assert_parse("(. x)", &["x"]);
    }

    #[test]
    fn test_parse_quote_sugar() {
        assert_parse("'a", &["(quote a)"]);
        assert_parse("'(1 2)", &["(quote (1 2))"]);
        assert_parse("`(a ~b ~@c)", &["(syntax-quote (a (unquote b) (splicing-unquote c)))"]);
        assert_parse("''a", &["(quote (quote a))"]);
        assert_parse("#_(ignored) 1", &["(comment (ignored))", "1"]);
    }

    #[test]
    fn test_parse_shebang() {
        assert_parse("#!/usr/bin/env conslisp\n(+ 1 2)", &["(+ 1 2)"]);
        assert_parse_error("1\n#!/bin/sh", "unexpected lexeme '#!/bin/sh' on line 2");
    }

    #[test]
    fn test_parse_errors() {
        assert_parse_error(")", "unexpected right paren on line 1");
        assert_parse_error("(1 2", "unbalanced parens");
        assert_parse_error("((1)", "unbalanced parens");
        assert_parse_error("(1 . 2", "unbalanced parens");
        assert_parse_error("'", "unexpected end of input");
        assert_parse_error(".", "unexpected lexeme '.' on line 1");
        assert_parse_error("(1 .)", "malformed dotted pair on line 1");
        assert_parse_error("(1 . 2 3)", "malformed dotted pair on line 1");
        assert_parse_error("\n(a @)", "unexpected character '@' in input on line 2");
    }

    #[test]
    fn test_error_positions() {
        let err = parse_str("(a\n  (b").unwrap_err();
        assert_eq!(err.line(), 1);
        assert_eq!(err.span(), Span::new(0, 1));
        let err = parse_str("1 )").unwrap_err();
        assert_eq!(err.span(), Span::new(2, 3));
    }
}
