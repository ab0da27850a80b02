use crate::ParseError;
use ariadne::{Label, Report, ReportKind, Source};
use std::io;

impl ParseError {
    /// Writes an annotated report to stderr, pointing at the offending token.
    /// `source_id` names the input in the report (a file name, or "REPL").
    pub fn pretty_print(&self, source_id: &str, input: &str) -> io::Result<()> {
        let range = self.span().to_range();
        let label = match self {
            ParseError::Lex { found, .. } => format!("'{}' cannot start any token", found),
            ParseError::UnexpectedRightParen { .. } => "nothing to close here".to_string(),
            ParseError::UnexpectedLexeme { lexeme, .. } => {
                format!("'{}' is not allowed here", lexeme)
            }
            ParseError::UnbalancedParens { .. } => "this paren is never closed".to_string(),
            ParseError::UnexpectedEof { .. } => "expected a form after this".to_string(),
            ParseError::InvalidDotSyntax { .. } => {
                "a dot must be followed by exactly one form".to_string()
            }
        };
        Report::build(ReportKind::Error, (source_id, range.clone()))
            .with_message(self.to_string())
            .with_label(Label::new((source_id, range)).with_message(label))
            .finish()
            .eprint((source_id, Source::from(input)))
    }
}
