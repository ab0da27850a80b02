use crate::environment::EnvError;
use crate::parser::ParseError;
use crate::types::Sexpr;
use std::fmt;
use thiserror::Error;

// --- Evaluation Error ---

/// Coarse classification of a failure. The trace carries the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lex,
    Parse,
    Binding,
    Arity,
    Type,
    Syntax,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Lex => "lex",
            ErrorKind::Parse => "parse",
            ErrorKind::Binding => "binding",
            ErrorKind::Arity => "arity",
            ErrorKind::Type => "type",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Runtime => "runtime",
        };
        write!(f, "{}", name)
    }
}

/// An evaluation failure. `trace` is itself a list value: each element is one
/// frame of context, outermost first, and the innermost message last.
///
/// `(error '(boom))` deep inside a lambda renders as
/// `((lambda (f)) (boom))`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{trace}")]
pub struct EvalError {
    pub kind: ErrorKind,
    pub trace: Sexpr,
}

pub type EvalResult<T = Sexpr> = Result<T, EvalError>;

impl EvalError {
    /// A fresh error whose trace is a single frame made of the message's words.
    pub fn new(kind: ErrorKind, message: impl AsRef<str>) -> Self {
        EvalError {
            kind,
            trace: Sexpr::list([Sexpr::words(message.as_ref())]),
        }
    }

    /// An error raised from user code via `error`; the value becomes the only frame.
    pub fn raised(value: Sexpr) -> Self {
        EvalError {
            kind: ErrorKind::Runtime,
            trace: Sexpr::cons(value, Sexpr::Nil),
        }
    }

    /// Prepends a frame made of the words of `context`.
    pub fn extend(self, context: impl AsRef<str>) -> Self {
        self.extend_with(Sexpr::words(context.as_ref()))
    }

    /// Prepends an arbitrary frame.
    pub fn extend_with(self, frame: Sexpr) -> Self {
        EvalError {
            kind: self.kind,
            trace: Sexpr::cons(frame, self.trace),
        }
    }
}

impl From<EnvError> for EvalError {
    fn from(err: EnvError) -> Self {
        EvalError::new(ErrorKind::Binding, err.to_string())
    }
}

impl From<ParseError> for EvalError {
    fn from(err: ParseError) -> Self {
        let kind = match err {
            ParseError::Lex { .. } => ErrorKind::Lex,
            _ => ErrorKind::Parse,
        };
        EvalError::new(kind, err.to_string())
    }
}
