// Declare modules publicly so they are part of the library interface
pub mod environment;
pub mod error;
pub mod evaluator;
pub mod lexer;
pub mod natives;
pub mod parser;
pub mod pretty_print;
pub mod source;
pub mod types;

pub use environment::{EnvError, Environment};
pub use error::{ErrorKind, EvalError, EvalResult};
pub use evaluator::Evaluator;
pub use lexer::{Token, TokenKind, is_balanced, tokenize, tokenize_str};
pub use natives::NativeRegistry;
pub use parser::{ParseError, Parser, parse, parse_str};
pub use source::Span;
pub use types::{Closure, NativeFunction, Procedure, Sexpr};
