use crate::environment::Environment;
use crate::error::{ErrorKind, EvalError, EvalResult};
use crate::evaluator::Evaluator;
use num_bigint::BigInt;
use std::cell::RefCell;
use std::fmt; // For custom display formatting
use std::rc::Rc;

/// The canonical truth value. Everything except `()` is truthy, but predicates return this atom.
pub const TRUTH: &str = "t";

/// Represents an S-expression (Symbolic Expression).
/// This enum is the core data structure for both code (AST) and data.
#[derive(Debug, Clone)]
pub enum Sexpr {
    Atom(String),    // e.g., +, variable-name, quote
    Number(BigInt),  // Arbitrary precision, base-10 when printed
    Pair(Rc<Pair>),  // A cons cell; lists are chains of these ending in Nil
    Nil,             // Represents the empty list '()
    Procedure(Procedure),
}

/// A cons cell. Immutable once built; shared through `Rc`.
#[derive(Debug)]
pub struct Pair {
    pub head: Sexpr,
    pub tail: Sexpr,
}

// Dropping a long list would otherwise recurse once per cell.
impl Drop for Pair {
    fn drop(&mut self) {
        let mut tail = std::mem::replace(&mut self.tail, Sexpr::Nil);
        while let Sexpr::Pair(cell) = tail {
            match Rc::try_unwrap(cell) {
                Ok(mut pair) => tail = std::mem::replace(&mut pair.tail, Sexpr::Nil),
                Err(_) => break,
            }
        }
    }
}

impl Sexpr {
    pub fn atom(name: impl Into<String>) -> Self {
        Sexpr::Atom(name.into())
    }

    pub fn number(n: impl Into<BigInt>) -> Self {
        Sexpr::Number(n.into())
    }

    pub fn truth() -> Self {
        Sexpr::Atom(TRUTH.to_string())
    }

    pub fn from_bool(b: bool) -> Self {
        if b { Sexpr::truth() } else { Sexpr::Nil }
    }

    pub fn cons(head: Sexpr, tail: Sexpr) -> Self {
        Sexpr::Pair(Rc::new(Pair { head, tail }))
    }

    /// Builds a proper list from the given items.
    pub fn list(items: impl IntoIterator<Item = Sexpr>) -> Self {
        Sexpr::list_with_tail(items.into_iter().collect(), Sexpr::Nil)
    }

    /// Builds a list whose final tail is `tail` (an improper list unless `tail` is a list).
    pub fn list_with_tail(items: Vec<Sexpr>, tail: Sexpr) -> Self {
        items
            .into_iter()
            .rev()
            .fold(tail, |acc, item| Sexpr::cons(item, acc))
    }

    /// Splits a message on whitespace into a list of atoms: "no such thing" -> (no such thing).
    pub fn words(message: &str) -> Self {
        Sexpr::list(message.split_whitespace().map(Sexpr::atom))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Sexpr::Nil)
    }

    pub fn is_truthy(&self) -> bool {
        !self.is_nil()
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Sexpr::Nil | Sexpr::Pair(_))
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Sexpr::Atom(name) => Some(name),
            _ => None,
        }
    }

    /// Iterates the heads of a list. Stops at the first non-pair tail.
    pub fn iter(&self) -> ListIter<'_> {
        ListIter { current: self }
    }

    /// Collects a proper list into a Vec; `None` for improper lists and non-lists.
    pub fn to_vec(&self) -> Option<Vec<Sexpr>> {
        let mut items = self.iter();
        let collected: Vec<Sexpr> = items.by_ref().cloned().collect();
        if items.remainder().is_nil() {
            Some(collected)
        } else {
            None
        }
    }

    /// True when this is a non-empty list whose head is the atom `name`.
    pub fn starts_with(&self, name: &str) -> bool {
        match self {
            Sexpr::Pair(pair) => pair.head.as_atom() == Some(name),
            _ => false,
        }
    }
}

pub struct ListIter<'a> {
    current: &'a Sexpr,
}

impl<'a> ListIter<'a> {
    /// Whatever is left once the pairs run out: `()` for a proper list.
    pub fn remainder(&self) -> &'a Sexpr {
        self.current
    }
}

impl<'a> Iterator for ListIter<'a> {
    type Item = &'a Sexpr;

    fn next(&mut self) -> Option<&'a Sexpr> {
        match self.current {
            Sexpr::Pair(pair) => {
                self.current = &pair.tail;
                Some(&pair.head)
            }
            _ => None,
        }
    }
}

// Structural equality, walking tails iteratively so long lists don't recurse.
impl PartialEq for Sexpr {
    fn eq(&self, other: &Self) -> bool {
        let (mut left, mut right) = (self, other);
        loop {
            match (left, right) {
                (Sexpr::Pair(a), Sexpr::Pair(b)) => {
                    if Rc::ptr_eq(a, b) {
                        return true;
                    }
                    if a.head != b.head {
                        return false;
                    }
                    left = &a.tail;
                    right = &b.tail;
                }
                (Sexpr::Atom(a), Sexpr::Atom(b)) => return a == b,
                (Sexpr::Number(a), Sexpr::Number(b)) => return a == b,
                (Sexpr::Nil, Sexpr::Nil) => return true,
                (Sexpr::Procedure(a), Sexpr::Procedure(b)) => return a == b,
                _ => return false,
            }
        }
    }
}

// Implement Display trait for the canonical textual rendering
impl fmt::Display for Sexpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexpr::Atom(name) => write!(f, "{}", name),
            Sexpr::Number(n) => write!(f, "{}", n),
            Sexpr::Nil => write!(f, "()"),
            Sexpr::Procedure(procedure) => write!(f, "{}", procedure),
            Sexpr::Pair(_) => {
                write!(f, "(")?;
                let mut items = self.iter();
                let mut first = true;
                for item in items.by_ref() {
                    if !first {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                    first = false;
                }
                match items.remainder() {
                    Sexpr::Nil => {}
                    tail => write!(f, " . {}", tail)?,
                }
                write!(f, ")")
            }
        }
    }
}

/// Native callbacks receive the evaluator (so they can call back into it), the
/// evaluated arguments and the caller's environment.
pub type NativeFn = fn(&Evaluator, Vec<Sexpr>, &Rc<RefCell<Environment>>) -> EvalResult;

pub struct NativeFunction {
    pub name: String,
    pub min_arity: usize,
    pub variadic: bool,
    pub doc: &'static str,
    pub func: NativeFn,
}

impl NativeFunction {
    pub fn check_arity(&self, given: usize) -> EvalResult<()> {
        if given < self.min_arity {
            return Err(EvalError::new(
                ErrorKind::Arity,
                format!(
                    "{} expects at least {} arguments, got {}",
                    self.name, self.min_arity, given
                ),
            ));
        }
        if !self.variadic && given > self.min_arity {
            return Err(EvalError::new(
                ErrorKind::Arity,
                format!(
                    "{} expects exactly {} arguments, got {}",
                    self.name, self.min_arity, given
                ),
            ));
        }
        Ok(())
    }
}

/// A user-defined function or macro with the environment it was created in.
pub struct Closure {
    pub params: Vec<String>,
    pub rest: Option<String>,
    pub body: Vec<Sexpr>,
    pub doc: Option<Sexpr>,
    pub is_macro: bool,
    pub env: Rc<RefCell<Environment>>,
}

impl Closure {
    /// The parameter spec as written: `a b . rest`.
    pub fn signature(&self) -> String {
        let mut signature = self.params.join(" ");
        if let Some(rest) = &self.rest {
            if signature.is_empty() {
                signature = format!(". {}", rest);
            } else {
                signature.push_str(&format!(" . {}", rest));
            }
        }
        signature
    }
}

#[derive(Clone)] // Need Clone for Sexpr::Procedure
pub enum Procedure {
    Native(Rc<NativeFunction>),
    Closure(Rc<Closure>),
}

impl Procedure {
    pub fn name(&self) -> &str {
        match self {
            Procedure::Native(native) => &native.name,
            Procedure::Closure(closure) if closure.is_macro => "macro",
            Procedure::Closure(_) => "lambda",
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Native(native) => write!(f, "<builtin: {}>", native.name),
            Procedure::Closure(closure) => {
                write!(f, "<{}({})>", self.name(), closure.signature())
            }
        }
    }
}

// Closures capture environments that may contain the closure itself, so
// Debug stays shallow.
impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Native(native) => write!(f, "Native({})", native.name),
            Procedure::Closure(closure) => write!(f, "Closure({})", closure.signature()),
        }
    }
}

// Natives compare by name; closures by identity.
impl PartialEq for Procedure {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Procedure::Native(n1), Procedure::Native(n2)) => n1.name == n2.name,
            (Procedure::Closure(c1), Procedure::Closure(c2)) => Rc::ptr_eq(c1, c2),
            _ => false,
        }
    }
}
