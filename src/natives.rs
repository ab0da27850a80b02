use crate::environment::Environment;
use crate::error::{ErrorKind, EvalError, EvalResult};
use crate::evaluator::Evaluator;
use crate::types::{NativeFn, NativeFunction, Procedure, Sexpr};
use num_bigint::BigInt;
use num_traits::Zero;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;
use tracing::debug;

const CAR_DOC: &str = "Return the first element of a list";
const CDR_DOC: &str = "Return all but the first element of a list";

/// Name -> native function table. Built once, then handed to an `Evaluator`
/// which only ever reads it.
#[derive(Default)]
pub struct NativeRegistry {
    functions: HashMap<String, Rc<NativeFunction>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry {
            functions: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        min_arity: usize,
        variadic: bool,
        doc: &'static str,
        func: NativeFn,
    ) {
        self.functions.insert(
            name.to_string(),
            Rc::new(NativeFunction {
                name: name.to_string(),
                min_arity,
                variadic,
                doc,
                func,
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<Rc<NativeFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// The core catalog: arithmetic, comparison, list plumbing, and hooks back into the evaluator.
    pub fn core() -> Self {
        let mut registry = NativeRegistry::new();

        // --- Arithmetic ---
        registry.register("+", 0, true, "Add the arguments", native_add);
        registry.register("-", 1, true, "Subtract the rest from the first, or negate a single argument", native_sub);
        registry.register("*", 0, true, "Multiply the arguments", native_mul);
        registry.register("/", 1, true, "Divide the first argument by the rest, truncating", native_div);
        registry.register("rem", 2, false, "Return remainder when second arg divides first", native_rem);

        // --- Comparison ---
        registry.register("=", 1, true, "Return t if the arguments are equal, () otherwise", native_equals);
        registry.register("<", 1, true, "Return t if the arguments are strictly increasing", native_less_than);
        registry.register("<=", 1, true, "Return t if the arguments are non-decreasing", native_less_than_or_equals);
        registry.register(">", 1, true, "Return t if the arguments are strictly decreasing", native_greater_than);
        registry.register(">=", 1, true, "Return t if the arguments are non-increasing", native_greater_than_or_equals);

        // --- Lists ---
        registry.register("cons", 2, false, "Add an element to the front of a list", native_cons);
        registry.register("car", 1, false, CAR_DOC, native_car);
        registry.register("cdr", 1, false, CDR_DOC, native_cdr);
        registry.register("list", 0, true, "Return a list of the given arguments", native_list);
        registry.register("len", 1, false, "Return the length of a list", native_len);
        registry.register("concat2", 2, false, "Concatenate two lists", native_concat2);

        // --- Predicates ---
        registry.register("atom?", 1, false, "Return t if the argument is an atom, () otherwise", native_is_atom);
        registry.register("list?", 1, false, "Return t if the argument is a list, () otherwise", native_is_list);
        registry.register("number?", 1, false, "Return t if the argument is a number, () otherwise", native_is_number);
        registry.register("not", 1, false, "Return t if the argument is (), () otherwise", native_not);

        // --- Evaluator hooks ---
        registry.register("apply", 2, true, "Apply a function to a list of arguments", native_apply);
        registry.register("eval", 1, false, "Evaluate an expression", native_eval);
        registry.register("macroexpand-1", 1, false, "Expand a macro call one step", native_macroexpand_1);
        registry.register("gensym", 0, true, "Return a new unique atom", native_gensym);
        registry.register("doc", 1, false, "Return the doclist for a function", native_doc);

        // --- Output ---
        registry.register("print", 0, true, "Print the arguments", native_print);
        registry.register("println", 0, true, "Print the arguments and a newline", native_println);

        debug!(count = registry.len(), "built core native registry");
        registry
    }
}

fn type_error(message: String) -> EvalError {
    EvalError::new(ErrorKind::Type, message)
}

fn number_arg(arg: &Sexpr) -> EvalResult<&BigInt> {
    match arg {
        Sexpr::Number(n) => Ok(n),
        other => Err(type_error(format!("expected number, got '{}'", other))),
    }
}

fn list_arg(arg: &Sexpr) -> EvalResult<Vec<Sexpr>> {
    arg.to_vec()
        .ok_or_else(|| type_error(format!("'{}' is not a list", arg)))
}

// --- Arithmetic ---

fn native_add(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    let mut sum = BigInt::zero();
    for arg in &args {
        sum += number_arg(arg)?;
    }
    Ok(Sexpr::Number(sum))
}

fn native_mul(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    let mut product = BigInt::from(1);
    for arg in &args {
        product *= number_arg(arg)?;
    }
    Ok(Sexpr::Number(product))
}

fn native_sub(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    let first = number_arg(&args[0])?;
    if args.len() == 1 {
        return Ok(Sexpr::Number(-first));
    }
    let mut difference = first.clone();
    for arg in &args[1..] {
        difference -= number_arg(arg)?;
    }
    Ok(Sexpr::Number(difference))
}

fn native_div(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    let mut quotient = number_arg(&args[0])?.clone();
    for arg in &args[1..] {
        let divisor = number_arg(arg)?;
        if divisor.is_zero() {
            return Err(EvalError::new(ErrorKind::Runtime, "division by zero"));
        }
        quotient /= divisor;
    }
    Ok(Sexpr::Number(quotient))
}

fn native_rem(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    let dividend = number_arg(&args[0])?;
    let divisor = number_arg(&args[1])?;
    if divisor.is_zero() {
        return Err(EvalError::new(ErrorKind::Runtime, "division by zero"));
    }
    Ok(Sexpr::Number(dividend % divisor))
}

// --- Comparison ---

fn native_equals(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    let first = &args[0];
    Ok(Sexpr::from_bool(args[1..].iter().all(|arg| arg == first)))
}

fn compare_chain(args: &[Sexpr], holds: fn(&BigInt, &BigInt) -> bool) -> EvalResult {
    let numbers = args.iter().map(number_arg).collect::<EvalResult<Vec<_>>>()?;
    Ok(Sexpr::from_bool(
        numbers.windows(2).all(|pair| holds(pair[0], pair[1])),
    ))
}

fn native_less_than(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    compare_chain(&args, |a, b| a < b)
}

fn native_less_than_or_equals(
    _: &Evaluator,
    args: Vec<Sexpr>,
    _: &Rc<RefCell<Environment>>,
) -> EvalResult {
    compare_chain(&args, |a, b| a <= b)
}

fn native_greater_than(
    _: &Evaluator,
    args: Vec<Sexpr>,
    _: &Rc<RefCell<Environment>>,
) -> EvalResult {
    compare_chain(&args, |a, b| a > b)
}

fn native_greater_than_or_equals(
    _: &Evaluator,
    args: Vec<Sexpr>,
    _: &Rc<RefCell<Environment>>,
) -> EvalResult {
    compare_chain(&args, |a, b| a >= b)
}

// --- Lists ---

fn native_cons(_: &Evaluator, mut args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    let tail = args.pop().unwrap_or(Sexpr::Nil);
    let head = args.pop().unwrap_or(Sexpr::Nil);
    Ok(Sexpr::cons(head, tail))
}

fn native_car(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    match &args[0] {
        Sexpr::Pair(pair) => Ok(pair.head.clone()),
        Sexpr::Nil => Ok(Sexpr::Nil),
        other => Err(type_error(format!("'{}' is not a list", other))),
    }
}

fn native_cdr(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    match &args[0] {
        Sexpr::Pair(pair) => Ok(pair.tail.clone()),
        Sexpr::Nil => Ok(Sexpr::Nil),
        other => Err(type_error(format!("'{}' is not a list", other))),
    }
}

/// `car` (for `'a'`) or `cdr` (for `'d'`), built outside any registry so
/// synthesized `c[ad]+r` accessors work whatever the evaluator was given.
pub(crate) fn list_accessor(selector: char) -> Rc<NativeFunction> {
    let (name, doc, func): (&str, &'static str, NativeFn) = match selector {
        'a' => ("car", CAR_DOC, native_car),
        _ => ("cdr", CDR_DOC, native_cdr),
    };
    Rc::new(NativeFunction {
        name: name.to_string(),
        min_arity: 1,
        variadic: false,
        doc,
        func,
    })
}

fn native_list(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    Ok(Sexpr::list(args))
}

fn native_len(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    Ok(Sexpr::number(list_arg(&args[0])?.len()))
}

fn native_concat2(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    let front = list_arg(&args[0])?;
    if !args[1].is_list() {
        return Err(type_error(format!("'{}' is not a list", args[1])));
    }
    Ok(Sexpr::list_with_tail(front, args[1].clone()))
}

// --- Predicates ---

fn native_is_atom(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    Ok(Sexpr::from_bool(matches!(args[0], Sexpr::Atom(_))))
}

fn native_is_list(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    Ok(Sexpr::from_bool(args[0].is_list()))
}

fn native_is_number(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    Ok(Sexpr::from_bool(matches!(args[0], Sexpr::Number(_))))
}

fn native_not(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    Ok(Sexpr::from_bool(args[0].is_nil()))
}

// --- Evaluator hooks ---

/// `(apply f a b '(c d))` calls `f` with `a b c d`.
fn native_apply(
    evaluator: &Evaluator,
    mut args: Vec<Sexpr>,
    env: &Rc<RefCell<Environment>>,
) -> EvalResult {
    let spread = args.pop().unwrap_or(Sexpr::Nil);
    let func = args.remove(0);
    args.extend(list_arg(&spread)?);
    evaluator
        .apply(&func, args, env)
        .map_err(|e| e.extend("apply"))
}

fn native_eval(
    evaluator: &Evaluator,
    mut args: Vec<Sexpr>,
    env: &Rc<RefCell<Environment>>,
) -> EvalResult {
    let expr = args.pop().unwrap_or(Sexpr::Nil);
    evaluator.evaluate(expr, env.clone())
}

fn native_macroexpand_1(
    evaluator: &Evaluator,
    args: Vec<Sexpr>,
    env: &Rc<RefCell<Environment>>,
) -> EvalResult {
    evaluator.macroexpand_1(&args[0], env)
}

fn native_gensym(
    evaluator: &Evaluator,
    args: Vec<Sexpr>,
    _: &Rc<RefCell<Environment>>,
) -> EvalResult {
    match args.as_slice() {
        [] => Ok(evaluator.gensym(None)),
        [Sexpr::Atom(prefix)] => Ok(evaluator.gensym(Some(prefix))),
        [other] => Err(type_error(format!(
            "gensym expects an atom as its first argument, got '{}'",
            other
        ))),
        _ => Err(EvalError::new(
            ErrorKind::Arity,
            "gensym expects 0 or 1 arguments",
        )),
    }
}

fn native_doc(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    match &args[0] {
        Sexpr::Procedure(Procedure::Closure(closure)) => {
            Ok(closure.doc.clone().unwrap_or(Sexpr::Nil))
        }
        Sexpr::Procedure(Procedure::Native(native)) => Ok(Sexpr::words(native.doc)),
        other => Err(type_error(format!("'{}' is not a function", other))),
    }
}

// --- Output ---

fn render_args(args: &[Sexpr]) -> String {
    args.iter()
        .map(|arg| arg.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn native_print(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    let mut stdout = io::stdout();
    write!(stdout, "{}", render_args(&args))
        .and_then(|_| stdout.flush())
        .map_err(|e| EvalError::new(ErrorKind::Runtime, e.to_string()))?;
    Ok(Sexpr::Nil)
}

fn native_println(_: &Evaluator, args: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
    writeln!(io::stdout(), "{}", render_args(&args))
        .map_err(|e| EvalError::new(ErrorKind::Runtime, e.to_string()))?;
    Ok(Sexpr::Nil)
}
