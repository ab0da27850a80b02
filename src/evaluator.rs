use crate::environment::Environment;
use crate::error::{ErrorKind, EvalError, EvalResult};
use crate::natives::{NativeRegistry, list_accessor};
use crate::parser::parse_str;
use crate::types::{Closure, NativeFunction, Procedure, Sexpr, TRUTH};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, info, trace};

/// Names the evaluator handles itself rather than by function application.
pub const SPECIAL_FORMS: &[&str] = &[
    "and",
    "comment",
    "cond",
    "def",
    "defmacro",
    "defn",
    "error",
    "errors",
    "lambda",
    "let",
    "loop",
    "or",
    "quote",
    "set!",
    "swallow",
    "syntax-quote",
    "test",
    "try",
];

fn syntax_error(message: impl AsRef<str>) -> EvalError {
    EvalError::new(ErrorKind::Syntax, message)
}

/// A tree-walking evaluator. Owns the native registry it was built with; the
/// registry is never modified afterwards.
pub struct Evaluator {
    natives: NativeRegistry,
    gensym_counter: Cell<usize>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator::with_core_natives()
    }
}

impl Evaluator {
    pub fn new(natives: NativeRegistry) -> Self {
        Evaluator {
            natives,
            gensym_counter: Cell::new(0),
        }
    }

    pub fn with_core_natives() -> Self {
        Evaluator::new(NativeRegistry::core())
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    /// Parses and evaluates every form in `source`, returning the last value.
    pub fn eval_str(&self, source: &str, env: &Rc<RefCell<Environment>>) -> EvalResult {
        let forms = parse_str(source)?;
        self.eval_forms(&forms, env)
    }

    pub fn eval_forms(&self, forms: &[Sexpr], env: &Rc<RefCell<Environment>>) -> EvalResult {
        let mut result = Sexpr::Nil;
        for form in forms {
            result = self.evaluate(form.clone(), env.clone())?;
        }
        Ok(result)
    }

    pub fn gensym(&self, prefix: Option<&str>) -> Sexpr {
        let n = self.gensym_counter.get() + 1;
        self.gensym_counter.set(n);
        match prefix {
            Some(prefix) => Sexpr::atom(format!("<gensym-{}-{}>", prefix, n)),
            None => Sexpr::atom(format!("<gensym-{}>", n)),
        }
    }

    /// Evaluates `expr` in `env`.
    ///
    /// Forms in tail position (the chosen `cond` branch, the last form of a
    /// `let` body or of a closure body) don't recurse:
    /// they replace `expr`/`env` and go around the loop again, so Lisp-level
    /// tail recursion runs in constant host stack.
    pub fn evaluate(&self, expr: Sexpr, env: Rc<RefCell<Environment>>) -> EvalResult {
        let mut expr = expr;
        let mut env = env;
        loop {
            if self.is_macro_call(&expr, &env) {
                expr = self
                    .macroexpand(&expr, &env)
                    .map_err(|e| e.extend("eval macroexpansion"))?;
            }

            let pair = match &expr {
                Sexpr::Atom(name) => return self.resolve_atom(name, &env),
                Sexpr::Number(_) | Sexpr::Nil | Sexpr::Procedure(_) => return Ok(expr.clone()),
                Sexpr::Pair(pair) => Rc::clone(pair),
            };
            let operands = pair
                .tail
                .to_vec()
                .ok_or_else(|| syntax_error("malformed list for eval"))?;

            // Special forms
            if let Sexpr::Atom(name) = &pair.head {
                match name.as_str() {
                    "quote" => {
                        return match operands.first() {
                            Some(form) => Ok(form.clone()),
                            None => Err(syntax_error("quote needs an argument")),
                        };
                    }
                    "syntax-quote" => {
                        let form = operands
                            .first()
                            .ok_or_else(|| syntax_error("syntax-quote needs an argument"))?;
                        return self.syntax_quote(form, 1, &env);
                    }
                    "cond" => match self.eval_cond(&operands, &env)? {
                        Some(branch) => {
                            expr = branch;
                            continue;
                        }
                        None => return Ok(Sexpr::Nil),
                    },
                    "and" => return self.eval_and(&operands, &env),
                    "or" => return self.eval_or(&operands, &env),
                    "loop" => loop {
                        for form in &operands {
                            self.evaluate(form.clone(), env.clone())
                                .map_err(|e| e.extend("loop operator"))?;
                        }
                    },
                    "swallow" => return Ok(self.eval_swallow(&operands, &env)),
                    "def" => return self.eval_def(&operands, &env),
                    "set!" => return self.eval_set(&operands, &env),
                    "defn" => return self.eval_defn(&operands, false, &env),
                    "defmacro" => return self.eval_defn(&operands, true, &env),
                    "lambda" => {
                        let closure = make_closure(&operands, false, &env)?;
                        return Ok(Sexpr::Procedure(Procedure::Closure(closure)));
                    }
                    "error" => {
                        let form = operands.first().ok_or_else(|| {
                            syntax_error("error requires a non-empty argument list")
                        })?;
                        let value = self
                            .evaluate(form.clone(), env.clone())
                            .map_err(|e| e.extend("error operator"))?;
                        return Err(EvalError::raised(value));
                    }
                    "errors" => return self.eval_errors(&operands, &env),
                    "try" => return self.eval_try(&operands, &env),
                    "let" => {
                        let [bindings, body @ ..] = operands.as_slice() else {
                            return Err(syntax_error("let requires a binding list"));
                        };
                        let frame = self.let_frame(bindings, &env)?;
                        let Some((last, init)) = body.split_last() else {
                            return Ok(Sexpr::Nil);
                        };
                        for form in init {
                            self.evaluate(form.clone(), frame.clone())
                                .map_err(|e| e.extend("evaluating let body"))?;
                        }
                        expr = last.clone();
                        env = frame;
                        continue;
                    }
                    "test" => return self.eval_test(&operands, &env),
                    "comment" => return Ok(Sexpr::Nil),
                    _ => {}
                }
            }

            // Function application
            let func = self
                .evaluate(pair.head.clone(), env.clone())
                .map_err(|e| e.extend("evaluating function object"))?;
            let args = operands
                .into_iter()
                .map(|operand| self.evaluate(operand, env.clone()))
                .collect::<EvalResult<Vec<_>>>()
                .map_err(|e| e.extend("evaluating function arguments"))?;

            match func {
                Sexpr::Procedure(Procedure::Closure(closure)) => {
                    let frame =
                        bind_arguments(&closure, args).map_err(|e| e.extend("lambda env setup"))?;
                    let Some((last, init)) = closure.body.split_last() else {
                        return Ok(Sexpr::Nil);
                    };
                    for form in init {
                        self.evaluate(form.clone(), frame.clone())
                            .map_err(|e| e.extend_with(lambda_frame(form)))?;
                    }
                    trace!(closure = %closure.signature(), "tail call");
                    expr = last.clone();
                    env = frame;
                }
                Sexpr::Procedure(Procedure::Native(native)) => {
                    return self.call_native(&native, args, &env);
                }
                other => {
                    return Err(EvalError::new(
                        ErrorKind::Type,
                        format!("{} is not a function", other),
                    ));
                }
            }
        }
    }

    /// Calls `func` on already-evaluated arguments. Used by `apply`.
    pub fn apply(&self, func: &Sexpr, args: Vec<Sexpr>, env: &Rc<RefCell<Environment>>) -> EvalResult {
        match func {
            Sexpr::Procedure(Procedure::Closure(closure)) => {
                let frame = bind_arguments(closure, args)?;
                let mut result = Sexpr::Nil;
                for form in &closure.body {
                    result = self
                        .evaluate(form.clone(), frame.clone())
                        .map_err(|e| e.extend_with(lambda_frame(form)))?;
                }
                Ok(result)
            }
            Sexpr::Procedure(Procedure::Native(native)) => self.call_native(native, args, env),
            other => Err(EvalError::new(
                ErrorKind::Type,
                format!("{} is not a function", other),
            )),
        }
    }

    fn call_native(
        &self,
        native: &NativeFunction,
        args: Vec<Sexpr>,
        env: &Rc<RefCell<Environment>>,
    ) -> EvalResult {
        native
            .check_arity(args.len())
            .and_then(|_| (native.func)(self, args, env))
            .map_err(|e| e.extend(format!("builtin function {}", native.name)))
    }

    // Resolution order: the truth atom, the environment chain, natives, then c[ad]+r.
    fn resolve_atom(&self, name: &str, env: &Rc<RefCell<Environment>>) -> EvalResult {
        if name == TRUTH {
            return Ok(Sexpr::truth());
        }
        if let Some(value) = env.borrow().lookup(name) {
            return Ok(value);
        }
        if let Some(native) = self.natives.get(name) {
            return Ok(Sexpr::Procedure(Procedure::Native(native)));
        }
        if is_cxr(name) {
            return Ok(Sexpr::Procedure(Procedure::Closure(cxr_closure(name, env))));
        }
        Err(EvalError::new(
            ErrorKind::Binding,
            format!("unknown symbol: {}", name),
        ))
    }

    // --- Macros ---

    fn macro_for(&self, expr: &Sexpr, env: &Rc<RefCell<Environment>>) -> Option<Rc<Closure>> {
        let name = match expr {
            Sexpr::Pair(pair) => pair.head.as_atom()?,
            _ => return None,
        };
        let found = env.borrow().lookup(name);
        match found {
            Some(Sexpr::Procedure(Procedure::Closure(closure))) if closure.is_macro => Some(closure),
            _ => None,
        }
    }

    pub fn is_macro_call(&self, expr: &Sexpr, env: &Rc<RefCell<Environment>>) -> bool {
        self.macro_for(expr, env).is_some()
    }

    /// Expands `expr` once if it is a macro call; otherwise returns it unchanged.
    pub fn macroexpand_1(&self, expr: &Sexpr, env: &Rc<RefCell<Environment>>) -> EvalResult {
        let Some(closure) = self.macro_for(expr, env) else {
            return Ok(expr.clone());
        };
        let args = match expr {
            Sexpr::Pair(pair) => pair.tail.to_vec(),
            _ => None,
        }
        .ok_or_else(|| syntax_error("macro call must be a list"))?;
        trace!(call = %expr, "expanding macro");
        let frame = bind_arguments(&closure, args)
            .map_err(|e| e.extend("setting macro call arguments"))?;
        let mut expansion = Sexpr::Nil;
        for form in &closure.body {
            expansion = self
                .evaluate(form.clone(), frame.clone())
                .map_err(|e| e.extend("evaluating macro expansion"))?;
        }
        Ok(expansion)
    }

    /// Expands until the result is no longer a macro call.
    pub fn macroexpand(&self, expr: &Sexpr, env: &Rc<RefCell<Environment>>) -> EvalResult {
        let mut expansion = expr.clone();
        loop {
            expansion = self
                .macroexpand_1(&expansion, env)
                .map_err(|e| e.extend("macroexpansion"))?;
            if !self.is_macro_call(&expansion, env) {
                return Ok(expansion);
            }
        }
    }

    // --- Special forms ---

    /// Returns the chosen branch's expression, left unevaluated for the trampoline.
    fn eval_cond(
        &self,
        clauses: &[Sexpr],
        env: &Rc<RefCell<Environment>>,
    ) -> EvalResult<Option<Sexpr>> {
        for clause in clauses {
            let Sexpr::Pair(clause) = clause else {
                return Err(syntax_error("cond requires a list of pairs"));
            };
            let test = self
                .evaluate(clause.head.clone(), env.clone())
                .map_err(|e| e.extend("evaluating cond condition"))?;
            if test.is_truthy() {
                return match &clause.tail {
                    Sexpr::Pair(branch) => Ok(Some(branch.head.clone())),
                    _ => Err(syntax_error("cond requires a list of pairs")),
                };
            }
        }
        Ok(None)
    }

    fn eval_and(&self, operands: &[Sexpr], env: &Rc<RefCell<Environment>>) -> EvalResult {
        for operand in operands {
            let value = self
                .evaluate(operand.clone(), env.clone())
                .map_err(|e| e.extend("and operator"))?;
            if value.is_nil() {
                return Ok(Sexpr::Nil);
            }
        }
        Ok(Sexpr::truth())
    }

    fn eval_or(&self, operands: &[Sexpr], env: &Rc<RefCell<Environment>>) -> EvalResult {
        for operand in operands {
            let value = self
                .evaluate(operand.clone(), env.clone())
                .map_err(|e| e.extend("or operator"))?;
            if value.is_truthy() {
                return Ok(value);
            }
        }
        Ok(Sexpr::Nil)
    }

    fn eval_swallow(&self, operands: &[Sexpr], env: &Rc<RefCell<Environment>>) -> Sexpr {
        for operand in operands {
            if let Err(err) = self.evaluate(operand.clone(), env.clone()) {
                debug!(error = %err, "swallowed error");
                return Sexpr::truth();
            }
        }
        Sexpr::Nil
    }

    fn eval_def(&self, operands: &[Sexpr], env: &Rc<RefCell<Environment>>) -> EvalResult {
        let [name, value, ..] = operands else {
            return Err(syntax_error("missing argument"));
        };
        let Sexpr::Atom(name) = name else {
            return Err(syntax_error("def: first argument must be an atom"));
        };
        let value = self
            .evaluate(value.clone(), env.clone())
            .map_err(|e| e.extend("evaluating def value"))?;
        env.borrow_mut()
            .bind_at_root(name, value.clone())
            .map_err(|e| EvalError::from(e).extend("setting def result"))?;
        debug!(name = %name, "def");
        Ok(value)
    }

    fn eval_set(&self, operands: &[Sexpr], env: &Rc<RefCell<Environment>>) -> EvalResult {
        let [name, value, ..] = operands else {
            return Err(syntax_error("missing argument"));
        };
        let Sexpr::Atom(name) = name else {
            return Err(syntax_error("set!: first argument must be an atom"));
        };
        let value = self
            .evaluate(value.clone(), env.clone())
            .map_err(|e| e.extend("evaluating set value"))?;
        env.borrow_mut()
            .update(name, value.clone())
            .map_err(|e| EvalError::from(e).extend("updating set result"))?;
        Ok(value)
    }

    fn eval_defn(
        &self,
        operands: &[Sexpr],
        is_macro: bool,
        env: &Rc<RefCell<Environment>>,
    ) -> EvalResult {
        let form = if is_macro { "defmacro" } else { "defn" };
        let [name, rest @ ..] = operands else {
            return Err(syntax_error(format!("{} requires a function name", form)));
        };
        let Sexpr::Atom(name) = name else {
            return Err(syntax_error(format!("{} name must be an atom", form)));
        };
        if rest.is_empty() {
            return Err(syntax_error(format!("{} requires an argument list", form)));
        }
        let closure = make_closure(rest, is_macro, env)
            .map_err(|e| e.extend("creating lambda function"))?;
        env.borrow_mut()
            .bind_at_root(name, Sexpr::Procedure(Procedure::Closure(closure)))
            .map_err(|e| EvalError::from(e).extend(format!("setting {} result", form)))?;
        debug!(name = %name, is_macro, "defined at root");
        Ok(Sexpr::Nil)
    }

    /// `(errors '(fragment) body...)`: passes as soon as a body form fails
    /// with an error whose rendering contains the fragment.
    fn eval_errors(&self, operands: &[Sexpr], env: &Rc<RefCell<Environment>>) -> EvalResult {
        let [signature, body @ ..] = operands else {
            return Err(syntax_error("no error spec given"));
        };
        if !signature.is_list() {
            return Err(syntax_error("error signature must be a list"));
        }
        let signature = self
            .evaluate(signature.clone(), env.clone())
            .map_err(|e| e.extend("evaluating error signature"))?;
        if !signature.is_list() {
            return Err(syntax_error("error signature must be a list"));
        }
        let rendered = signature.to_string();
        let fragment = rendered
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or("");

        for form in body {
            if let Err(err) = self.evaluate(form.clone(), env.clone()) {
                let text = err.to_string();
                if text.contains(fragment) {
                    return Ok(Sexpr::Nil);
                }
                return Err(EvalError::new(
                    ErrorKind::Runtime,
                    format!("error '{}' not found in '{}'", fragment, text),
                ));
            }
        }
        Err(EvalError::new(
            ErrorKind::Runtime,
            format!("error not found in {}", Sexpr::list(operands.to_vec())),
        ))
    }

    /// Forms after the first failure are skipped; a trailing `(catch name ...)`
    /// sees the failure's trace bound to `name`.
    fn eval_try(&self, operands: &[Sexpr], env: &Rc<RefCell<Environment>>) -> EvalResult {
        let mut result = Sexpr::Nil;
        let mut failure: Option<EvalError> = None;
        for form in operands {
            if form.starts_with("catch") {
                let Some(err) = failure else {
                    return Ok(result);
                };
                return self.eval_catch(form, err, env);
            }
            if failure.is_none() {
                match self.evaluate(form.clone(), env.clone()) {
                    Ok(value) => result = value,
                    Err(err) => {
                        debug!(error = %err, "try intercepted error");
                        failure = Some(err);
                    }
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    fn eval_catch(
        &self,
        clause: &Sexpr,
        err: EvalError,
        env: &Rc<RefCell<Environment>>,
    ) -> EvalResult {
        let clause = clause
            .to_vec()
            .ok_or_else(|| syntax_error("catch body must be a list with a binding name"))?;
        let [_, binding, body @ ..] = clause.as_slice() else {
            return Err(syntax_error("catch body must be a list with a binding name"));
        };
        let Sexpr::Atom(binding) = binding else {
            return Err(syntax_error("catch binding name must be a symbol"));
        };
        let frame = Environment::new_enclosed(env.clone());
        frame.borrow_mut().bind(binding, err.trace)?;
        let mut result = Sexpr::Nil;
        for form in body {
            result = self
                .evaluate(form.clone(), frame.clone())
                .map_err(|e| e.extend("catch body"))?;
        }
        Ok(result)
    }

    /// `(test description body...)` runs the body in order and stops at the
    /// first failure, naming the failing form in the trace.
    fn eval_test(&self, operands: &[Sexpr], env: &Rc<RefCell<Environment>>) -> EvalResult {
        let [description, body @ ..] = operands else {
            return Ok(Sexpr::Nil);
        };
        let description = self
            .evaluate(description.clone(), env.clone())
            .map_err(|e| e.extend("evaluating test description"))?;
        info!(test = %description, "running test");
        for form in body {
            self.evaluate(form.clone(), env.clone()).map_err(|e| {
                e.extend_with(Sexpr::list([
                    Sexpr::atom("evaluating"),
                    Sexpr::atom("test"),
                    form.clone(),
                ]))
            })?;
            trace!(test = %description, form = %form, "step passed");
        }
        info!(test = %description, forms = body.len(), "test passed");
        Ok(Sexpr::Nil)
    }

    /// Builds the value of a syntax-quoted form. `depth` counts the enclosing
    /// syntax-quotes; only unquotes that bring it back to zero are evaluated.
    fn syntax_quote(
        &self,
        form: &Sexpr,
        depth: usize,
        env: &Rc<RefCell<Environment>>,
    ) -> EvalResult {
        if let Some(operand) = quoted_operand(form, "unquote")? {
            if depth == 1 {
                return self
                    .evaluate(operand.clone(), env.clone())
                    .map_err(|e| e.extend("evaluating unquote"));
            }
            let inner = self.syntax_quote(operand, depth - 1, env)?;
            return Ok(Sexpr::list([Sexpr::atom("unquote"), inner]));
        }
        if let Some(operand) = quoted_operand(form, "syntax-quote")? {
            let inner = self.syntax_quote(operand, depth + 1, env)?;
            return Ok(Sexpr::list([Sexpr::atom("syntax-quote"), inner]));
        }

        let mut items = Vec::new();
        let mut current = form;
        let tail = loop {
            let Sexpr::Pair(pair) = current else {
                break current.clone();
            };
            // `(a . ~x)` reads as `(a unquote x)`
            if !std::ptr::eq(current, form) && current.starts_with("unquote") {
                break self.syntax_quote(current, depth, env)?;
            }
            match quoted_operand(&pair.head, "splicing-unquote")? {
                Some(operand) if depth == 1 => {
                    let spliced = self
                        .evaluate(operand.clone(), env.clone())
                        .map_err(|e| e.extend("evaluating splicing-unquote"))?;
                    let elements = spliced.to_vec().ok_or_else(|| {
                        EvalError::new(
                            ErrorKind::Type,
                            format!("splicing-unquote: '{}' is not a list", spliced),
                        )
                    })?;
                    items.extend(elements);
                }
                Some(operand) => {
                    let inner = self.syntax_quote(operand, depth - 1, env)?;
                    items.push(Sexpr::list([Sexpr::atom("splicing-unquote"), inner]));
                }
                None => items.push(self.syntax_quote(&pair.head, depth, env)?),
            }
            current = &pair.tail;
        };
        Ok(Sexpr::list_with_tail(items, tail))
    }

    /// Every binding's value is evaluated in the outer `env`, so bindings
    /// can't see each other.
    fn let_frame(
        &self,
        bindings: &Sexpr,
        env: &Rc<RefCell<Environment>>,
    ) -> EvalResult<Rc<RefCell<Environment>>> {
        let bindings = bindings
            .to_vec()
            .ok_or_else(|| syntax_error("let bindings must be a list"))?;
        let frame = Environment::new_enclosed(env.clone());
        for binding in &bindings {
            let binding = binding.to_vec().unwrap_or_default();
            let [Sexpr::Atom(name), value] = binding.as_slice() else {
                return Err(syntax_error("a let binding must be a list of binding pairs"));
            };
            let value = self
                .evaluate(value.clone(), env.clone())
                .map_err(|e| e.extend("evaluating let bindings"))?;
            frame
                .borrow_mut()
                .bind(name, value)
                .map_err(|e| EvalError::from(e).extend("setting let bindings"))?;
        }
        Ok(frame)
    }
}

fn lambda_frame(form: &Sexpr) -> Sexpr {
    Sexpr::list([Sexpr::atom("lambda"), form.clone()])
}

/// Builds a closure from `[name?] params body...`, as written after `lambda`
/// (or after the name in `defn`/`defmacro`).
fn make_closure(
    operands: &[Sexpr],
    is_macro: bool,
    env: &Rc<RefCell<Environment>>,
) -> EvalResult<Rc<Closure>> {
    let (self_name, operands) = match operands {
        [Sexpr::Atom(name), rest @ ..] => (Some(name), rest),
        _ => (None, operands),
    };
    let [spec, body @ ..] = operands else {
        return Err(syntax_error("missing arguments"));
    };
    if !spec.is_list() {
        return Err(syntax_error("lambda requires an argument list"));
    }
    let (params, rest) = parse_params(spec)?;
    let (doc, body) = split_doc(body)?;

    let closure = Rc::new(Closure {
        params,
        rest,
        body: body.to_vec(),
        doc,
        is_macro,
        env: env.clone(),
    });
    if let Some(name) = self_name {
        // The defining frame now holds the closure, and the closure holds the
        // frame: this Rc cycle is never collected.
        env.borrow_mut()
            .bind(name, Sexpr::Procedure(Procedure::Closure(closure.clone())))?;
    }
    Ok(closure)
}

/// Accepts `(a b)`, `(a b . rest)`, `(() . rest)` and `()`.
fn parse_params(spec: &Sexpr) -> EvalResult<(Vec<String>, Option<String>)> {
    let mut params = Vec::new();
    let mut rest = None;
    let mut empty_marker = false;
    let mut current = spec;
    while let Sexpr::Pair(pair) = current {
        match &pair.head {
            Sexpr::Nil => empty_marker = true,
            Sexpr::Atom(name) => params.push(name.clone()),
            _ => return Err(syntax_error("argument list item is not an atom")),
        }
        match &pair.tail {
            Sexpr::Atom(name) => {
                rest = Some(name.clone());
                break;
            }
            Sexpr::Pair(_) if !empty_marker => current = &pair.tail,
            Sexpr::Pair(_) | Sexpr::Nil => break,
            _ => return Err(syntax_error("unknown type in lambda arg list")),
        }
    }
    if empty_marker && rest.is_none() {
        return Err(syntax_error(
            "lambda with () argument requires a rest argument",
        ));
    }
    Ok((params, rest))
}

/// Strips a leading `(doc ...)` form. `(doc ())` marks a closure as deliberately undocumented.
fn split_doc(body: &[Sexpr]) -> EvalResult<(Option<Sexpr>, &[Sexpr])> {
    match body {
        [first, rest @ ..] if first.starts_with("doc") => {
            let Sexpr::Pair(doc_form) = first else {
                return Ok((None, body));
            };
            let doc = match &doc_form.tail {
                Sexpr::Nil => None,
                Sexpr::Pair(items) if items.head.is_nil() => None,
                Sexpr::Pair(_) => Some(doc_form.tail.clone()),
                _ => return Err(syntax_error("doc form is not a list")),
            };
            Ok((doc, rest))
        }
        _ => Ok((None, body)),
    }
}

fn bind_arguments(closure: &Closure, args: Vec<Sexpr>) -> EvalResult<Rc<RefCell<Environment>>> {
    let fixed = closure.params.len();
    if args.len() < fixed {
        return Err(EvalError::new(
            ErrorKind::Arity,
            format!(
                "not enough arguments for function: expected {}, got {}",
                fixed,
                args.len()
            ),
        ));
    }
    if closure.rest.is_none() && args.len() > fixed {
        return Err(EvalError::new(
            ErrorKind::Arity,
            format!(
                "too many arguments for function: expected {}, got {}",
                fixed,
                args.len()
            ),
        ));
    }

    let frame = Environment::new_enclosed(closure.env.clone());
    {
        let mut bindings = frame.borrow_mut();
        let mut args = args.into_iter();
        for (param, value) in closure.params.iter().zip(args.by_ref()) {
            bindings.bind(param, value)?;
        }
        if let Some(rest) = &closure.rest {
            bindings.bind(rest, Sexpr::list(args))?;
        }
    }
    Ok(frame)
}

/// `caddr` and friends; `car` and `cdr` themselves are natives.
fn is_cxr(name: &str) -> bool {
    name.len() > 3
        && name.starts_with('c')
        && name.ends_with('r')
        && name[1..name.len() - 1].chars().all(|c| c == 'a' || c == 'd')
}

/// `cadr` becomes `(lambda (xs) (car (cdr xs)))`, with the accessors held as
/// procedure values rather than names so no binding can shadow them.
fn cxr_closure(name: &str, env: &Rc<RefCell<Environment>>) -> Rc<Closure> {
    let selectors = &name[1..name.len() - 1];
    let body = selectors
        .chars()
        .rev()
        .fold(Sexpr::atom("xs"), |inner, c| {
            let accessor = Sexpr::Procedure(Procedure::Native(list_accessor(c)));
            Sexpr::list([accessor, inner])
        });
    Rc::new(Closure {
        params: vec!["xs".to_string()],
        rest: None,
        body: vec![body],
        doc: None,
        is_macro: false,
        env: env.clone(),
    })
}

/// The single operand of `(name operand)`, or `None` when `form` isn't
/// headed by `name`.
fn quoted_operand<'a>(form: &'a Sexpr, name: &str) -> EvalResult<Option<&'a Sexpr>> {
    let Sexpr::Pair(pair) = form else {
        return Ok(None);
    };
    if pair.head.as_atom() != Some(name) {
        return Ok(None);
    }
    match &pair.tail {
        Sexpr::Pair(operand) if operand.tail.is_nil() => Ok(Some(&operand.head)),
        _ => Err(syntax_error(format!("{} needs exactly one argument", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Helper to evaluate source and compare the rendered result
    fn assert_eval(input: &str, expected: &str) {
        let evaluator = Evaluator::with_core_natives();
        let env = Environment::new();
        match evaluator.eval_str(input, &env) {
            Ok(result) => assert_eq!(result.to_string(), expected, "Input: '{}'", input),
            Err(e) => panic!("Evaluation failed for input '{}': {}", input, e),
        }
    }

    // Helper to assert evaluation errors by kind
    fn assert_eval_error(input: &str, expected_kind: ErrorKind) {
        let evaluator = Evaluator::with_core_natives();
        let env = Environment::new();
        match evaluator.eval_str(input, &env) {
            Ok(result) => panic!(
                "Expected evaluation to fail for input '{}', but got: {}",
                input, result
            ),
            Err(e) => assert_eq!(e.kind, expected_kind, "Input: '{}', error: {}", input, e),
        }
    }

    fn eval_error_text(input: &str) -> String {
        let evaluator = Evaluator::with_core_natives();
        let env = Environment::new();
        match evaluator.eval_str(input, &env) {
            Ok(result) => panic!("Expected error for '{}', got {}", input, result),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn test_self_evaluating() {
        assert_eval("1", "1");
        assert_eval("()", "()");
        assert_eval("t", "t");
        assert_eval("", "()");
        assert_eval("car", "<builtin: car>");
    }

    #[test]
    fn test_unknown_symbol() {
        assert_eval_error("nope", ErrorKind::Binding);
        assert_eq!(eval_error_text("nope"), "((unknown symbol: nope))");
    }

    #[test]
    fn test_quote() {
        assert_eval("'a", "a");
        assert_eval("'(1 2 . 3)", "(1 2 . 3)");
        assert_eval("(quote (a b))", "(a b)");
        assert_eval_error("(quote)", ErrorKind::Syntax);
    }

    #[test]
    fn test_cond() {
        assert_eval("(cond (() 1) (() 2))", "()");
        assert_eval("(cond (() 1) (t 2))", "2");
        assert_eval("(cond ((= 1 1) 'yes) (t 'no))", "yes");
        assert_eval("(cond)", "()");
        assert_eval_error("(cond 1)", ErrorKind::Syntax);
        assert_eval_error("(cond (t))", ErrorKind::Syntax);
    }

    #[test]
    fn test_and_or() {
        assert_eval("(and)", "t");
        assert_eval("(and 1 2)", "t");
        assert_eval("(and 1 () nope)", "()");
        assert_eval("(or)", "()");
        assert_eval("(or () 2 nope)", "2");
        assert_eval("(or () ())", "()");
    }

    #[test]
    fn test_def_and_set() {
        assert_eval("(def x 10)", "10");
        assert_eval("(def x 10) (set! x (+ x 1)) x", "11");
        assert_eval_error("(set! y 1)", ErrorKind::Binding);
        assert_eval_error("(def t 1)", ErrorKind::Binding);
        assert_eval_error("(def 1 1)", ErrorKind::Syntax);
    }

    #[test]
    fn test_def_inside_function_binds_at_root() {
        assert_eval("(defn f () (def inner 5)) (f) inner", "5");
    }

    #[test]
    fn test_set_updates_nearest_frame() {
        assert_eval(
            "(def x 1) (defn f (x) (set! x 100) x) (list (f 5) x)",
            "(100 1)",
        );
    }

    #[test]
    fn test_closures_share_captured_frame() {
        let setup = "(defn make-counter ()
                       (let ((n 0))
                         (list (lambda () (set! n (+ n 1))) (lambda () n))))
                     (def a (make-counter))
                     (def b (make-counter))";
        assert_eval(&format!("{} ((car a)) ((car a)) ((cadr a))", setup), "2");
        assert_eval(
            &format!("{} ((car a)) ((car a)) ((car b)) (list ((cadr a)) ((cadr b)))", setup),
            "(2 1)",
        );
    }

    #[test]
    fn test_lambda_and_defn() {
        assert_eval("((lambda (x y) (+ x y)) 1 2)", "3");
        assert_eval("(defn add1 (x) (+ x 1))", "()");
        assert_eval("(defn add1 (x) (+ x 1)) (add1 41)", "42");
        assert_eval("(lambda (a b . rest) a)", "<lambda(a b . rest)>");
        assert_eval("(lambda (x) x)", "<lambda(x)>");
        assert_eval("((lambda ()))", "()");
    }

    #[test]
    fn test_closures_capture_environment() {
        let setup = "(def f (lambda (n) (lambda (x) (+ x n))))";
        assert_eval(&format!("{} ((f 1) 5)", setup), "6");
        assert_eval(&format!("{} ((f 2) 5)", setup), "7");
    }

    #[test]
    fn test_closures_see_later_root_definitions() {
        assert_eval("(defn g () (h)) (defn h () 'late) (g)", "late");
    }

    #[test]
    fn test_named_lambda_recursion() {
        assert_eval(
            "((lambda fact (n) (cond ((= n 0) 1) (t (* n (fact (- n 1)))))) 10)",
            "3628800",
        );
    }

    #[test]
    fn test_arity() {
        assert_eval_error("((lambda (a b) a) 1 2 3)", ErrorKind::Arity);
        assert_eval_error("((lambda (a b) a) 1)", ErrorKind::Arity);
        assert_eval("((lambda (a b . rest) rest) 1 2 3 4)", "(3 4)");
        assert_eval("((lambda (a b . rest) rest) 1 2)", "()");
        assert_eval("((lambda (() . args) args) 1 2 3)", "(1 2 3)");
        assert_eval("((lambda (() . args) args))", "()");
        assert_eval_error("(lambda (()) 1)", ErrorKind::Syntax);
        assert_eval_error("(lambda (1) 1)", ErrorKind::Syntax);
        assert_eval_error("(lambda x)", ErrorKind::Syntax);
    }

    #[test]
    fn test_tail_recursion_is_stack_bounded() {
        assert_eval(
            "(defn sum-to (n acc) (cond ((= n 0) acc) (t (sum-to (- n 1) (+ acc n)))))
             (sum-to 100000 0)",
            "5000050000",
        );
    }

    #[test]
    fn test_let_tail_position_is_stack_bounded() {
        assert_eval(
            "(defn count-down (n) (let ((m (- n 1))) (cond ((= m 0) 'done) (t (count-down m)))))
             (count-down 100000)",
            "done",
        );
    }

    #[test]
    fn test_let() {
        assert_eval("(let ((x 1) (y 2)) (+ x y))", "3");
        assert_eval("(let () 5)", "5");
        assert_eval("(let ((x 1)))", "()");
        // Bindings are evaluated in the outer scope
        assert_eval("(def x 10) (let ((x 1) (y x)) y)", "10");
        assert_eval("(let ((x 1)) (def z x) x) z", "1");
        assert_eval_error("(let ((x)) x)", ErrorKind::Syntax);
        assert_eval_error("(let (x) x)", ErrorKind::Syntax);
        assert_eval_error("(let)", ErrorKind::Syntax);
    }

    #[test]
    fn test_error_and_try() {
        assert_eval("(try (error '(boom)) (catch e (len e)))", "1");
        assert_eval("(try (error '(boom)) (catch e e))", "((boom))");
        assert_eval("(try 1 2 (catch e 'caught))", "2");
        assert_eval("(try (+ 1 2))", "3");
        assert_eval("(def x 0) (try (error 'a) (set! x 1) (catch e x))", "0");
        assert_eval_error("(try (error '(boom)))", ErrorKind::Runtime);
        assert_eval_error("(error)", ErrorKind::Syntax);
    }

    #[test]
    fn test_catch_sees_builtin_trace() {
        assert_eval(
            "(try (/ 1 0) (catch e e))",
            "((builtin function /) (division by zero))",
        );
    }

    #[test]
    fn test_lambda_error_trace() {
        assert_eq!(
            eval_error_text("(defn f () (error '(inner)) 1) (f)"),
            "((lambda (error (quote (inner)))) (inner))"
        );
    }

    #[test]
    fn test_swallow() {
        assert_eval("(swallow (error '(boom)))", "t");
        assert_eval("(swallow 1 2)", "()");
        assert_eval("(swallow)", "()");
    }

    #[test]
    fn test_loop_exits_via_error() {
        assert_eval(
            "(def n 0)
             (swallow (loop (set! n (+ n 1)) (cond ((= n 5) (error '(stop))))))
             n",
            "5",
        );
    }

    #[test]
    fn test_errors_form() {
        assert_eval("(errors '(division by zero) (/ 1 0))", "()");
        assert_eval("(errors '(boom) 1 (error '(boom)))", "()");
        assert_eval_error("(errors '(boom) (/ 1 0))", ErrorKind::Runtime);
        assert_eval_error("(errors '(boom) 1 2)", ErrorKind::Runtime);
        assert_eval_error("(errors)", ErrorKind::Syntax);
        assert_eval_error("(errors boom (/ 1 0))", ErrorKind::Syntax);
        assert_eval("(errors () (error '(x)))", "()");
        assert_eval("(errors '() (/ 1 0))", "()");
    }

    #[test]
    fn test_test_form() {
        assert_eval("(test 'adds (= (+ 1 2) 3) (+ 1 1))", "()");
        assert_eval("(test)", "()");
        assert_eval("(test 'nothing)", "()");
        assert_eval(
            "(def n 0) (test 'counts (set! n (+ n 1)) (set! n (+ n 1))) n",
            "2",
        );
        assert_eval_error("(test nope 1)", ErrorKind::Binding);
    }

    #[test]
    fn test_test_form_failure_names_the_form() {
        assert_eval_error("(test 'fails (car 1))", ErrorKind::Type);
        assert_eq!(
            eval_error_text("(def n 0) (test 'stops 1 (car 1) (set! n 1))"),
            "((evaluating test (car 1)) (builtin function car) ('1' is not a list))"
        );
        assert_eval("(def n 0) (swallow (test 'stops (car 1) (set! n 1))) n", "0");
    }

    #[test]
    fn test_macros() {
        assert_eval(
            "(defmacro unless (c body) (list 'cond (list c ()) (list t body)))
             (unless () 'ran)",
            "ran",
        );
        assert_eval(
            "(defmacro unless (c body) (list 'cond (list c ()) (list t body)))
             (macroexpand-1 '(unless x y))",
            "(cond (x ()) (t y))",
        );
        assert_eval("(macroexpand-1 '(+ 1 2))", "(+ 1 2)");
        assert_eval("(defmacro m (x) x)", "()");
        assert_eval("(defmacro m (x) x) m", "<macro(x)>");
    }

    #[test]
    fn test_macro_expansion_reaches_fixed_point() {
        assert_eval(
            "(defmacro one () '(two))
             (defmacro two () '(+ 1 1))
             (one)",
            "2",
        );
    }

    #[test]
    fn test_syntax_quote() {
        assert_eval("`a", "a");
        assert_eval("`1", "1");
        assert_eval("`()", "()");
        assert_eval("`(a b c)", "(a b c)");
        assert_eval("(def x 5) `(a ~x)", "(a 5)");
        assert_eval("(def xs '(1 2)) `(a ~@xs b)", "(a 1 2 b)");
        assert_eval("(def xs '(1 2)) `(a (b ~@xs))", "(a (b 1 2))");
        assert_eval("`(a . b)", "(a . b)");
        assert_eval("(def x 3) `~x", "3");
        assert_eval("(def x 5) `(a . ~x)", "(a . 5)");
        assert_eval("`(a ~@'() b)", "(a b)");
        assert_eval_error("(def x 1) `(a ~@x)", ErrorKind::Type);
        assert_eval_error("`(a ~nope)", ErrorKind::Binding);
    }

    #[test]
    fn test_nested_syntax_quote() {
        assert_eval(
            "`(1 `(2 ~(3 ~(+ 1 2))))",
            "(1 (syntax-quote (2 (unquote (3 3)))))",
        );
        assert_eval(
            "(def xs '(1 2)) `(a `(b ~@(c ~@xs)))",
            "(a (syntax-quote (b (splicing-unquote (c 1 2)))))",
        );
    }

    #[test]
    fn test_syntax_quote_ignores_user_bindings() {
        assert_eval("(defn f (cons) `(x ~cons)) (f 1)", "(x 1)");
        assert_eval("(let ((cons 5)) `(a b))", "(a b)");
        assert_eval(
            "(defn concat2 (a b) 'oops) (def xs '(1 2)) `(a ~@xs)",
            "(a 1 2)",
        );
    }

    #[test]
    fn test_macro_with_syntax_quote() {
        assert_eval(
            "(defmacro when (c . body) `(cond (~c (let () ~@body))))
             (when t 1 2 3)",
            "3",
        );
        assert_eval(
            "(defmacro when (c . body) `(cond (~c (let () ~@body))))
             (when () 1)",
            "()",
        );
    }

    #[test]
    fn test_cxr() {
        assert_eval("(cadr '(1 2 3))", "2");
        assert_eval("(caddr '(1 2 3))", "3");
        assert_eval("(cddr '(1 2 3))", "(3)");
        assert_eval("(caar '((1) 2))", "1");
        assert_eval("cadr", "<lambda(xs)>");
        assert_eval_error("cxr", ErrorKind::Binding);
        assert_eval_error("(cadr 1)", ErrorKind::Type);
    }

    #[test]
    fn test_cxr_ignores_user_bindings() {
        assert_eval("(let ((car 1)) (cadr '(1 2 3)))", "2");
        assert_eval("(defn cdr (x) 'mine) (caddr '(1 2 3))", "3");
    }

    #[test]
    fn test_core_forms_without_natives() {
        let evaluator = Evaluator::new(NativeRegistry::new());
        let env = Environment::new();
        let eval = |source: &str| evaluator.eval_str(source, &env).map(|v| v.to_string());
        assert_eq!(eval("`(a b)"), Ok("(a b)".to_string()));
        assert_eq!(eval("(def xs '(1 2)) `(a ~@xs b)"), Ok("(a 1 2 b)".to_string()));
        assert_eq!(eval("(cadr '(1 2))"), Ok("2".to_string()));
        assert_eq!(eval("(cddr '(1 2 3))"), Ok("(3)".to_string()));
    }

    #[test]
    fn test_comment() {
        assert_eval("#_(error '(never)) 1", "1");
        assert_eval("(comment anything here)", "()");
    }

    #[test]
    fn test_apply_on_closures() {
        let evaluator = Evaluator::with_core_natives();
        let env = Environment::new();
        let func = evaluator.eval_str("(lambda (a . more) (cons a more))", &env).unwrap();
        let result = evaluator
            .apply(&func, vec![Sexpr::number(1), Sexpr::number(2)], &env)
            .unwrap();
        assert_eq!(result.to_string(), "(1 2)");
    }

    #[test]
    fn test_not_a_function() {
        assert_eval_error("(1 2)", ErrorKind::Type);
        assert_eval_error("('a 2)", ErrorKind::Type);
    }

    #[test]
    fn test_malformed_call() {
        assert_eval_error("(+ 1 . 2)", ErrorKind::Syntax);
    }

    #[test]
    fn test_parse_errors_surface_as_eval_errors() {
        assert_eval_error("(+ 1", ErrorKind::Parse);
        assert_eval_error("(a @)", ErrorKind::Lex);
    }

    #[test]
    fn test_custom_native_registry() {
        fn always_seven(_: &Evaluator, _: Vec<Sexpr>, _: &Rc<RefCell<Environment>>) -> EvalResult {
            Ok(Sexpr::number(7))
        }
        let mut natives = NativeRegistry::new();
        natives.register("seven", 0, false, "Return seven", always_seven);
        let evaluator = Evaluator::new(natives);
        let env = Environment::new();
        assert_eq!(evaluator.eval_str("(seven)", &env).unwrap(), Sexpr::number(7));
        assert!(evaluator.eval_str("(+ 1 2)", &env).is_err());
        assert!(evaluator.eval_str("(seven 1)", &env).is_err());
    }

    #[test]
    fn test_environment_shadows_natives() {
        assert_eval("(defn car (x) 'mine) (car '(1))", "mine");
    }
}
