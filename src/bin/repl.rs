use std::borrow::Cow;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use conslisp::evaluator::SPECIAL_FORMS;
use conslisp::{Environment, Evaluator, TokenKind, is_balanced, parse_str, tokenize_str};
use rustyline::error::ReadlineError;
use rustyline::highlight::{CmdKind, Highlighter};
use rustyline::validate::{ValidationContext, ValidationResult, Validator};
use rustyline::{Cmd, Completer, Context, Editor, EventHandler, KeyCode, KeyEvent, Modifiers};
use rustyline::{Helper, Highlighter, Hinter, Validator};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conslisp-repl")]
#[command(about = "Interactive conslisp session")]
struct Args {
    /// Use vi key bindings instead of emacs
    #[arg(long)]
    vi: bool,

    /// Where to load and save line history
    #[arg(long, default_value = "conslisp_history.txt")]
    history: PathBuf,
}

struct LispCompleter {
    env: Rc<RefCell<Environment>>,
    builtin_names: Vec<String>, // Special forms and natives
}

impl LispCompleter {
    fn new(env: Rc<RefCell<Environment>>, evaluator: &Evaluator) -> Self {
        let mut builtin_names: Vec<String> = SPECIAL_FORMS.iter().map(|s| s.to_string()).collect();
        builtin_names.extend(evaluator.natives().names());
        LispCompleter { env, builtin_names }
    }
}

impl rustyline::completion::Completer for LispCompleter {
    type Candidate = String;
    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let tokens = tokenize_str(&line[..pos]);
        let prefix = match tokens.last() {
            Some(token) if token.span.end == pos => match &token.kind {
                TokenKind::Atom(prefix) => prefix.clone(),
                _ => return Ok((pos, vec![])),
            },
            _ => return Ok((pos, vec![])),
        };
        let mut candidates: Vec<String> = self
            .env
            .borrow()
            .identifiers()
            .into_iter()
            .chain(self.builtin_names.iter().cloned())
            .filter(|id| id.starts_with(&prefix) && id.len() > prefix.len())
            .map(|id| id[prefix.len()..].to_string())
            .collect();
        candidates.sort();
        candidates.dedup();
        Ok((pos, candidates))
    }
}

#[derive(Completer, Helper, Highlighter, Hinter, Validator)]
struct InputValidator {
    #[rustyline(Validator)]
    validator: LispValidator,
    #[rustyline(Highlighter)]
    highlighter: LispHighlighter,
    #[rustyline(Completer)]
    completer: LispCompleter,
}

struct LispValidator;

impl Validator for LispValidator {
    fn validate(&self, ctx: &mut ValidationContext) -> rustyline::Result<ValidationResult> {
        match is_balanced(&tokenize_str(ctx.input())) {
            Ok(true) => Ok(ValidationResult::Valid(None)),
            Ok(false) => Ok(ValidationResult::Incomplete),
            // Let the parser report stray closers with context
            Err(_) => Ok(ValidationResult::Valid(None)),
        }
    }
}

struct LispHighlighter;

impl Highlighter for LispHighlighter {
    // Highlights the paren just before the cursor and its partner; unmatched closers in red.
    fn highlight<'l>(&self, line: &'l str, pos: usize) -> Cow<'l, str> {
        let mut open: Vec<usize> = Vec::new();
        let mut partner: Option<(usize, usize)> = None;
        let mut unmatched: Vec<usize> = Vec::new();
        let cursor = pos.checked_sub(1);
        for (i, c) in line.char_indices() {
            match c {
                '(' => open.push(i),
                ')' => match open.pop() {
                    Some(start) if cursor == Some(i) || cursor == Some(start) => {
                        partner = Some((start, i));
                    }
                    Some(_) => {}
                    None => unmatched.push(i),
                },
                _ => {}
            }
        }
        if partner.is_none() && unmatched.is_empty() {
            return Cow::Borrowed(line);
        }

        let mut highlighted = String::with_capacity(line.len() + 16);
        for (i, c) in line.char_indices() {
            if partner.is_some_and(|(start, end)| i == start || i == end) {
                highlighted.push_str(&format!("\x1b[1;34m{}\x1b[0m", c)); // Blue for matching parens
            } else if unmatched.contains(&i) {
                highlighted.push_str(&format!("\x1b[31m{}\x1b[0m", c)); // Red for unmatched closing parens
            } else {
                highlighted.push(c);
            }
        }
        Cow::Owned(highlighted)
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _kind: CmdKind) -> bool {
        true
    }
}

fn main() -> rustyline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    println!("conslisp REPL v{}", env!("CARGO_PKG_VERSION"));
    println!("Type 'exit' or press Ctrl-D to quit.");

    let evaluator = Evaluator::with_core_natives();
    let global_env = Environment::new();
    let h = InputValidator {
        highlighter: LispHighlighter,
        validator: LispValidator,
        completer: LispCompleter::new(global_env.clone(), &evaluator),
    };
    let edit_mode = if args.vi {
        rustyline::EditMode::Vi
    } else {
        rustyline::EditMode::Emacs
    };
    let config = rustyline::config::Config::builder()
        .edit_mode(edit_mode)
        .build();
    let mut rl = Editor::with_config(config)?;
    rl.set_helper(Some(h));
    rl.bind_sequence(
        KeyEvent(KeyCode::Char('s'), Modifiers::CTRL),
        EventHandler::Simple(Cmd::Newline),
    );
    if rl.load_history(&args.history).is_err() {
        println!("No previous history.");
    }

    loop {
        match rl.readline("conslisp> ") {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let trimmed_input = line.trim();
                if trimmed_input.is_empty() {
                    continue;
                }
                if trimmed_input.eq_ignore_ascii_case("exit") {
                    break;
                }

                match parse_str(trimmed_input) {
                    Ok(forms) => {
                        for form in forms {
                            match evaluator.evaluate(form, global_env.clone()) {
                                Ok(result) => println!("{}", result),
                                Err(e) => {
                                    eprintln!("ERROR:\n{}", e);
                                    break;
                                }
                            }
                        }
                    }
                    Err(parse_err) => {
                        if parse_err.pretty_print("REPL", trimmed_input).is_err() {
                            eprintln!("Parse Error: {}", parse_err);
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C
                println!("Interrupted. Type 'exit' or Ctrl-D to quit.");
            }
            Err(ReadlineError::Eof) => {
                // Ctrl-D
                println!("\nExiting.");
                break;
            }
            Err(err) => {
                eprintln!("Readline Error: {:?}", err);
                break;
            }
        }
    }
    rl.save_history(&args.history)
}
