use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use conslisp::{Environment, EvalError, Evaluator, ParseError, parse, tokenize};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conslisp")]
#[command(about = "Evaluate conslisp source files in order, stopping at the first error")]
struct Cli {
    /// Source files to evaluate
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Print the value of each top-level form
    #[arg(short, long)]
    print: bool,
}

#[derive(Debug, Error)]
enum RunError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{0}")]
    Parse(ParseError), // Already reported with its source context
    #[error("ERROR:\n{0}")]
    Eval(#[from] EvalError),
}

fn run_file(
    evaluator: &Evaluator,
    env: &Rc<RefCell<Environment>>,
    path: &Path,
    print: bool,
) -> Result<(), RunError> {
    let name = path.display().to_string();
    let source = fs::read_to_string(path).map_err(|source| RunError::Io {
        path: name.clone(),
        source,
    })?;
    let lines: Vec<&str> = source.split('\n').collect();
    let forms = match parse(&tokenize(&lines)) {
        Ok(forms) => forms,
        Err(err) => {
            // Fall back to the plain message if stderr can't take the report
            if err.pretty_print(&name, &source).is_err() {
                eprintln!("{}", err);
            }
            return Err(RunError::Parse(err));
        }
    };
    info!(file = %name, forms = forms.len(), "evaluating");
    for form in forms {
        let value = evaluator.evaluate(form, env.clone())?;
        if print {
            println!("{}", value);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let evaluator = Evaluator::with_core_natives();
    let env = Environment::new();

    for path in &cli.files {
        match run_file(&evaluator, &env, path, cli.print) {
            Ok(()) => {}
            Err(RunError::Parse(_)) => return ExitCode::FAILURE,
            Err(err) => {
                eprintln!("{}", err);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
