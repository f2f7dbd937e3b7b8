// ABOUTME: CLI driver: run a script file or start the interactive REPL

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use slug::config::{self, Config};
use slug::env::{Environment, ModuleInfo};
use slug::interp::{self, Task};
use slug::object::Object;
use slug::runtime::Runtime;
use slug::trace;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// The Slug interpreter
#[derive(Parser, Debug)]
#[command(name = "slug")]
#[command(version = config::VERSION)]
#[command(about = "A small, expression-oriented scripting language")]
struct CliArgs {
    /// Script file to execute (starts a REPL when omitted)
    #[arg(value_name = "SCRIPT")]
    script: Option<PathBuf>,

    /// Project root for module resolution (defaults to the script's directory)
    #[arg(long = "root", value_name = "PATH")]
    root: Option<PathBuf>,

    /// Library root (defaults to $SLUG_HOME)
    #[arg(long = "home", value_name = "PATH")]
    home: Option<PathBuf>,

    /// Default nursery limit
    #[arg(long = "nursery-limit", value_name = "N", default_value_t = config::DEFAULT_NURSERY_LIMIT)]
    nursery_limit: usize,

    /// Arguments passed through to the script as argv/argm
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let root = cli
        .root
        .clone()
        .or_else(|| {
            cli.script
                .as_ref()
                .and_then(|s| s.parent().map(|p| p.to_path_buf()))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    let config = Config {
        root,
        home: cli
            .home
            .clone()
            .or_else(|| std::env::var_os(config::HOME_VAR).map(PathBuf::from)),
        nursery_limit: cli.nursery_limit.max(1),
    };
    let runtime = Runtime::new(config);
    match &cli.script {
        Some(path) => run_script(&runtime, path, &cli.args),
        None => repl(&runtime),
    }
}

fn run_script(runtime: &Arc<Runtime>, path: &PathBuf, args: &[String]) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("slug: cannot read {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    match interp::run_source(runtime, &source, &path.display().to_string(), args) {
        Err(parse_error) => {
            eprintln!("slug: {}", parse_error);
            ExitCode::FAILURE
        }
        Ok(result) => match trace::render_abrupt(&result) {
            Some(rendered) => {
                eprintln!("{}", rendered);
                ExitCode::FAILURE
            }
            None => ExitCode::SUCCESS,
        },
    }
}

fn repl(runtime: &Arc<Runtime>) -> ExitCode {
    println!(
        "{} v{} ({})",
        config::WELCOME_MESSAGE,
        config::VERSION,
        config::WELCOME_SUBTITLE
    );
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("slug: cannot start REPL: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let info = Arc::new(ModuleInfo {
        fqn: "repl".to_string(),
        path: "<repl>".to_string(),
        source: String::new(),
    });
    let env = Environment::enclosed_module(runtime.prelude.clone(), info);
    let mut task = Task::new_root(runtime.clone());
    loop {
        match editor.readline("slug> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                match slug::parser::parse(&line) {
                    Err(e) => eprintln!("parse error: {}", e),
                    Ok(program) => {
                        let result = task.run_program(&program, &env);
                        match trace::render_abrupt(&result) {
                            Some(rendered) => eprintln!("{}", rendered),
                            None => {
                                if !matches!(result, Object::Nil) {
                                    println!("{}", result.inspect());
                                }
                            }
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("slug: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
