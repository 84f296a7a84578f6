//! Bolt command-line driver: run a file, evaluate a string, or start an
//! interactive REPL. An optional `bolt.toml` next to the script (or in the
//! working directory) tunes module search paths and collector pacing.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use bolt::object::format_number;
use bolt::{Context, Value};

#[derive(Parser)]
#[command(name = "bolt", version, about = "The Bolt language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a .bolt source file
    Run {
        path: PathBuf,
        /// Print the compiled bytecode before running
        #[arg(long)]
        dump: bool,
    },
    /// Evaluate a source string and print its result
    Eval { source: String },
    /// Start an interactive session
    Repl,
}

/// Host-side configuration, read from `bolt.toml` when present.
#[derive(Debug, Default, Deserialize)]
struct HostConfig {
    /// Extra module search patterns, tried after the defaults.
    #[serde(default)]
    module_paths: Vec<String>,
    /// Collector floor in bytes.
    #[serde(default)]
    gc_min_size: Option<usize>,
    /// Collector growth factor in percent.
    #[serde(default)]
    gc_growth_pct: Option<usize>,
}

fn load_config(near: Option<&Path>) -> HostConfig {
    let mut candidates = Vec::new();
    if let Some(dir) = near.and_then(|p| p.parent()) {
        candidates.push(dir.join("bolt.toml"));
    }
    candidates.push(PathBuf::from("bolt.toml"));

    for candidate in candidates {
        if let Ok(text) = std::fs::read_to_string(&candidate) {
            match toml::from_str(&text) {
                Ok(config) => return config,
                Err(err) => {
                    eprintln!("warning: ignoring {}: {}", candidate.display(), err);
                }
            }
        }
    }
    HostConfig::default()
}

fn make_context(config: &HostConfig) -> Context {
    let mut ctx = Context::new();
    for pattern in &config.module_paths {
        ctx.append_module_path(pattern);
    }
    if let Some(min) = config.gc_min_size {
        ctx.gc.min_size = min;
        ctx.gc.next_cycle = ctx.gc.next_cycle.max(min);
    }
    if let Some(pct) = config.gc_growth_pct {
        ctx.gc.growth_pct = pct;
    }
    ctx
}

fn print_value(ctx: &mut Context, value: Value) {
    if value.is_null() {
        return;
    }
    if value.is_number() {
        println!("{}", format_number(value.as_number()));
        return;
    }
    let s = bolt::object::to_string(ctx, value);
    unsafe { println!("{}", (*s).as_str()) };
}

fn run_file(path: &Path, dump: bool) -> i32 {
    let config = load_config(Some(path));
    let mut ctx = make_context(&config);

    let Ok(source) = std::fs::read_to_string(path) else {
        eprintln!("cannot read {}", path.display());
        return 1;
    };

    let name = path.display().to_string();
    let Some(module) = ctx.compile_module(&source, &name) else {
        return 1;
    };

    if dump {
        print!("{}", bolt::debug::dump_module(&mut ctx, module));
    }

    match ctx.execute_with_result(module) {
        Some(value) => {
            print_value(&mut ctx, value);
            0
        }
        None => 1,
    }
}

fn eval_source(source: &str) -> i32 {
    let config = load_config(None);
    let mut ctx = make_context(&config);
    match ctx.eval(source) {
        Ok(value) => {
            print_value(&mut ctx, value);
            0
        }
        Err(_) => 1,
    }
}

fn repl() -> i32 {
    let config = load_config(None);
    let mut ctx = make_context(&config);

    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("cannot start line editor: {}", err);
            return 1;
        }
    };

    println!("bolt {} — ctrl-d to exit", bolt::VERSION);
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);

                // Bare expressions echo their value; statements run as-is.
                let first = line.split_whitespace().next().unwrap_or("");
                let is_statement = matches!(
                    first,
                    "let" | "var" | "fn" | "type" | "method" | "if" | "for" | "import"
                        | "export" | "return" | "break" | "continue"
                );
                let source = if is_statement {
                    line.clone()
                } else {
                    format!("return {}", line)
                };
                if let Ok(value) = ctx.eval(&source) {
                    print_value(&mut ctx, value);
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(_) => break,
        }
    }
    0
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { path, dump } => run_file(&path, dump),
        Command::Eval { source } => eval_source(&source),
        Command::Repl => repl(),
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses() {
        let config: HostConfig = toml::from_str(
            "module_paths = [\"lib/%s.bolt\"]\ngc_min_size = 1048576\ngc_growth_pct = 150",
        )
        .unwrap();
        assert_eq!(config.module_paths, vec!["lib/%s.bolt".to_string()]);
        assert_eq!(config.gc_min_size, Some(1048576));
        assert_eq!(config.gc_growth_pct, Some(150));
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: HostConfig = toml::from_str("").unwrap();
        assert!(config.module_paths.is_empty());
        assert!(config.gc_min_size.is_none());
        assert!(config.gc_growth_pct.is_none());
    }
}
