// File: src/main.rs
//
// Main entry point for the Vesper programming language.
// Parses command-line arguments and drives the pipeline: scan, parse,
// compile, then hand the root function to the VM. Any frontend error
// exits before execution.

use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use vesper::bytecode;
use vesper::compiler::Compiler;
use vesper::errors::TerminalReporter;
use vesper::heap::Heap;
use vesper::lexer::Lexer;
use vesper::parser::Parser;
use vesper::repl::Repl;
use vesper::source::SourceMap;
use vesper::value::{Obj, Value};
use vesper::vm::{ExecuteOutcome, Vm};

#[derive(ClapParser)]
#[command(
    name = "vesper",
    about = "Vesper: a small dynamically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a Vesper script file
    Run {
        /// Path to the .vsp file
        file: PathBuf,

        /// Collect garbage at every safepoint (also: VESPER_GC_STRESS)
        #[arg(long)]
        gc_stress: bool,

        /// Print disassembled bytecode before running
        /// (also: VESPER_DUMP_BYTECODE)
        #[arg(long)]
        dump_bytecode: bool,
    },

    /// Launch the interactive REPL
    Repl,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { file, gc_stress, dump_bytecode } => run_file(file, gc_stress, dump_bytecode),
        Commands::Repl => match Repl::new() {
            Ok(mut repl) => match repl.run() {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("repl error: {}", err);
                    ExitCode::FAILURE
                }
            },
            Err(err) => {
                eprintln!("failed to start repl: {}", err);
                ExitCode::FAILURE
            }
        },
    }
}

fn run_file(file: PathBuf, gc_stress: bool, dump_bytecode: bool) -> ExitCode {
    let source = match fs::read_to_string(&file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("couldn't read file \"{}\": {}", file.display(), err);
            return ExitCode::FAILURE;
        }
    };

    let directory = file
        .parent()
        .map(|p| p.to_path_buf())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    let mut map = SourceMap::new(source, file.display().to_string(), directory.clone());
    let mut reporter = TerminalReporter::new();

    let lexed = {
        let text = map.source.clone();
        Lexer::new(&text).scan(&mut map, &mut reporter)
    };
    let outcome = Parser::new(&lexed.tokens, &map).parse(&mut reporter);
    if lexed.had_error || outcome.had_error {
        return ExitCode::FAILURE;
    }

    let mut vm = Vm::new();
    vm.set_base_dir(directory);
    vm.heap.stress = gc_stress || std::env::var("VESPER_GC_STRESS").is_ok();

    let compiled = Compiler::compile(&outcome.ast, &map, &mut vm.heap, &mut reporter);
    if compiled.had_error {
        return ExitCode::FAILURE;
    }

    if dump_bytecode || std::env::var("VESPER_DUMP_BYTECODE").is_ok() {
        dump_functions(&vm.heap);
    }

    match vm.execute(compiled.function) {
        ExecuteOutcome::Ok => ExitCode::SUCCESS,
        ExecuteOutcome::RuntimeError => ExitCode::FAILURE,
    }
}

/// Disassemble every compiled function registered in the constant
/// pool, the root script included.
fn dump_functions(heap: &Heap) {
    for index in 0..heap.constant_count() {
        let Some(Value::Obj(id)) = heap.constant(index as u32) else {
            continue;
        };
        if let Obj::Function(function) = heap.get(id) {
            let name = heap.str_chars(function.name);
            let name = if name.is_empty() { "<anonymous>" } else { name };
            eprint!("{}", bytecode::disassemble(&function.chunk, name));
        }
    }
}
