// Shared pipeline harness for the integration tests: run a source
// string through scan/parse/compile/execute with captured output.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use vesper::compiler::Compiler;
use vesper::errors::CollectingReporter;
use vesper::lexer::tokenize;
use vesper::parser::Parser;
use vesper::source::SourceMap;
use vesper::vm::{ExecuteOutcome, Vm};

/// Writer whose clones share one buffer, so the test keeps a handle
/// while the VM owns the sink.
#[derive(Clone, Default)]
pub struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("output is UTF-8")
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct RunResult {
    pub stdout: String,
    pub outcome: ExecuteOutcome,
    pub reporter: CollectingReporter,
}

pub fn run(source: &str) -> RunResult {
    run_in_dir(source, PathBuf::from("."), false)
}

pub fn run_stressed(source: &str) -> RunResult {
    run_in_dir(source, PathBuf::from("."), true)
}

pub fn run_in_dir(source: &str, dir: PathBuf, gc_stress: bool) -> RunResult {
    let mut map = SourceMap::new(source.to_string(), "<test>".to_string(), dir.clone());
    let reporter = CollectingReporter::new();
    let mut frontend_reporter = reporter.clone();

    let lexed = tokenize(source, &mut map, &mut frontend_reporter);
    assert!(!lexed.had_error, "lex errors: {:?}", reporter.messages());
    let outcome = Parser::new(&lexed.tokens, &map).parse(&mut frontend_reporter);
    assert!(!outcome.had_error, "parse errors: {:?}", reporter.messages());

    let mut vm = Vm::new();
    vm.set_base_dir(dir);
    vm.set_reporter(Box::new(reporter.clone()));
    vm.heap.stress = gc_stress;

    let buffer = SharedBuf::default();
    vm.set_output(Box::new(buffer.clone()));

    let compiled = Compiler::compile(&outcome.ast, &map, &mut vm.heap, &mut frontend_reporter);
    assert!(!compiled.had_error, "compile errors: {:?}", reporter.messages());

    let outcome = vm.execute(compiled.function);
    RunResult { stdout: buffer.contents(), outcome, reporter }
}

/// Assert a program runs cleanly and produces exactly `expected`.
pub fn expect_output(source: &str, expected: &str) {
    let result = run(source);
    assert_eq!(
        result.outcome,
        ExecuteOutcome::Ok,
        "runtime errors: {:?}",
        result.reporter.messages()
    );
    assert_eq!(result.stdout, expected);
}
