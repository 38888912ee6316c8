// Module loading tests: file resolution, the `use` binding forms,
// caching, cycle handling, and native modules.

mod common;

use common::{run_in_dir, SharedBuf};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::PathBuf;
use vesper::compiler::Compiler;
use vesper::errors::CollectingReporter;
use vesper::lexer::tokenize;
use vesper::native::{NativeCtx, NativeResult};
use vesper::parser::Parser;
use vesper::source::SourceMap;
use vesper::value::Value;
use vesper::vm::{ExecuteOutcome, Vm};

fn write_module(dir: &PathBuf, name: &str, source: &str) {
    fs::write(dir.join(name), source).expect("write module");
}

fn run_script(dir: PathBuf, source: &str) -> (String, ExecuteOutcome, CollectingReporter) {
    let result = run_in_dir(source, dir, false);
    (result.stdout, result.outcome, result.reporter)
}

#[test]
fn use_binds_the_module_under_its_stem() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(&dir.path().to_path_buf(), "util.vsp", "fn double(x) { ret x * 2; }");

    let (stdout, outcome, reporter) =
        run_script(dir.path().to_path_buf(), r#"use "util"; put(util.double(21));"#);
    assert_eq!(outcome, ExecuteOutcome::Ok, "{:?}", reporter.messages());
    assert_eq!(stdout, "42");
}

#[test]
fn use_with_alias() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(&dir.path().to_path_buf(), "math_helpers.vsp", "fn triple(x) { ret x * 3; }");

    let (stdout, outcome, _) = run_script(
        dir.path().to_path_buf(),
        r#"use "math_helpers" -> m; put(m.triple(5));"#,
    );
    assert_eq!(outcome, ExecuteOutcome::Ok);
    assert_eq!(stdout, "15");
}

#[test]
fn use_star_imports_into_the_global_namespace() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(&dir.path().to_path_buf(), "consts.vsp", "answer : 42; fn shout() { ret answer; }");

    let (stdout, outcome, _) = run_script(
        dir.path().to_path_buf(),
        r#"use "consts" -> *; put(answer); put(shout());"#,
    );
    assert_eq!(outcome, ExecuteOutcome::Ok);
    assert_eq!(stdout, "4242");
}

#[test]
fn use_selective_with_aliases() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(
        &dir.path().to_path_buf(),
        "pair.vsp",
        "first : 1; second : 2; third : 3;",
    );

    let (stdout, outcome, _) = run_script(
        dir.path().to_path_buf(),
        r#"use "pair" -> (first, second -> two); put(first); put(two);"#,
    );
    assert_eq!(outcome, ExecuteOutcome::Ok);
    assert_eq!(stdout, "12");
}

#[test]
fn module_bodies_run_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(&dir.path().to_path_buf(), "loud.vsp", r#"put("loaded"); x : 1;"#);

    let (stdout, outcome, _) = run_script(
        dir.path().to_path_buf(),
        r#"use "loud" -> a; use "loud" -> b; put(a.x + b.x);"#,
    );
    assert_eq!(outcome, ExecuteOutcome::Ok);
    assert_eq!(stdout, "loaded2");
}

#[test]
fn cyclic_imports_do_not_recurse() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(&dir.path().to_path_buf(), "a.vsp", r#"use "b" -> bee; a_value : 1;"#);
    write_module(&dir.path().to_path_buf(), "b.vsp", r#"use "a" -> eh; b_value : 2;"#);

    let (stdout, outcome, reporter) = run_script(
        dir.path().to_path_buf(),
        r#"use "a"; put(a.a_value);"#,
    );
    assert_eq!(outcome, ExecuteOutcome::Ok, "{:?}", reporter.messages());
    assert_eq!(stdout, "1");
}

#[test]
fn missing_module_throws() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, outcome, reporter) =
        run_script(dir.path().to_path_buf(), r#"use "nowhere"; put(1);"#);
    assert_eq!(outcome, ExecuteOutcome::RuntimeError);
    assert!(reporter.any_contains("cannot find module"));
}

#[test]
fn module_with_syntax_errors_fails_the_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(&dir.path().to_path_buf(), "broken.vsp", "fn {{{");

    let (_, outcome, reporter) =
        run_script(dir.path().to_path_buf(), r#"use "broken"; put(1);"#);
    assert_eq!(outcome, ExecuteOutcome::RuntimeError);
    assert!(reporter.any_contains("failed to import module"));
}

// === Native modules ===

fn sys_answer(_ctx: &mut NativeCtx) -> NativeResult {
    Ok(Value::Int(42))
}

fn sys_main(ctx: &mut NativeCtx) -> NativeResult {
    ctx.create_function("answer", 0, sys_answer);
    ctx.set_global("version", Value::Int(3));
    Ok(Value::Null)
}

#[test]
fn native_modules_resolve_before_the_filesystem() {
    let source = r#"use "sys"; put(sys.answer()); put(sys.version);"#;
    let mut map =
        SourceMap::new(source.to_string(), "<test>".to_string(), PathBuf::from("."));
    let reporter = CollectingReporter::new();
    let mut frontend = reporter.clone();

    let lexed = tokenize(source, &mut map, &mut frontend);
    let outcome = Parser::new(&lexed.tokens, &map).parse(&mut frontend);
    assert!(!outcome.had_error);

    let mut vm = Vm::new();
    vm.create_module("sys", sys_main);
    vm.set_reporter(Box::new(reporter.clone()));
    let buffer = SharedBuf::default();
    vm.set_output(Box::new(buffer.clone()));

    let compiled = Compiler::compile(&outcome.ast, &map, &mut vm.heap, &mut frontend);
    assert!(!compiled.had_error);
    assert_eq!(vm.execute(compiled.function), ExecuteOutcome::Ok, "{:?}", reporter.messages());
    assert_eq!(buffer.contents(), "423");
}
