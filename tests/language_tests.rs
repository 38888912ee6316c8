// Integration tests for the Vesper interpreter
//
// These tests run complete Vesper programs through the whole pipeline
// and check captured output and error behavior. Covered areas:
// - Variable scoping and shadowing
// - Control flow (if/elif/else, loops, match, break)
// - Functions, closures, and upvalue sharing
// - Classes, methods, inheritance, operator overloading
// - Exceptions: try/catch/finally in all exit combinations
// - Built-in containers and functions

mod common;

use common::{expect_output, run};
use pretty_assertions::assert_eq;
use vesper::vm::ExecuteOutcome;

// === Core end-to-end scenarios ===

#[test]
fn for_over_range_prints_each_element() {
    expect_output("for i in range(0,10) { put(i); }", "0123456789");
}

#[test]
fn block_locals_shadow_globals() {
    expect_output("x : 1; { x : 10; put(x); } put(x);", "101");
}

#[test]
fn catch_runs_before_finally() {
    expect_output(
        r#"fn f() { try { throw 1; } catch n -> v { put("c"); } finally { put("f"); } } f();"#,
        "cf",
    );
}

#[test]
fn counter_closure_keeps_state() {
    expect_output(
        "fn make() { x : 0; ret || { x = x + 1; ret x; }; } c : make(); put(c()); put(c()); put(c());",
        "123",
    );
}

#[test]
fn init_sets_instance_fields() {
    expect_output("class P { fn $init($) { $.a = 1; } } p : P(); put(p.a);", "1");
}

#[test]
fn string_concatenation() {
    expect_output(r#"put("ab" ++ "cd");"#, "abcd");
}

// === Variables and scoping ===

#[test]
fn multi_declarations_and_assignment() {
    expect_output("a : 1, b : 2; a = b + 3; put(a); put(b);", "52");
}

#[test]
fn compound_assignments() {
    expect_output(
        r#"x : 10; x += 5; put(x); x -= 3; put(x); x *= 2; put(x); x /= 4; put(x); x %= 4; put(x);"#,
        "15122462",
    );
}

#[test]
fn string_compound_concat() {
    expect_output(r#"s : "a"; s ++= "b"; put(s);"#, "ab");
}

#[test]
fn later_declarations_may_omit_the_initializer() {
    expect_output("a : 1, b; put(b); put(a);", "null1");
}

#[test]
fn assignment_is_an_expression() {
    expect_output("x : 1; y : (x = 7); put(x); put(y);", "77");
}

// === Control flow ===

#[test]
fn if_elif_else_chains() {
    let source = r#"
        fn grade(n) {
            if n > 2 { ret "big"; }
            elif n == 2 { ret "two"; }
            else { ret "small"; }
        }
        put(grade(3)); put(grade(2)); put(grade(1));
    "#;
    expect_output(source, "bigtwosmall");
}

#[test]
fn while_counts_down() {
    expect_output("n : 3; while n > 0 { put(n); n = n - 1; }", "321");
}

#[test]
fn break_leaves_an_infinite_loop() {
    expect_output("n : 0; loop { n = n + 1; if n == 4 { break; } } put(n);", "4");
}

#[test]
fn and_or_short_circuit() {
    // The right side would throw NameError if evaluated.
    expect_output("put(false and missing()); put(true or missing());", "falsetrue");
}

#[test]
fn not_uses_truthiness() {
    expect_output("put(not false); put(not null); put(not 0);", "truetruefalse");
}

#[test]
fn match_expression_patterns() {
    let source = r#"
        fn pick(n) {
            match n {
                {1} => put("one");
                {2} => put("two");
                * => put("many");
            }
        }
        pick(1); pick(2); pick(9);
    "#;
    expect_output(source, "onetwomany");
}

#[test]
fn match_class_patterns() {
    let source = r#"
        class A { }
        class B { }
        fn which(x) {
            match x {
                A => put("a");
                B => put("b");
                Int => put("i");
                * => put("?");
            }
        }
        which(A()); which(B()); which(3); which("s");
    "#;
    expect_output(source, "abi?");
}

// === Functions and closures ===

#[test]
fn recursion() {
    expect_output(
        "fn fib(n) { if n < 2 { ret n; } ret fib(n - 1) + fib(n - 2); } put(fib(10));",
        "55",
    );
}

#[test]
fn lambdas_with_expression_bodies() {
    expect_output("square : |x| x * x; put(square(7));", "49");
}

#[test]
fn two_closures_share_one_upvalue() {
    let source = r#"
        fn make() {
            x : 0;
            inc : || { x = x + 1; ret x; };
            get : || x;
            ret [inc, get];
        }
        pair : make();
        pair[0]();
        pair[0]();
        put(pair[1]());
    "#;
    expect_output(source, "2");
}

#[test]
fn arity_mismatch_throws() {
    let result = run("fn f(a, b) { ret a; } f(1);");
    assert_eq!(result.outcome, ExecuteOutcome::RuntimeError);
    assert!(result.reporter.any_contains("expects 2 arguments"));
}

// === Classes ===

#[test]
fn methods_bind_their_receiver() {
    let source = r#"
        class Counter {
            fn $init($) { $.n = 0; }
            fn bump($) { $.n = $.n + 1; ret $.n; }
        }
        c : Counter();
        bump : c.bump;
        bump();
        put(bump());
    "#;
    expect_output(source, "2");
}

#[test]
fn constructor_result_is_the_instance_even_with_explicit_return() {
    expect_output(
        "class P { fn $init($) { $.a = 5; ret 99; } } p : P(); put(p.a);",
        "5",
    );
}

#[test]
fn inheritance_copies_methods() {
    let source = r#"
        class Animal { fn speak($) { ret "..."; } fn name($) { ret "animal"; } }
        class Dog < Animal { fn speak($) { ret "woof"; } }
        d : Dog();
        put(d.speak()); put(d.name());
    "#;
    expect_output(source, "woofanimal");
}

#[test]
fn impl_extends_an_existing_class() {
    let source = r#"
        class Point { fn $init($) { $.x = 3; } }
        impl Point { fn double($) { ret $.x * 2; } }
        put(Point().double());
    "#;
    expect_output(source, "6");
}

#[test]
fn operator_overloading_dispatches_to_methods() {
    let source = r#"
        class Vec {
            fn $init($, x, y) { $.x = x; $.y = y; }
            fn $add($, o) { ret Vec($.x + o.x, $.y + o.y); }
            fn $str($) { ret "(" ++ "v" ++ ")"; }
        }
        v : Vec(1, 2) + Vec(5, 9);
        put(v.x); put(v.y); put(v);
    "#;
    expect_output(source, "611(v)");
}

#[test]
fn index_overloading() {
    let source = r#"
        class Box {
            fn $init($) { $.v = null; }
            fn $get_index($, k) { ret $.v; }
            fn $set_index($, k, value) { $.v = value; ret value; }
        }
        b : Box();
        b[0] = 42;
        put(b[99]);
    "#;
    expect_output(source, "42");
}

#[test]
fn instance_equality_is_identity() {
    let source = r#"
        class A { }
        x : A();
        y : A();
        put(x == x); put(x == y);
    "#;
    expect_output(source, "truefalse");
}

// === Exceptions ===

#[test]
fn throw_and_catch_by_class() {
    let source = r#"
        try { throw TypeError("bad"); }
        catch TypeError -> e { put("t:"); put(e.msg); }
    "#;
    expect_output(source, "t:bad");
}

#[test]
fn unmatched_catch_rethrows_to_outer_handler() {
    let source = r#"
        try {
            try { throw TypeError("x"); }
            catch NameError { put("wrong"); }
        } catch TypeError { put("right"); }
    "#;
    expect_output(source, "right");
}

#[test]
fn finally_runs_on_normal_exit() {
    expect_output(r#"try { put("t"); } finally { put("f"); } put("d");"#, "tfd");
}

#[test]
fn finally_runs_on_exceptional_exit() {
    let source = r#"
        try {
            try { throw 1; } finally { put("f"); }
        } catch n { put("c"); }
    "#;
    expect_output(source, "fc");
}

#[test]
fn finally_runs_on_return_exit() {
    expect_output(
        r#"fn f() { try { ret 1; } finally { put("f"); } } put(f());"#,
        "f1",
    );
}

#[test]
fn finally_runs_on_break_exit() {
    expect_output(
        r#"loop { try { break; } finally { put("f"); } } put("d");"#,
        "fd",
    );
}

#[test]
fn exception_inside_catch_still_runs_finally() {
    let source = r#"
        try {
            try { throw 1; }
            catch a { throw 2; }
            finally { put("f"); }
        } catch b -> v { put("c"); put(v); }
    "#;
    expect_output(source, "fc2");
}

#[test]
fn finally_runs_exactly_once_per_exit() {
    let source = r#"
        fn f(mode) {
            loop {
                try {
                    if mode == 0 { break; }
                    if mode == 1 { ret "r"; }
                    if mode == 2 { throw 1; }
                } finally { put("f"); }
                break;
            }
            ret "n";
        }
        f(0);
        f(1);
        try { f(2); } catch e { }
    "#;
    expect_output(source, "fff");
}

#[test]
fn uncaught_exception_reports_a_trace() {
    let result = run(r#"fn inner() { throw TypeError("boom"); } fn outer() { inner(); } outer();"#);
    assert_eq!(result.outcome, ExecuteOutcome::RuntimeError);
    assert!(result.reporter.any_contains("boom"));
    let traces = result.reporter.traces();
    let functions: Vec<String> =
        traces[0].iter().map(|frame| frame.function.clone()).collect();
    assert!(functions.contains(&"inner".to_string()));
    assert!(functions.contains(&"outer".to_string()));
}

#[test]
fn undefined_variable_throws_name_error() {
    let result = run("put(missing);");
    assert_eq!(result.outcome, ExecuteOutcome::RuntimeError);
    assert!(result.reporter.any_contains("undefined variable 'missing'"));
}

#[test]
fn division_by_zero_throws() {
    let result = run("put(1 / 0);");
    assert_eq!(result.outcome, ExecuteOutcome::RuntimeError);
    assert!(result.reporter.any_contains("division by zero"));
}

#[test]
fn error_classes_render_their_message() {
    expect_output(r#"e : NameError("oops"); put(e);"#, "oops");
}

// === Numbers and equality ===

#[test]
fn arithmetic_promotion_produces_floats() {
    expect_output("put(1 + 2.5); put(2.5 + 1); put(3 * 2);", "3.53.56");
}

#[test]
fn comparisons_promote_too() {
    expect_output("put(1 < 1.5); put(2.0 <= 2); put(3 > 4);", "truetruefalse");
}

#[test]
fn strings_never_equal_numbers() {
    expect_output(r#"put("1" == 1); put("1" != 1);"#, "falsetrue");
}

#[test]
fn interned_strings_compare_equal() {
    expect_output(r#"put("ab" == "a" ++ "b");"#, "true");
}

#[test]
fn numeric_builtins() {
    expect_output(
        "put(floor(2.7)); put(ceil(2.1)); put(round(2.5)); put(pow(2, 10)); put(is_nan(0.0 / 0.0));",
        "2331024true",
    );
}

// === Containers ===

#[test]
fn list_operations() {
    let source = r#"
        l : [1, 2, 3];
        put(l.size);
        put(l[1]);
        l.push(4);
        put(l.size);
        l[0] = 9;
        put(l[0]);
    "#;
    expect_output(source, "3249");
}

#[test]
fn list_renders_its_elements() {
    expect_output(r#"put([1, "a", true]);"#, "[1, a, true]");
}

#[test]
fn list_index_out_of_range_throws() {
    let result = run("l : [1]; put(l[5]);");
    assert_eq!(result.outcome, ExecuteOutcome::RuntimeError);
    assert!(result.reporter.any_contains("out of range"));
}

#[test]
fn for_iterates_lists() {
    expect_output("for x in [5, 6, 7] { put(x); }", "567");
}

#[test]
fn dict_operations() {
    let source = r#"
        d : {"a": 1, 2: "b"};
        put(d["a"]);
        put(d[2]);
        d["c"] = 3;
        put(d.size);
        put(d["missing"]);
    "#;
    expect_output(source, "1b3null");
}

#[test]
fn dict_keys_use_the_hash_protocol() {
    let source = r#"
        class Key {
            fn $init($, id) { $.id = id; }
            fn $hash($) { ret $.id; }
        }
        d : {};
        d[Key(1)] = "one";
        k : Key(1);
        put(d[k] == null);
        d[k] = "again";
        put(d.size);
    "#;
    // Distinct instances hash alike but never compare equal.
    expect_output(source, "true2");
}

#[test]
fn unhashable_dict_key_throws() {
    let result = run("d : {}; d[[1]] = 2;");
    assert_eq!(result.outcome, ExecuteOutcome::RuntimeError);
    assert!(result.reporter.any_contains("not hashable"));
}

// === Strings ===

#[test]
fn string_len_counts_code_points() {
    expect_output(r#"put("héllo".len()); put("".len());"#, "50");
}

#[test]
fn string_escapes_and_unicode() {
    expect_output(r#"put("a\tbA");"#, "a\tbA");
}

#[test]
fn concat_requires_strings() {
    let result = run(r#"put("a" ++ 1);"#);
    assert_eq!(result.outcome, ExecuteOutcome::RuntimeError);
    assert!(result.reporter.any_contains("requires two strings"));
}

#[test]
fn putln_appends_a_newline() {
    expect_output(r#"putln("a"); put("b");"#, "a\nb");
}
