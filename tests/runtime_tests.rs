// Runtime-level tests: garbage collection behavior, string interning,
// and the stress mode that collects at every safepoint. Programs that
// exercise the heap hard are run twice, normally and stressed, and
// must behave identically.

mod common;

use common::{run, run_stressed};
use pretty_assertions::assert_eq;
use vesper::heap::Heap;
use vesper::value::{UpvalueObj, Value};
use vesper::vm::ExecuteOutcome;

#[test]
fn interning_returns_one_handle_per_byte_sequence() {
    let mut heap = Heap::new();
    let a = heap.alloc_string("shared");
    let b = heap.alloc_string("shared");
    assert_eq!(a, b);
    assert_eq!(heap.live_count(), 1);
}

#[test]
fn collection_keeps_everything_reachable() {
    let mut heap = Heap::new();
    let module = heap.alloc_module();
    let name = heap.alloc_string("f");
    let function = heap.alloc_function(name, 0, module);
    let closure = heap.alloc_closure(function, Vec::new());
    let _garbage = heap.alloc_string("garbage");

    heap.mark_obj(closure);
    heap.trace();
    heap.sweep();

    // Everything reachable from the closure survived; the loose string
    // did not.
    assert_eq!(heap.live_count(), 4);
    assert_eq!(heap.str_chars(name), "f");
}

#[test]
fn closed_upvalues_hold_their_value_across_collection() {
    let mut heap = Heap::new();
    let payload = heap.alloc_string("captured");
    let upvalue = heap.alloc_upvalue(0);
    *heap.upvalue_mut(upvalue) = UpvalueObj::Closed(Value::Obj(payload));

    heap.mark_obj(upvalue);
    heap.trace();
    heap.sweep();

    assert!(matches!(heap.upvalue(upvalue), UpvalueObj::Closed(Value::Obj(id)) if id == payload));
    assert_eq!(heap.str_chars(payload), "captured");
}

// === Stress mode preserves semantics ===

#[test]
fn stressed_allocation_heavy_loop() {
    let source = r#"
        total : 0;
        for i in range(0, 50) {
            s : "x" ++ "y";
            l : [i, s];
            total = total + l[0];
        }
        put(total);
    "#;
    assert_eq!(run(source).stdout, "1225");
    let stressed = run_stressed(source);
    assert_eq!(stressed.outcome, ExecuteOutcome::Ok, "{:?}", stressed.reporter.messages());
    assert_eq!(stressed.stdout, "1225");
}

#[test]
fn stressed_closures_survive_collection() {
    let source = r#"
        fn make(n) { ret || n * 2; }
        fns : [];
        for i in range(0, 10) { fns.push(make(i)); }
        total : 0;
        for i in range(0, 10) { total = total + fns[i](); }
        put(total);
    "#;
    assert_eq!(run(source).stdout, "90");
    assert_eq!(run_stressed(source).stdout, "90");
}

#[test]
fn stressed_exceptions_and_finally() {
    let source = r#"
        fn risky(n) {
            try {
                if n % 2 == 0 { throw TypeError("even"); }
                ret "odd";
            } finally { put("f"); }
        }
        for i in range(0, 4) {
            try { put(risky(i)); } catch TypeError { put("e"); }
        }
    "#;
    let expected = "fefoddfefodd";
    assert_eq!(run(source).stdout, expected);
    assert_eq!(run_stressed(source).stdout, expected);
}

#[test]
fn stressed_dict_growth() {
    let source = r#"
        d : {};
        for i in range(0, 64) { d[i] = i * 3; }
        put(d.size);
        put(d[63]);
    "#;
    assert_eq!(run(source).stdout, "64189");
    assert_eq!(run_stressed(source).stdout, "64189");
}

#[test]
fn stressed_instances_keep_their_fields() {
    let source = r#"
        class Node {
            fn $init($, value) { $.value = value; $.next = null; }
        }
        head : null;
        for i in range(0, 20) {
            n : Node(i);
            n.next = head;
            head = n;
        }
        total : 0;
        while head != null {
            total = total + head.value;
            head = head.next;
        }
        put(total);
    "#;
    assert_eq!(run(source).stdout, "190");
    assert_eq!(run_stressed(source).stdout, "190");
}
