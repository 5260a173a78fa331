//! Classes, methods, static members and operator overloading

mod common;

use common::{eval, eval_value};
use melon_runtime::{MelonError, RuntimeError, Value};
use pretty_assertions::assert_eq;

#[test]
fn test_constructor_and_method() {
    let source = r#"
        class C {
            var a;
            func C(x) { a = x; }
            func get() { return a; }
        }
        var c = C(42);
        c.get();
    "#;
    assert_eq!(eval_value(source), Value::Int(42));
}

#[test]
fn test_field_access_by_name() {
    let source = r#"
        class P {
            var x;
            var y;
            func P(a, b) { x = a; y = b; }
        }
        var p = P(3, 4);
        p.x + p.y;
    "#;
    assert_eq!(eval_value(source), Value::Int(7));
}

#[test]
fn test_field_store_from_outside() {
    let source = r#"
        class P {
            var x;
            func P(a) { x = a; }
        }
        var p = P(1);
        p.x = 10;
        p.x;
    "#;
    assert_eq!(eval_value(source), Value::Int(10));
}

#[test]
fn test_class_without_constructor() {
    let source = r#"
        class Box {
            var value;
            func set(v) { value = v; }
            func get() { return value; }
        }
        var b = Box();
        b.set(5);
        b.get();
    "#;
    assert_eq!(eval_value(source), Value::Int(5));
}

#[test]
fn test_member_initializers_run_in_init() {
    let source = r#"
        class K {
            var a = 2;
            var b = 3;
            func product() { return a * b; }
        }
        var k = K();
        k.product();
    "#;
    assert_eq!(eval_value(source), Value::Int(6));
}

#[test]
fn test_two_instances_have_separate_state() {
    let source = r#"
        class Cell {
            var v;
            func Cell(x) { v = x; }
        }
        var a = Cell(1);
        var b = Cell(2);
        a.v + b.v * 10;
    "#;
    assert_eq!(eval_value(source), Value::Int(21));
}

#[test]
fn test_operator_overload_add() {
    let source = r#"
        class V {
            var x;
            func V(a) { x = a; }
            operator + (o) { return V(x + o.x); }
        }
        var a = V(1) + V(2);
        a.x;
    "#;
    assert_eq!(eval_value(source), Value::Int(3));
}

#[test]
fn test_operator_overload_eq() {
    let source = r#"
        class V {
            var x;
            func V(a) { x = a; }
            operator == (o) { return x == o.x; }
        }
        V(2) == V(2);
    "#;
    assert_eq!(eval_value(source), Value::Bool(true));
}

#[test]
fn test_chained_overloads() {
    let source = r#"
        class V {
            var x;
            func V(a) { x = a; }
            operator + (o) { return V(x + o.x); }
            operator * (o) { return V(x * o.x); }
        }
        var r = V(2) * V(3) + V(4);
        r.x;
    "#;
    assert_eq!(eval_value(source), Value::Int(10));
}

#[test]
fn test_static_var_and_method() {
    let source = r#"
        class Counter {
            static var count = 0;
            static func bump() { count = count + 1; return count; }
        }
        Counter.bump();
        Counter.bump();
        Counter.bump();
    "#;
    assert_eq!(eval_value(source), Value::Int(3));
}

#[test]
fn test_static_initializer_runs_once() {
    let source = r#"
        class Config {
            static var base = 40;
            static func get() { return base; }
        }
        Config.get() + 2;
    "#;
    assert_eq!(eval_value(source), Value::Int(42));
}

#[test]
fn test_zero_argument_method() {
    let source = r#"
        class M {
            func hi() { return 7; }
        }
        var m = M();
        m.hi();
    "#;
    assert_eq!(eval_value(source), Value::Int(7));
}

#[test]
fn test_missing_method_error() {
    let source = r#"
        class C { var a; }
        var c = C();
        c.missing();
    "#;
    let err = eval(source).unwrap_err();
    let MelonError::Runtime(RuntimeError::UnknownMethod { class, name }) = err else {
        panic!("expected unknown-method error");
    };
    assert_eq!(class, "C");
    assert_eq!(name, "missing");
}

#[test]
fn test_instance_passed_to_function() {
    let source = r#"
        class P {
            var x;
            func P(a) { x = a; }
        }
        func unwrap(p) { return p.x; }
        unwrap(P(9));
    "#;
    assert_eq!(eval_value(source), Value::Int(9));
}

#[test]
fn test_instances_compare_by_identity() {
    let source = r#"
        class C { var a; }
        var x = C();
        var y = x;
        x == y;
    "#;
    assert_eq!(eval_value(source), Value::Bool(true));

    let source = r#"
        class C { var a; }
        C() == C();
    "#;
    assert_eq!(eval_value(source), Value::Bool(false));
}
