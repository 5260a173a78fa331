//! End-to-end execution tests for the compile-and-run pipeline

mod common;

use common::{eval, eval_value};
use melon_runtime::{MelonError, RuntimeError, Value};
use pretty_assertions::assert_eq;
use rstest::rstest;

// ============================================================================
// Arithmetic and promotion
// ============================================================================

#[rstest]
#[case("1 + 2 * 3;", Value::Int(7))]
#[case("(1 + 2) * 3;", Value::Int(9))]
#[case("10 - 4 - 3;", Value::Int(3))]
#[case("7 / 2;", Value::Int(3))]
#[case("7 % 3;", Value::Int(1))]
#[case("-5 + 2;", Value::Int(-3))]
#[case("1 + 0.5;", Value::Float(1.5))]
#[case("0.5 + 1;", Value::Float(1.5))]
#[case("1.5 * 2.0;", Value::Float(3.0))]
#[case("7 / 2.0;", Value::Float(3.5))]
fn test_arithmetic(#[case] source: &str, #[case] expected: Value) {
    assert_eq!(eval_value(source), expected);
}

#[rstest]
#[case("1 < 2;", true)]
#[case("2 <= 2;", true)]
#[case("3 > 4;", false)]
#[case("1.5 >= 1;", true)]
#[case("1 == 1;", true)]
#[case("1 == 1.0;", true)]
#[case("1 != 2;", true)]
#[case("\"a\" == \"a\";", true)]
#[case("\"a\" == \"b\";", false)]
#[case("\"a\" != \"b\";", true)]
#[case("true && false;", false)]
#[case("true || false;", true)]
#[case("!false;", true)]
fn test_comparisons_and_logic(#[case] source: &str, #[case] expected: bool) {
    assert_eq!(eval_value(source), Value::Bool(expected));
}

// ============================================================================
// Variables and control flow
// ============================================================================

#[test]
fn test_globals_persist_across_statements() {
    assert_eq!(eval_value("var x = 1 + 2 * 3; x;"), Value::Int(7));
}

#[test]
fn test_assignment_expression_value() {
    assert_eq!(eval_value("var x = 1; x = 41 + 1;"), Value::Int(42));
}

#[rstest]
#[case("var x = 0; if (true) { x = 1; } x;", 1)]
#[case("var x = 0; if (false) { x = 1; } x;", 0)]
#[case("var x = 0; if (false) { x = 1; } else { x = 2; } x;", 2)]
#[case(
    "var x = 0; if (false) { x = 1; } else if (true) { x = 2; } else { x = 3; } x;",
    2
)]
fn test_if_else(#[case] source: &str, #[case] expected: i32) {
    assert_eq!(eval_value(source), Value::Int(expected));
}

#[test]
fn test_while_loop() {
    let source = r#"
        var sum = 0;
        var i = 0;
        while (i < 5) {
            sum = sum + i;
            i = i + 1;
        }
        sum;
    "#;
    assert_eq!(eval_value(source), Value::Int(10));
}

#[test]
fn test_c_style_for_loop() {
    let source = r#"
        var sum = 0;
        for (var i = 0; i < 10; i = i + 1) {
            sum = sum + i;
        }
        sum;
    "#;
    assert_eq!(eval_value(source), Value::Int(45));
}

#[test]
fn test_compound_assignment() {
    assert_eq!(eval_value("var x = 10; x += 5; x *= 2; x -= 6; x /= 4; x;"), Value::Int(6));
}

// ============================================================================
// Functions
// ============================================================================

#[test]
fn test_function_call() {
    assert_eq!(
        eval_value("func double(x) { return x * 2; } double(21);"),
        Value::Int(42)
    );
}

#[test]
fn test_recursion() {
    let source = r#"
        func fact(n) {
            if (n < 2) { return 1; }
            return n * fact(n - 1);
        }
        fact(6);
    "#;
    assert_eq!(eval_value(source), Value::Int(720));
}

#[test]
fn test_function_calling_function() {
    let source = r#"
        func add(a, b) { return a + b; }
        func add3(a, b, c) { return add(add(a, b), c); }
        add3(10, 20, 12);
    "#;
    assert_eq!(eval_value(source), Value::Int(42));
}

#[test]
fn test_anonymous_function() {
    let source = r#"
        var twice = func (x) { return x + x; };
        twice(8);
    "#;
    assert_eq!(eval_value(source), Value::Int(16));
}

#[test]
fn test_forward_reference_between_globals() {
    // pass 1 hoists every top-level declaration
    let source = r#"
        func even(n) { if (n == 0) { return true; } return odd(n - 1); }
        func odd(n) { if (n == 0) { return false; } return even(n - 1); }
        even(10);
    "#;
    assert_eq!(eval_value(source), Value::Bool(true));
}

// ============================================================================
// Strings and natives
// ============================================================================

#[test]
fn test_string_concatenation() {
    assert_eq!(
        eval_value("var s = \"foo\" + 'bar'; s;"),
        Value::string("foobar")
    );
}

#[test]
fn test_str_native() {
    assert_eq!(eval_value("str(42);"), Value::string("42"));
    assert_eq!(eval_value("str(true);"), Value::string("true"));
}

#[test]
fn test_len_native() {
    assert_eq!(eval_value("len(\"hello\");"), Value::Int(5));
    assert_eq!(eval_value("len([1, 2, 3]);"), Value::Int(3));
    assert_eq!(eval_value("len(0..5);"), Value::Int(5));
}

// ============================================================================
// Runtime errors
// ============================================================================

#[test]
fn test_division_by_zero() {
    let err = eval("1 / 0;").unwrap_err();
    assert!(matches!(
        err,
        MelonError::Runtime(RuntimeError::DivisionByZero)
    ));
}

#[test]
fn test_calling_non_callable() {
    let err = eval("var x = 1; x();").unwrap_err();
    assert!(matches!(
        err,
        MelonError::Runtime(RuntimeError::NotCallable("int"))
    ));
}

#[test]
fn test_type_mismatch_without_overload() {
    let err = eval("1 + \"a\";").unwrap_err();
    assert!(matches!(
        err,
        MelonError::Runtime(RuntimeError::UnknownMethod { .. })
    ));
}

#[test]
fn test_ordering_non_numeric_is_an_error() {
    let err = eval("\"a\" < \"b\";").unwrap_err();
    assert!(matches!(
        err,
        MelonError::Runtime(RuntimeError::TypeError(_))
    ));
}
