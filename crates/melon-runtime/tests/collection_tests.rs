//! Arrays, ranges and for-in iteration

mod common;

use common::{eval, eval_value};
use melon_runtime::{MelonError, RuntimeError, Value};
use pretty_assertions::assert_eq;
use rstest::rstest;

// ============================================================================
// Arrays
// ============================================================================

#[test]
fn test_array_indexing() {
    assert_eq!(eval_value("var a = [10, 20, 30]; a[1];"), Value::Int(20));
}

#[test]
fn test_array_store_and_load() {
    let source = "var a = [10, 20, 30]; a[1] = a[0] + a[2]; a[1];";
    assert_eq!(eval_value(source), Value::Int(40));
}

#[test]
fn test_array_compound_assignment() {
    assert_eq!(
        eval_value("var a = [10, 20, 30]; a[1] += 5; a[1];"),
        Value::Int(25)
    );
}

#[test]
fn test_nested_array_access() {
    assert_eq!(
        eval_value("var grid = [[1, 2], [3, 4]]; grid[1][0];"),
        Value::Int(3)
    );
}

#[test]
fn test_array_push_and_pop() {
    let source = r#"
        var a = [1];
        a.push(2);
        a.push(3);
        a.pop();
        len(a);
    "#;
    assert_eq!(eval_value(source), Value::Int(2));
}

#[test]
fn test_array_out_of_bounds() {
    let err = eval("var a = [1]; a[3];").unwrap_err();
    assert!(matches!(
        err,
        MelonError::Runtime(RuntimeError::IndexOutOfBounds { index: 3, len: 1 })
    ));
}

#[test]
fn test_array_shared_by_reference() {
    let source = r#"
        var a = [1, 2];
        var b = a;
        b[0] = 9;
        a[0];
    "#;
    assert_eq!(eval_value(source), Value::Int(9));
}

// ============================================================================
// Ranges
// ============================================================================

#[test]
fn test_range_sum_is_end_exclusive() {
    let source = "var s = 0; for (var i in 0..5) { s = s + i; } s;";
    assert_eq!(eval_value(source), Value::Int(10));
}

#[test]
fn test_descending_range() {
    let source = "var s = 0; for (var i in 5..0) { s = s + i; } s;";
    assert_eq!(eval_value(source), Value::Int(15));
}

#[test]
fn test_empty_range_body_never_runs() {
    let source = "var s = 0; for (var i in 3..3) { s = s + 1; } s;";
    assert_eq!(eval_value(source), Value::Int(0));
}

#[test]
fn test_range_endpoints_must_be_integers() {
    let err = eval("var a = 1; var b = 2.5; var r = a..b; r;").unwrap_err();
    assert!(matches!(
        err,
        MelonError::Runtime(RuntimeError::RangeBounds)
    ));
}

// ============================================================================
// For-in
// ============================================================================

#[test]
fn test_forin_over_array() {
    let source = r#"
        var sum = 0;
        for (var v in [1, 2, 3, 4]) {
            sum = sum + v;
        }
        sum;
    "#;
    assert_eq!(eval_value(source), Value::Int(10));
}

#[test]
fn test_forin_inside_function() {
    let source = r#"
        func total(items) {
            var sum = 0;
            for (var v in items) {
                sum = sum + v;
            }
            return sum;
        }
        total([5, 10, 15]);
    "#;
    assert_eq!(eval_value(source), Value::Int(30));
}

#[test]
fn test_nested_forin() {
    let source = r#"
        var count = 0;
        for (var i in 0..3) {
            for (var j in 0..4) {
                count = count + 1;
            }
        }
        count;
    "#;
    assert_eq!(eval_value(source), Value::Int(12));
}

#[test]
fn test_forin_over_empty_array() {
    let source = "var hits = 0; for (var v in []) { hits = hits + 1; } hits;";
    assert_eq!(eval_value(source), Value::Int(0));
}

#[rstest]
#[case("0..1", 0)]
#[case("0..4", 6)]
#[case("1..4", 6)]
fn test_range_sums(#[case] range: &str, #[case] expected: i32) {
    let source = format!("var s = 0; for (var i in {}) {{ s = s + i; }} s;", range);
    assert_eq!(eval_value(&source), Value::Int(expected));
}

#[test]
fn test_forin_builds_array() {
    let source = r#"
        var squares = [];
        for (var i in 1..4) {
            squares.push(i * i);
        }
        squares[0] + squares[1] + squares[2];
    "#;
    assert_eq!(eval_value(source), Value::Int(14));
}
