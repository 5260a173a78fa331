//! Property tests for the pipeline laws

mod common;

use common::eval_value;
use melon_runtime::{Lexer, Parser, Resolver, Value};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

proptest! {
    /// Int arithmetic matches host arithmetic (wrapping)
    #[test]
    fn prop_int_arithmetic_matches_host(a in -10_000i32..10_000, b in -10_000i32..10_000) {
        let source = format!("({}) + ({}); ", a, b);
        prop_assert_eq!(eval_value(&source), Value::Int(a.wrapping_add(b)));

        let source = format!("({}) * ({}); ", a, b);
        prop_assert_eq!(eval_value(&source), Value::Int(a.wrapping_mul(b)));

        let source = format!("({}) - ({}); ", a, b);
        prop_assert_eq!(eval_value(&source), Value::Int(a.wrapping_sub(b)));
    }

    /// Any Float operand promotes the result to Float
    #[test]
    fn prop_float_promotion(a in -10_000i32..10_000, b_whole in -1000i32..1000) {
        // x.5 literals print without an exponent and are exactly
        // representable, so source round-trips are bit-precise
        let b = b_whole as f64 + 0.5;
        let source = format!("({}) + ({:?}); ", a, b);
        prop_assert_eq!(eval_value(&source), Value::Float(a as f64 + b));

        let source = format!("({:?}) * ({}); ", b, a);
        prop_assert_eq!(eval_value(&source), Value::Float(b * a as f64));
    }

    /// Integer division and modulo follow host semantics when defined
    #[test]
    fn prop_div_mod_match_host(a in -10_000i32..10_000, b in 1i32..1000) {
        let source = format!("({}) / ({}); ", a, b);
        prop_assert_eq!(eval_value(&source), Value::Int(a.wrapping_div(b)));

        let source = format!("({}) % ({}); ", a, b);
        prop_assert_eq!(eval_value(&source), Value::Int(a.wrapping_rem(b)));
    }

    /// Comparisons agree with host comparisons under promotion
    #[test]
    fn prop_comparisons_match_host(a in -100i32..100, b_whole in -100i32..100) {
        let b = b_whole as f64 + 0.5;
        let source = format!("({}) < ({:?}); ", a, b);
        prop_assert_eq!(eval_value(&source), Value::Bool((a as f64) < b));

        let source = format!("({}) >= ({:?}); ", a, b);
        prop_assert_eq!(eval_value(&source), Value::Bool(a as f64 >= b));
    }

    /// Half-open range iteration sums like the equivalent host loop
    #[test]
    fn prop_range_sum_matches_host(start in -50i32..50, len in 0i32..50) {
        let end = start + len;
        let source = format!(
            "var s = 0; for (var i in ({})..({})) {{ s = s + i; }} s;",
            start, end
        );
        let expected: i32 = (start..end).sum();
        prop_assert_eq!(eval_value(&source), Value::Int(expected));
    }

    /// Resolving the same source twice yields identical location/idx tags
    #[test]
    fn prop_resolution_is_deterministic(
        depth in 1usize..5,
        name in "[a-z][a-z0-9]{0,6}",
    ) {
        // build a nest of closures all referencing the outermost local, so
        // upvalue threading runs at every depth
        let name = format!("x_{}", name);
        let mut source = format!("func f0() {{ var {} = 1; ", name);
        for level in 1..=depth {
            source.push_str(&format!("func f{}() {{ ", level));
        }
        source.push_str(&format!("return {}; ", name));
        for _ in 0..=depth {
            source.push_str("} ");
        }

        let resolve = |text: &str| {
            let (tokens, diags) = Lexer::new(text).tokenize();
            prop_assert!(diags.is_empty());
            let (mut program, diags) = Parser::new(tokens, text).parse();
            prop_assert!(diags.is_empty());
            Resolver::new(text)
                .resolve(&mut program)
                .map_err(|e| TestCaseError::fail(format!("resolve failed: {:?}", e)))?;
            Ok(format!("{:?}", program))
        };

        prop_assert_eq!(resolve(&source)?, resolve(&source)?);
    }
}
