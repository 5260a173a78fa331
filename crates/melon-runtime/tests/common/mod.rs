//! Shared helpers for integration tests
#![allow(dead_code)]

use melon_runtime::{Melon, MelonError, Value};

/// Compile and run a program, returning its last expression value
pub fn eval(source: &str) -> Result<Option<Value>, MelonError> {
    Melon::new().eval(source)
}

/// Compile and run a program that must succeed and produce a value
pub fn eval_value(source: &str) -> Value {
    eval(source)
        .expect("program failed")
        .expect("program produced no value")
}
