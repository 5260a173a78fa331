//! Embedding runtime
//!
//! [`Melon`] drives the whole pipeline (lex → parse → resolve → emit →
//! run) for hosts that just want to evaluate source text; the CLI and the
//! integration tests go through it.

use crate::compiler::Compiler;
use crate::diagnostic::Diagnostic;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::resolver::Resolver;
use crate::stdlib::CoreLib;
use crate::value::{Function, RuntimeError, Value};
use crate::vm::Vm;
use std::rc::Rc;
use thiserror::Error;

/// A compiled program, ready to run
#[derive(Debug, Clone)]
pub struct Script {
    /// Synthetic main function holding the top-level code
    pub main: Rc<Function>,
    /// Number of global slots the program needs
    pub global_count: usize,
}

/// Errors an embedder can get out of [`Melon::eval`]
#[derive(Debug, Error)]
pub enum MelonError {
    /// One or more compile-time diagnostics
    #[error("{}", format_diagnostics(.0))]
    Compile(Vec<Diagnostic>),
    /// The VM aborted the run
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<Vec<Diagnostic>> for MelonError {
    fn from(diagnostics: Vec<Diagnostic>) -> Self {
        MelonError::Compile(diagnostics)
    }
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.message.clone())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The Melon runtime: core library plus the compile/run pipeline
pub struct Melon {
    core: CoreLib,
}

impl Melon {
    /// Create a runtime with a fresh core library
    pub fn new() -> Self {
        Self {
            core: CoreLib::new(),
        }
    }

    /// The core library this runtime compiles and runs against
    pub fn core(&self) -> &CoreLib {
        &self.core
    }

    /// Compile source text into a script
    ///
    /// Each phase runs only when every earlier phase finished without
    /// errors; the first failing phase reports everything it found.
    pub fn compile(&self, source: &str) -> Result<Script, Vec<Diagnostic>> {
        let (tokens, diagnostics) = Lexer::new(source).tokenize();
        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        let (mut program, diagnostics) = Parser::new(tokens, source).parse();
        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        let resolution = Resolver::new(source).resolve(&mut program)?;

        let main = Compiler::new(&self.core, source).compile(&program)?;
        Ok(Script {
            main,
            global_count: resolution.global_count,
        })
    }

    /// Compile and run source text
    ///
    /// Returns the value of the program's last expression statement, if
    /// any.
    pub fn eval(&self, source: &str) -> Result<Option<Value>, MelonError> {
        let script = self.compile(source)?;
        let mut vm = Vm::new(self.core.clone(), script.global_count);
        vm.run_main(script.main).map_err(MelonError::Runtime)
    }
}

impl Default for Melon {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_arithmetic() {
        let melon = Melon::new();
        let result = melon.eval("var x = 1 + 2 * 3; x;").unwrap();
        assert_eq!(result, Some(Value::Int(7)));
    }

    #[test]
    fn test_compile_error_reported() {
        let melon = Melon::new();
        let err = melon.eval("var x = y;").unwrap_err();
        let MelonError::Compile(diags) = err else {
            panic!("expected compile error");
        };
        assert!(diags.iter().any(|d| d.code == "ML3002"));
    }

    #[test]
    fn test_runtime_error_reported() {
        let melon = Melon::new();
        let err = melon.eval("var x = 1 / 0;").unwrap_err();
        assert!(matches!(
            err,
            MelonError::Runtime(RuntimeError::DivisionByZero)
        ));
    }

    #[test]
    fn test_pipeline_stops_after_first_failing_phase() {
        let melon = Melon::new();
        // parse error; the undeclared identifier never reaches the resolver
        let err = melon.eval("var = 1; undeclared;").unwrap_err();
        let MelonError::Compile(diags) = err else {
            panic!("expected compile error");
        };
        assert!(diags.iter().all(|d| d.code.starts_with("ML2")));
    }
}
