//! AST to bytecode compiler
//!
//! Walks the resolved tree emitting into a stack of contexts: the main
//! function, nested functions, and classes under construction. Emitting in
//! a class context means emitting into the class's synthetic `$init`
//! function (instance members) or the metaclass's `$init` (static
//! members) — the member emitter pushes the right init function before
//! walking an initializer.
//!
//! Member declarations bind their name to `Int(slot)` in the (meta)class
//! table; a method then rebinds its name to the compiled closure, and the
//! init chunk receives a load-by-name / store-into-slot sequence so every
//! instance's slot vector also carries its methods. That slot store is
//! what lets `$init` call `$construct` through a plain integer key.

mod expr;
mod stmt;

use crate::ast::{Program, UpvalueSpec, VarLocation};
use crate::bytecode::{Chunk, Opcode};
use crate::diagnostic::Diagnostic;
use crate::span::Span;
use crate::stdlib::CoreLib;
use crate::value::{Class, Closure, Function, Value};
use std::rc::Rc;

/// A function whose chunk is still being emitted
#[derive(Debug, Default)]
pub(super) struct FunctionCtx {
    pub(super) name: String,
    pub(super) chunk: Chunk,
}

impl FunctionCtx {
    pub(super) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunk: Chunk::new(),
        }
    }
}

/// A class whose members are being emitted
pub(super) struct ClassCtx {
    pub(super) class: Rc<Class>,
    pub(super) metaclass: Rc<Class>,
    /// The class `$init` under construction (taken while a member
    /// initializer is being emitted into it)
    pub(super) init: Option<FunctionCtx>,
    /// The metaclass `$init`, present when the class has static members
    pub(super) meta_init: Option<FunctionCtx>,
    /// Whether the member currently being emitted is static
    pub(super) emitting_static: bool,
}

/// One entry of the emission context stack
pub(super) enum EmitContext {
    Function(FunctionCtx),
    Class(ClassCtx),
}

/// Compiler state
pub struct Compiler {
    /// Emission context stack (main function at the bottom)
    pub(super) contexts: Vec<EmitContext>,
    /// Accumulated diagnostics
    pub(super) diagnostics: Vec<Diagnostic>,
    /// Base class wired as the superclass of every emitted class
    pub(super) object_class: Rc<Class>,
    /// Source text for diagnostic snippets
    source: String,
}

impl Compiler {
    /// Create a new compiler
    ///
    /// `core` supplies the base object class that emitted classes chain to;
    /// it must be the same core library the VM runs with.
    pub fn new(core: &CoreLib, source: impl Into<String>) -> Self {
        Self {
            contexts: Vec::new(),
            diagnostics: Vec::new(),
            object_class: core.object_class.clone(),
            source: source.into(),
        }
    }

    /// Compile a resolved program into its main function
    pub fn compile(&mut self, program: &Program) -> Result<Rc<Function>, Vec<Diagnostic>> {
        self.contexts.clear();
        self.contexts
            .push(EmitContext::Function(FunctionCtx::new("<main>")));

        for stmt in &program.body {
            self.emit_stmt(stmt);
        }
        self.chunk().emit(Opcode::Halt);

        let Some(EmitContext::Function(ctx)) = self.contexts.pop() else {
            // contexts are pushed and popped symmetrically
            unreachable!("main context missing after compilation");
        };
        let function = Rc::new(Function::melon(ctx.name, ctx.chunk, 0));

        if self.diagnostics.is_empty() {
            Ok(function)
        } else {
            Err(std::mem::take(&mut self.diagnostics))
        }
    }

    // === Context helpers ===

    /// The chunk currently receiving instructions
    pub(super) fn chunk(&mut self) -> &mut Chunk {
        match self.contexts.last_mut() {
            Some(EmitContext::Function(ctx)) => &mut ctx.chunk,
            // member emission pushes an init function before walking
            // initializers, so a class is never the emission target
            _ => unreachable!("no function context to emit into"),
        }
    }

    /// Add a constant to the current pool, reporting overflow
    pub(super) fn constant(&mut self, value: Value, span: Span) -> u8 {
        match self.chunk().add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error("ML4001", "Maximum amount of constants reached", span);
                0
            }
        }
    }

    /// Emit the load or store matching a resolved location
    pub(super) fn emit_loadstore(
        &mut self,
        location: VarLocation,
        idx: u16,
        store: bool,
        span: Span,
    ) {
        match location {
            VarLocation::Global => {
                if idx > u8::MAX as u16 {
                    self.error("ML4003", "Too many global variables", span);
                    return;
                }
                let op = if store {
                    Opcode::StoreGlobal
                } else {
                    Opcode::LoadGlobal
                };
                self.chunk().emit_with(op, idx as u8);
            }
            VarLocation::Local => {
                let op = if store {
                    Opcode::StoreLocal
                } else {
                    Opcode::LoadLocal
                };
                self.chunk().emit_with(op, idx as u8);
            }
            VarLocation::Upvalue => {
                let op = if store {
                    Opcode::StoreUpvalue
                } else {
                    Opcode::LoadUpvalue
                };
                self.chunk().emit_with(op, idx as u8);
            }
            VarLocation::ClassMember => {
                if store {
                    self.chunk().emit(Opcode::StoreField);
                } else {
                    self.chunk().emit_with(Opcode::LoadField, 0);
                }
            }
            VarLocation::Unresolved => {
                self.error("ML4005", "Internal error: unresolved name reached the emitter", span);
            }
        }
    }

    /// Emit the declaration value of a function or class into the current
    /// context
    ///
    /// Inside a class `$init` the value is a method: it is bound by name in
    /// the (meta)class table and loaded back by name at runtime (the member
    /// emitter then stores it into its slot). Anywhere else the value goes
    /// into the constant pool; closures are followed by their
    /// `CLOSURE` / `NEWUP` construction sequence.
    pub(super) fn store_decl(&mut self, value: Value, upvalues: &[UpvalueSpec], span: Span) {
        if self.in_class_init() {
            let Value::Closure(closure) = &value else {
                self.error("ML4005", "Internal error: only methods bind inside $init", span);
                return;
            };
            let name = closure.function.name.clone();

            let len = self.contexts.len();
            let Some(EmitContext::Class(class_ctx)) = self.contexts.get(len - 2) else {
                return;
            };
            let target = if class_ctx.emitting_static {
                class_ctx.metaclass.clone()
            } else {
                class_ctx.class.clone()
            };
            target.bind(&name, value);

            let key = self.constant(Value::string(&name), span);
            self.chunk().emit_with(Opcode::LoadLocal, 0);
            self.chunk().emit_with(Opcode::LoadConst, key);
            self.chunk().emit_with(Opcode::LoadField, 0);
            return;
        }

        let is_closure = matches!(value, Value::Closure(_));
        let idx = self.constant(value, span);
        self.chunk().emit_with(Opcode::LoadConst, idx);

        if is_closure {
            self.chunk().emit(Opcode::Closure);
            for upvalue in upvalues {
                self.chunk().emit(Opcode::NewUpvalue);
                self.chunk().emit_u8(upvalue.is_direct as u8);
                self.chunk().emit_u8(upvalue.idx as u8);
            }
        }
    }

    /// Whether the current context is a class's `$init` function
    fn in_class_init(&self) -> bool {
        let len = self.contexts.len();
        if len < 2 {
            return false;
        }
        matches!(
            (&self.contexts[len - 1], &self.contexts[len - 2]),
            (EmitContext::Function(f), EmitContext::Class(_)) if f.name == "$init"
        )
    }

    /// Finish a function context into a closure value
    pub(super) fn finish_function(ctx: FunctionCtx, upvalue_count: u8) -> Value {
        let function = Rc::new(Function::melon(ctx.name, ctx.chunk, upvalue_count));
        Value::Closure(Rc::new(Closure::new(function)))
    }

    pub(super) fn error(&mut self, code: &str, message: impl Into<String>, span: Span) {
        let source = self.source.clone();
        self.diagnostics.push(
            Diagnostic::error_with_code(code, message, span).with_location(&source, span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::resolver::Resolver;

    fn compile_source(source: &str) -> Rc<Function> {
        let (tokens, diags) = Lexer::new(source).tokenize();
        assert!(diags.is_empty(), "lex errors: {:?}", diags);
        let mut parser = Parser::new(tokens, source);
        let (mut program, diags) = parser.parse();
        assert!(diags.is_empty(), "parse errors: {:?}", diags);
        Resolver::new(source).resolve(&mut program).expect("resolve");
        let core = CoreLib::new();
        Compiler::new(&core, source).compile(&program).expect("compile")
    }

    #[test]
    fn test_small_ints_avoid_the_constant_pool() {
        let function = compile_source("var x = 1 + 2 * 3; x;");
        let chunk = function.chunk().unwrap();
        assert!(chunk.constants.is_empty());
        assert_eq!(chunk.code[0], Opcode::LoadInt as u8);
    }

    #[test]
    fn test_large_int_uses_pool() {
        let function = compile_source("var x = 1000;");
        let chunk = function.chunk().unwrap();
        assert_eq!(chunk.constants, vec![Value::Int(1000)]);
    }

    #[test]
    fn test_main_ends_with_halt() {
        let function = compile_source("var x = 1;");
        let chunk = function.chunk().unwrap();
        assert_eq!(*chunk.code.last().unwrap(), Opcode::Halt as u8);
    }

    #[test]
    fn test_closure_construction_sequence() {
        let function = compile_source(
            "func make() { var c = 0; func inc() { c = c + 1; return c; } return inc; }",
        );
        let chunk = function.chunk().unwrap();
        // make's proto closure is constant 0 of main
        let Value::Closure(make) = &chunk.constants[0] else {
            panic!("expected closure constant");
        };
        let make_chunk = make.function.chunk().unwrap();
        // inside make: inc's proto closure is followed by CLOSURE + one
        // direct NEWUP pair for `c` (local slot 0)
        let code = &make_chunk.code;
        let pos = code
            .iter()
            .position(|&b| b == Opcode::Closure as u8)
            .expect("CLOSURE emitted");
        assert_eq!(code[pos + 1], Opcode::NewUpvalue as u8);
        assert_eq!(code[pos + 2], 1); // is_direct
        assert_eq!(code[pos + 3], 0); // local slot of c
        // the wrapped function declares exactly one upvalue
        let Value::Closure(inc) = &make_chunk.constants[0] else {
            panic!("expected inc closure constant");
        };
        assert_eq!(inc.function.upvalue_count(), 1);
    }

    #[test]
    fn test_function_body_gets_implicit_return0() {
        let function = compile_source("func f() { var a = 1; }");
        let chunk = function.chunk().unwrap();
        let Value::Closure(f) = &chunk.constants[0] else {
            panic!("expected closure");
        };
        let code = &f.function.chunk().unwrap().code;
        assert_eq!(*code.last().unwrap(), Opcode::Return0 as u8);
    }

    #[test]
    fn test_class_emission_binds_members() {
        let function =
            compile_source("class C { var a; func C(x) { a = x; } func get() { return a; } }");
        let chunk = function.chunk().unwrap();
        let class = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Class(class) => Some(class.clone()),
                _ => None,
            })
            .expect("class constant");
        assert_eq!(class.name, "C");
        assert_eq!(class.nvars, 3); // a, $construct, get
        // data member binds to its slot index
        assert_eq!(class.lookup("a"), Some(Value::Int(0)));
        // methods rebind to closures
        assert!(matches!(class.lookup("$construct"), Some(Value::Closure(_))));
        assert!(matches!(class.lookup("get"), Some(Value::Closure(_))));
        assert!(matches!(class.lookup("$init"), Some(Value::Closure(_))));
    }

    #[test]
    fn test_static_members_live_on_the_metaclass() {
        let function = compile_source("class C { static var s; var a; }");
        let chunk = function.chunk().unwrap();
        let class = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Class(class) => Some(class.clone()),
                _ => None,
            })
            .expect("class constant");
        let metaclass = class.metaclass.as_ref().unwrap();
        assert_eq!(metaclass.lookup("s"), Some(Value::Int(0)));
        assert!(class.lookup("s").is_none());
        assert!(matches!(metaclass.lookup("$init"), Some(Value::Closure(_))));
    }

    #[test]
    fn test_list_literal_too_large() {
        let items = vec!["0"; 300].join(",");
        let source = format!("var a = [{}];", items);
        let (tokens, _) = Lexer::new(source.as_str()).tokenize();
        let mut parser = Parser::new(tokens, source.as_str());
        let (mut program, diags) = parser.parse();
        assert!(diags.is_empty());
        Resolver::new(&source).resolve(&mut program).expect("resolve");
        let core = CoreLib::new();
        let err = Compiler::new(&core, source.as_str())
            .compile(&program)
            .unwrap_err();
        assert!(err.iter().any(|d| d.code == "ML4002"));
    }
}
