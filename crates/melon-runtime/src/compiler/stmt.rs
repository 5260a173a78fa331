//! Statement emission

use super::{ClassCtx, Compiler, EmitContext, FunctionCtx};
use crate::ast::*;
use crate::bytecode::Opcode;
use crate::span::Span;
use crate::value::{Class, Closure, Function, Value};
use std::rc::Rc;

impl Compiler {
    /// Emit a statement
    pub(super) fn emit_stmt(&mut self, stmt: &Stmt) {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::VarDecl(decl) => self.emit_var_decl(decl, span),
            StmtKind::ClassDecl(class) => self.emit_class_decl(class, span),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.emit_if(cond, then_branch, else_branch.as_deref(), span),
            StmtKind::While { cond, body } => self.emit_while(cond, body),
            StmtKind::For {
                init,
                cond,
                inc,
                body,
            } => self.emit_for(init, cond, inc, body),
            StmtKind::ForIn(forin) => self.emit_forin(forin, span),
            StmtKind::Return(expr) => match expr {
                Some(expr) => {
                    self.emit_expr(expr);
                    self.chunk().emit(Opcode::Return);
                }
                None => self.chunk().emit(Opcode::Return0),
            },
            StmtKind::Expr(expr) => self.emit_expr(expr),
        }
    }

    /// Emit a local or global variable declaration
    fn emit_var_decl(&mut self, decl: &VarDecl, span: Span) {
        match &decl.init {
            Some(init) => self.emit_expr(init),
            None => {
                let idx = self.constant(Value::Null, span);
                self.chunk().emit_with(Opcode::LoadConst, idx);
            }
        }
        self.emit_loadstore(decl.slot.location, decl.slot.idx, true, span);
    }

    /// Emit a class declaration
    ///
    /// Builds the class value (with its metaclass), emits every member into
    /// the right `$init`, finishes the `$init` tails, and stores the class
    /// into its global slot.
    fn emit_class_decl(&mut self, decl: &ClassDecl, span: Span) {
        let metaclass = Rc::new(Class::new(
            format!("{} metaclass", decl.name),
            decl.num_staticvars,
            Some(self.object_class.clone()),
        ));
        let class = Rc::new(Class::with_meta(
            decl.name.clone(),
            decl.num_instvars,
            Some(self.object_class.clone()),
            metaclass.clone(),
        ));

        let meta_init = (decl.num_staticvars > 0).then(|| FunctionCtx::new("$init"));
        self.contexts.push(EmitContext::Class(ClassCtx {
            class: class.clone(),
            metaclass: metaclass.clone(),
            init: Some(FunctionCtx::new("$init")),
            meta_init,
            emitting_static: false,
        }));

        for member in &decl.members {
            if let StmtKind::VarDecl(member_decl) = &member.kind {
                self.emit_class_member(member_decl, member.span);
            }
        }

        let Some(EmitContext::Class(class_ctx)) = self.contexts.pop() else {
            unreachable!("class context missing after member emission");
        };

        // $init tail: load the receiver, forward to $construct if the
        // class has one, and return the receiver
        let mut init = class_ctx.init.expect("class $init context");
        init.chunk.emit_with(Opcode::LoadLocal, 0);
        if let Some(ctor_idx) = decl.constructor {
            if let StmtKind::VarDecl(ctor) = &decl.members[ctor_idx].kind {
                let nparams = match &ctor.init {
                    Some(Expr {
                        kind: ExprKind::Func(func),
                        ..
                    }) => func.params.len(),
                    _ => 0,
                };
                init.chunk.emit_with(Opcode::LoadInt, ctor.slot.idx as u8);
                init.chunk.emit_with(Opcode::LoadField, 1);
                for param in 0..nparams {
                    init.chunk.emit_with(Opcode::LoadLocal, (param + 1) as u8);
                }
                init.chunk.emit_with(Opcode::Call, (1 + nparams) as u8);
                init.chunk.emit_with(Opcode::LoadLocal, 0);
            }
        }
        init.chunk.emit(Opcode::Return);
        let init_fn = Rc::new(Function::melon(init.name, init.chunk, 0));
        class.bind("$init", Value::Closure(Rc::new(Closure::new(init_fn))));

        if let Some(mut meta_init) = class_ctx.meta_init {
            meta_init.chunk.emit_with(Opcode::LoadLocal, 0);
            meta_init.chunk.emit(Opcode::Return);
            let meta_fn = Rc::new(Function::melon(meta_init.name, meta_init.chunk, 0));
            metaclass.bind("$init", Value::Closure(Rc::new(Closure::new(meta_fn))));
        }

        self.store_decl(Value::Class(class), &[], span);
        self.emit_loadstore(VarLocation::Global, decl.slot.idx, true, span);
    }

    /// Emit one class member
    ///
    /// Binds the member name to its slot index in the (meta)class table,
    /// then emits the initializer (if any) into the matching `$init`
    /// followed by the store into the member's slot.
    fn emit_class_member(&mut self, decl: &VarDecl, span: Span) {
        let Some(EmitContext::Class(class_ctx)) = self.contexts.last() else {
            return;
        };
        let target = if decl.is_static {
            class_ctx.metaclass.clone()
        } else {
            class_ctx.class.clone()
        };
        target.bind(&decl.name, Value::Int(decl.slot.idx as i32));

        let Some(init_expr) = &decl.init else {
            return;
        };
        if decl.slot.idx > u8::MAX as u16 {
            self.error("ML4003", "Too many class members", span);
            return;
        }

        // route emission into the class $init or the metaclass $init
        let Some(EmitContext::Class(class_ctx)) = self.contexts.last_mut() else {
            return;
        };
        class_ctx.emitting_static = decl.is_static;
        let taken = if decl.is_static {
            class_ctx.meta_init.take()
        } else {
            class_ctx.init.take()
        };
        let Some(init_ctx) = taken else {
            return;
        };

        self.contexts.push(EmitContext::Function(init_ctx));
        self.emit_expr(init_expr);
        let Some(EmitContext::Function(mut init_ctx)) = self.contexts.pop() else {
            unreachable!("init context missing after member emission");
        };

        // store the initializer value into the member's slot
        init_ctx.chunk.emit_with(Opcode::LoadLocal, 0);
        init_ctx.chunk.emit_with(Opcode::LoadInt, decl.slot.idx as u8);
        init_ctx.chunk.emit(Opcode::StoreField);

        let Some(EmitContext::Class(class_ctx)) = self.contexts.last_mut() else {
            return;
        };
        if decl.is_static {
            class_ctx.meta_init = Some(init_ctx);
        } else {
            class_ctx.init = Some(init_ctx);
        }
    }

    fn emit_if(
        &mut self,
        cond: &Expr,
        then_branch: &[Stmt],
        else_branch: Option<&[Stmt]>,
        _span: Span,
    ) {
        self.emit_expr(cond);
        let jif = self.chunk().emit_jump(Opcode::JumpIfFalse);

        for stmt in then_branch {
            self.emit_stmt(stmt);
        }

        match else_branch {
            Some(else_branch) => {
                // the false branch lands past the jump over the else block
                let past_jump = self.chunk().current_offset() + 3;
                self.chunk().patch_jump_to(jif, past_jump);
                let jmp = self.chunk().emit_jump(Opcode::Jump);
                for stmt in else_branch {
                    self.emit_stmt(stmt);
                }
                self.chunk().patch_jump(jmp);
            }
            None => self.chunk().patch_jump(jif),
        }
    }

    fn emit_while(&mut self, cond: &Expr, body: &[Stmt]) {
        let loop_start = self.chunk().current_offset();
        self.emit_expr(cond);
        let jif = self.chunk().emit_jump(Opcode::JumpIfFalse);

        for stmt in body {
            self.emit_stmt(stmt);
        }

        self.chunk().emit_loop(loop_start);
        self.chunk().patch_jump(jif);
    }

    fn emit_for(&mut self, init: &Stmt, cond: &Expr, inc: &Expr, body: &[Stmt]) {
        self.emit_stmt(init);

        let loop_start = self.chunk().current_offset();
        self.emit_expr(cond);
        let jif = self.chunk().emit_jump(Opcode::JumpIfFalse);

        for stmt in body {
            self.emit_stmt(stmt);
        }
        self.emit_expr(inc);

        self.chunk().emit_loop(loop_start);
        self.chunk().patch_jump(jif);
    }

    /// Emit a for-in loop, lowered to the iterator protocol:
    ///
    /// ```text
    /// it = target.iterate(null)
    /// while it { x = target.iteratorValue(it); body; it = target.iterate(it) }
    /// ```
    fn emit_forin(&mut self, forin: &ForIn, span: Span) {
        let iterate_key = self.constant(Value::string("iterate"), span);
        let value_key = self.constant(Value::string("iteratorValue"), span);
        let null_key = self.constant(Value::Null, span);

        // loop variable declaration plus two reserved stack slots for the
        // synthetic target/iterator locals
        self.emit_var_decl(&forin.decl, span);
        self.chunk().emit_with(Opcode::LoadConst, null_key);
        self.chunk().emit_with(Opcode::LoadConst, null_key);

        // target = <iterable>; it = target.iterate()
        self.emit_expr(&forin.iterable);
        self.emit_loadstore(forin.loc, forin.target_slot, true, span);
        self.emit_loadstore(forin.loc, forin.target_slot, false, span);
        self.chunk().emit_with(Opcode::LoadConst, iterate_key);
        self.chunk().emit_with(Opcode::LoadField, 1);
        self.chunk().emit_with(Opcode::Call, 1);
        self.emit_loadstore(forin.loc, forin.iter_slot, true, span);

        // while it
        let loop_start = self.chunk().current_offset();
        self.emit_loadstore(forin.loc, forin.iter_slot, false, span);
        let jif = self.chunk().emit_jump(Opcode::JumpIfFalse);

        // x = target.iteratorValue(it)
        self.emit_loadstore(forin.loc, forin.target_slot, false, span);
        self.chunk().emit_with(Opcode::LoadConst, value_key);
        self.chunk().emit_with(Opcode::LoadField, 1);
        self.emit_loadstore(forin.loc, forin.iter_slot, false, span);
        self.chunk().emit_with(Opcode::Call, 2);
        self.emit_loadstore(forin.decl.slot.location, forin.decl.slot.idx, true, span);

        for stmt in &forin.body {
            self.emit_stmt(stmt);
        }

        // it = target.iterate(it)
        self.emit_loadstore(forin.loc, forin.target_slot, false, span);
        self.chunk().emit_with(Opcode::LoadConst, iterate_key);
        self.chunk().emit_with(Opcode::LoadField, 1);
        self.emit_loadstore(forin.loc, forin.iter_slot, false, span);
        self.chunk().emit_with(Opcode::Call, 2);
        self.emit_loadstore(forin.loc, forin.iter_slot, true, span);

        self.chunk().emit_loop(loop_start);
        self.chunk().patch_jump(jif);
    }
}
