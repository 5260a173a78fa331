//! Expression emission

use super::{Compiler, EmitContext, FunctionCtx};
use crate::ast::*;
use crate::bytecode::Opcode;
use crate::span::Span;
use crate::value::Value;

/// Largest integer literal emitted inline via `LoadInt`
const MAX_LITERAL_INT: i32 = 256;

impl Compiler {
    /// Emit an expression, leaving its value on the stack
    pub(super) fn emit_expr(&mut self, expr: &Expr) {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Int(value) => {
                if (0..MAX_LITERAL_INT).contains(value) {
                    self.chunk().emit_with(Opcode::LoadInt, *value as u8);
                } else {
                    let idx = self.constant(Value::Int(*value), span);
                    self.chunk().emit_with(Opcode::LoadConst, idx);
                }
            }
            ExprKind::Float(value) => {
                let idx = self.constant(Value::Float(*value), span);
                self.chunk().emit_with(Opcode::LoadConst, idx);
            }
            ExprKind::Bool(value) => {
                let idx = self.constant(Value::Bool(*value), span);
                self.chunk().emit_with(Opcode::LoadConst, idx);
            }
            ExprKind::Str(value) => {
                let idx = self.constant(Value::string(value.clone()), span);
                self.chunk().emit_with(Opcode::LoadConst, idx);
            }
            ExprKind::Var(var) => self.emit_var_ref(var, false, span),
            ExprKind::Unary { op, operand } => {
                self.emit_expr(operand);
                let opcode = match op {
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::Neg => Opcode::Neg,
                };
                self.chunk().emit(opcode);
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.emit_expr(lhs);
                self.emit_expr(rhs);
                self.chunk().emit(binary_opcode(*op));
            }
            ExprKind::Assign { target, value } => {
                self.emit_expr(value);
                match &target.kind {
                    ExprKind::Var(var) => self.emit_var_ref(var, true, span),
                    ExprKind::Postfix { target, chain } => {
                        self.emit_postfix(target, chain, true, span)
                    }
                    _ => self.error("ML4005", "Internal error: invalid assignment target", span),
                }
            }
            ExprKind::Postfix { target, chain } => self.emit_postfix(target, chain, false, span),
            ExprKind::Array(items) => {
                if items.len() > u8::MAX as usize {
                    self.error("ML4002", "List size is greater than max [255]", span);
                    return;
                }
                for item in items {
                    self.emit_expr(item);
                }
                self.chunk().emit_with(Opcode::NewArray, items.len() as u8);
            }
            ExprKind::Range { start, end } => {
                self.emit_expr(start);
                self.emit_expr(end);
                self.chunk().emit(Opcode::NewRange);
            }
            ExprKind::Func(func) => self.emit_func(func, span),
        }
    }

    /// Emit a variable load or store according to its resolved location
    ///
    /// Class members first load the implicit receiver and the member's
    /// slot index, then go through the field protocol.
    pub(super) fn emit_var_ref(&mut self, var: &VarRef, store: bool, span: Span) {
        if var.slot.location == VarLocation::ClassMember {
            if var.slot.idx > u8::MAX as u16 {
                self.error("ML4003", "Too many class members", span);
                return;
            }
            self.chunk().emit_with(Opcode::LoadLocal, 0);
            self.chunk().emit_with(Opcode::LoadInt, var.slot.idx as u8);
        }
        self.emit_loadstore(var.slot.location, var.slot.idx, store, span);
    }

    /// Emit a postfix chain
    ///
    /// A field access immediately followed by a call is a method load
    /// (`LoadField 1`): the receiver stays on the stack beneath the
    /// arguments and is counted into the call's argument count. When the
    /// chain is an assignment target, its last element stores instead of
    /// loading.
    fn emit_postfix(&mut self, target: &Expr, chain: &[PostfixItem], is_assign: bool, span: Span) {
        self.emit_expr(target);

        let len = chain.len();
        for (i, item) in chain.iter().enumerate() {
            match item {
                PostfixItem::Call(args) => {
                    let is_method =
                        i > 0 && matches!(chain[i - 1], PostfixItem::Field { .. });
                    for arg in args {
                        self.emit_expr(arg);
                    }
                    let mut nargs = args.len();
                    if is_method {
                        nargs += 1;
                    }
                    if nargs > u8::MAX as usize {
                        self.error("ML4004", "Too many call arguments", span);
                        return;
                    }
                    self.chunk().emit_with(Opcode::Call, nargs as u8);
                }
                PostfixItem::Field { name, span: field_span } => {
                    let is_method =
                        i + 1 < len && matches!(chain[i + 1], PostfixItem::Call(_));
                    let key = self.constant(Value::string(name.clone()), *field_span);
                    self.chunk().emit_with(Opcode::LoadConst, key);
                    if is_assign && i == len - 1 {
                        self.chunk().emit(Opcode::StoreField);
                    } else {
                        self.chunk()
                            .emit_with(Opcode::LoadField, is_method as u8);
                    }
                }
                PostfixItem::Index(index) => {
                    self.emit_expr(index);
                    if is_assign && i == len - 1 {
                        self.chunk().emit(Opcode::StoreAt);
                    } else {
                        self.chunk().emit(Opcode::LoadAt);
                    }
                }
            }
        }
    }

    /// Emit a function declaration or expression
    ///
    /// The body compiles into a fresh context; the resulting closure value
    /// lands in the outer context via [`Compiler::store_decl`], followed by
    /// its upvalue construction sequence.
    pub(super) fn emit_func(&mut self, func: &FuncDecl, span: Span) {
        if func.upvalues.len() > u8::MAX as usize {
            self.error("ML4005", "Too many captured variables", span);
            return;
        }

        self.contexts
            .push(EmitContext::Function(FunctionCtx::new(&func.name)));
        for stmt in &func.body {
            self.emit_stmt(stmt);
        }
        // bodies not ending in an explicit return fall through to RET0;
        // a return nested in a branch still needs the fallthrough
        let body_returns = matches!(
            func.body.last(),
            Some(Stmt {
                kind: StmtKind::Return(Some(_)),
                ..
            })
        );
        if !body_returns {
            self.chunk().emit(Opcode::Return0);
        }
        let Some(EmitContext::Function(ctx)) = self.contexts.pop() else {
            unreachable!("function context missing after body emission");
        };

        let value = Self::finish_function(ctx, func.upvalues.len() as u8);
        self.store_decl(value, &func.upvalues, span);
    }
}

/// Map a binary operator to its opcode
fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Le => Opcode::Lte,
        BinaryOp::Ge => Opcode::Gte,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Neq,
    }
}
