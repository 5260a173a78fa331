//! Semantic resolver (two-pass name resolution)
//!
//! Pass 1 walks only the top-level block and registers every declared
//! variable, function and class in the globals table (core-library names
//! are pre-registered first, so native globals occupy the lowest slots).
//! Class declarations also get a per-class member table, and members named
//! after their class are renamed to `$construct`.
//!
//! Pass 2 walks the whole tree with a context stack of root / function /
//! class scopes, classifying every reference as Global, Local, Upvalue or
//! ClassMember and filling the slot index on the node. Upvalue captures
//! are threaded through every intervening function: each one registers the
//! capture in its own list, direct only in the function immediately inside
//! the declaring one, and deeper entries reference the next-outer
//! function's upvalue slot.
//!
//! Errors accumulate and do not abort the walk, so several are reported
//! per run.

use crate::ast::*;
use crate::diagnostic::Diagnostic;
use crate::span::Span;
use crate::stdlib;
use crate::symbol::{SymbolTable, MAX_LOCALS};

/// Summary of a successful resolution
#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    /// Number of global slots the program needs (core natives included)
    pub global_count: usize,
}

/// What kind of scope a context entry represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextKind {
    Root,
    Function,
    Class,
}

/// One entry of the resolution context stack
struct Context {
    kind: ContextKind,
    table: SymbolTable,
    /// Upvalue captures (function contexts only)
    upvalues: Vec<UpvalueSpec>,
    /// Member slot counters (class contexts only)
    num_instvars: u16,
    num_staticvars: u16,
}

impl Context {
    fn new(kind: ContextKind, table: SymbolTable) -> Self {
        Self {
            kind,
            table,
            upvalues: Vec::new(),
            num_instvars: 0,
            num_staticvars: 0,
        }
    }
}

/// Two-pass semantic resolver
pub struct Resolver<'src> {
    source: &'src str,
    diagnostics: Vec<Diagnostic>,
    contexts: Vec<Context>,
}

impl<'src> Resolver<'src> {
    /// Create a resolver for a program compiled from `source`
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            diagnostics: Vec::new(),
            contexts: Vec::new(),
        }
    }

    /// Resolve the program in place
    ///
    /// On success returns the global slot count; on failure returns every
    /// accumulated diagnostic.
    pub fn resolve(&mut self, program: &mut Program) -> Result<Resolution, Vec<Diagnostic>> {
        let mut globals = SymbolTable::new();
        for name in stdlib::GLOBAL_NAMES {
            globals.add_local(*name);
        }

        self.declare_globals(program, &mut globals);
        if !self.diagnostics.is_empty() {
            return Err(std::mem::take(&mut self.diagnostics));
        }

        self.contexts.push(Context::new(ContextKind::Root, globals));
        for stmt in &mut program.body {
            self.resolve_stmt(stmt);
        }
        let root = self.contexts.pop().expect("root context");

        if self.diagnostics.is_empty() {
            Ok(Resolution {
                global_count: root.table.local_count(),
            })
        } else {
            Err(std::mem::take(&mut self.diagnostics))
        }
    }

    // === Pass 1: global declarations ===

    fn declare_globals(&mut self, program: &mut Program, globals: &mut SymbolTable) {
        for stmt in &mut program.body {
            match &mut stmt.kind {
                StmtKind::VarDecl(decl) => {
                    let what = match decl.init {
                        Some(Expr {
                            kind: ExprKind::Func(_),
                            ..
                        }) => "Function",
                        _ => "Variable",
                    };
                    if globals.lookup(&decl.name).is_some() {
                        self.duplicate_error(what, &decl.name, decl.span);
                        continue;
                    }
                    decl.slot = Slot {
                        location: VarLocation::Global,
                        idx: globals.add_local(&decl.name),
                    };
                }
                StmtKind::ClassDecl(class) => {
                    if globals.lookup(&class.name).is_some() {
                        self.duplicate_error("Class", &class.name, class.span);
                        continue;
                    }
                    class.slot = Slot {
                        location: VarLocation::Global,
                        idx: globals.add_local(&class.name),
                    };
                    self.declare_class_members(class);
                }
                _ => {}
            }
        }
    }

    /// Build the per-class member table and rename the constructor
    fn declare_class_members(&mut self, class: &mut ClassDecl) {
        let mut table = SymbolTable::new();
        for member in &mut class.members {
            let span = member.span;
            match &mut member.kind {
                StmtKind::VarDecl(decl) => {
                    // a member function named after the class is the
                    // constructor, stored as `$construct`
                    if decl.name == class.name {
                        if let Some(Expr {
                            kind: ExprKind::Func(func),
                            ..
                        }) = &mut decl.init
                        {
                            decl.name = "$construct".to_string();
                            func.name = "$construct".to_string();
                        }
                    }
                    table.add_local(&decl.name);
                }
                _ => {
                    self.error(
                        "ML3003",
                        "Class declarations must be a variable or function",
                        span,
                    );
                }
            }
        }
        class.member_table = table;
    }

    // === Pass 2: local resolution ===

    fn resolve_stmt(&mut self, stmt: &mut Stmt) {
        let span = stmt.span;
        match &mut stmt.kind {
            StmtKind::VarDecl(decl) => self.resolve_var_decl(decl),
            StmtKind::ClassDecl(class) => self.resolve_class_decl(class),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.resolve_expr(cond);
                self.resolve_block(then_branch);
                if let Some(else_branch) = else_branch {
                    self.resolve_block(else_branch);
                }
            }
            StmtKind::While { cond, body } => {
                self.enter_scope();
                self.resolve_expr(cond);
                self.resolve_block(body);
                self.exit_scope(span);
            }
            StmtKind::For {
                init,
                cond,
                inc,
                body,
            } => {
                self.enter_scope();
                self.resolve_stmt(init);
                self.resolve_expr(cond);
                self.resolve_expr(inc);
                self.resolve_block(body);
                self.exit_scope(span);
            }
            StmtKind::ForIn(forin) => self.resolve_forin(forin, span),
            StmtKind::Return(expr) => {
                if let Some(expr) = expr {
                    self.resolve_expr(expr);
                }
            }
            StmtKind::Expr(expr) => self.resolve_expr(expr),
        }
    }

    fn resolve_block(&mut self, stmts: &mut [Stmt]) {
        self.enter_scope();
        for stmt in &mut *stmts {
            self.resolve_stmt(stmt);
        }
        let span = stmts.first().map(|s| s.span).unwrap_or_else(Span::dummy);
        self.exit_scope(span);
    }

    fn resolve_var_decl(&mut self, decl: &mut VarDecl) {
        if let Some(init) = &mut decl.init {
            self.resolve_expr(init);
        }

        let context = self.contexts.last_mut().expect("context");
        match context.kind {
            ContextKind::Class => {
                // class members are slotted by resolve_class_decl before
                // their initializers are walked; nothing to do here
            }
            ContextKind::Function => {
                if context.table.lookup(&decl.name).is_some() {
                    self.duplicate_error("Variable", &decl.name, decl.span);
                    return;
                }
                let context = self.contexts.last_mut().expect("context");
                decl.slot = Slot {
                    location: VarLocation::Local,
                    idx: context.table.add_local(&decl.name),
                };
            }
            ContextKind::Root => {
                // outermost declarations were already registered by pass 1;
                // declarations in nested top-level scopes become globals here
                if context.table.is_global() {
                    return;
                }
                if context.table.lookup(&decl.name).is_some() {
                    self.duplicate_error("Variable", &decl.name, decl.span);
                    return;
                }
                let context = self.contexts.last_mut().expect("context");
                decl.slot = Slot {
                    location: VarLocation::Global,
                    idx: context.table.add_local(&decl.name),
                };
            }
        }
    }

    fn resolve_class_decl(&mut self, class: &mut ClassDecl) {
        // pass 1 only registers top-level classes; anywhere else the class
        // has no global slot to land in
        if class.slot.location == VarLocation::Unresolved {
            self.error(
                "ML3005",
                "Classes may only be declared at the top level",
                class.span,
            );
            return;
        }

        let table = std::mem::take(&mut class.member_table);
        self.contexts.push(Context::new(ContextKind::Class, table));

        // assign every member its instance or static slot up front, so
        // method bodies can reference members declared after them
        for member in &mut class.members {
            let StmtKind::VarDecl(decl) = &mut member.kind else {
                continue;
            };
            let context = self.contexts.last_mut().expect("class context");
            let idx = if decl.is_static {
                let idx = context.num_staticvars;
                context.num_staticvars += 1;
                idx
            } else {
                let idx = context.num_instvars;
                context.num_instvars += 1;
                idx
            };
            decl.slot = Slot {
                location: VarLocation::ClassMember,
                idx,
            };
            context.table.set_index(&decl.name, idx);
        }

        // now walk the initializers (method bodies included)
        for member in &mut class.members {
            let StmtKind::VarDecl(decl) = &mut member.kind else {
                continue;
            };
            if let Some(init) = &mut decl.init {
                self.resolve_expr(init);
            }
        }

        let context = self.contexts.pop().expect("class context");
        class.member_table = context.table;
        class.num_instvars = context.num_instvars;
        class.num_staticvars = context.num_staticvars;

        class.constructor = class.members.iter().position(|member| {
            matches!(
                &member.kind,
                StmtKind::VarDecl(VarDecl {
                    name,
                    init: Some(Expr {
                        kind: ExprKind::Func(_),
                        ..
                    }),
                    ..
                }) if name == "$construct"
            )
        });
    }

    fn resolve_func(&mut self, func: &mut FuncDecl, span: Span) {
        let mut table = SymbolTable::new();
        table.enter_scope();

        // methods get the implicit receiver in slot 0
        if self.contexts.last().map(|c| c.kind) == Some(ContextKind::Class) {
            table.add_local("$object");
        }
        for param in &func.params {
            table.add_local(&param.name);
        }

        self.contexts
            .push(Context::new(ContextKind::Function, table));
        for stmt in &mut func.body {
            self.resolve_stmt(stmt);
        }
        let mut context = self.contexts.pop().expect("function context");

        let nlocals = context.table.exit_scope();
        if nlocals > MAX_LOCALS {
            self.error(
                "ML3004",
                format!(
                    "Maximum number of local variables reached in function {}",
                    func.name
                ),
                span,
            );
        }
        func.upvalues = std::mem::take(&mut context.upvalues);
    }

    fn resolve_forin(&mut self, forin: &mut ForIn, span: Span) {
        self.enter_scope();

        self.resolve_var_decl(&mut forin.decl);
        self.resolve_expr(&mut forin.iterable);

        // two synthetic locals hold the iterable and the iterator state
        let context = self.contexts.last_mut().expect("context");
        let tag = context.table.local_count();
        forin.target_slot = context.table.add_local(format!("$target_{}", tag));
        forin.iter_slot = context.table.add_local(format!("$iterator_{}", tag));
        forin.loc = match context.kind {
            ContextKind::Root => VarLocation::Global,
            _ => VarLocation::Local,
        };

        self.resolve_block(&mut forin.body);
        self.exit_scope(span);
    }

    // === Expressions ===

    fn resolve_expr(&mut self, expr: &mut Expr) {
        let span = expr.span;
        match &mut expr.kind {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Bool(_) | ExprKind::Str(_) => {}
            ExprKind::Var(var) => self.resolve_var_ref(var, span),
            ExprKind::Unary { operand, .. } => self.resolve_expr(operand),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.resolve_expr(lhs);
                self.resolve_expr(rhs);
            }
            ExprKind::Assign { target, value } => {
                self.resolve_expr(value);
                self.resolve_expr(target);
            }
            ExprKind::Postfix { target, chain } => {
                for item in chain.iter_mut() {
                    match item {
                        PostfixItem::Call(args) => {
                            for arg in args {
                                self.resolve_expr(arg);
                            }
                        }
                        PostfixItem::Index(index) => self.resolve_expr(index),
                        PostfixItem::Field { .. } => {}
                    }
                }
                self.resolve_expr(target);
            }
            ExprKind::Array(items) => {
                for item in items {
                    self.resolve_expr(item);
                }
            }
            ExprKind::Range { start, end } => {
                self.check_range_endpoint(start);
                self.check_range_endpoint(end);
                self.resolve_expr(start);
                self.resolve_expr(end);
            }
            ExprKind::Func(func) => self.resolve_func(func, span),
        }
    }

    fn check_range_endpoint(&mut self, expr: &Expr) {
        match expr.kind {
            ExprKind::Float(_) | ExprKind::Bool(_) | ExprKind::Str(_) => {
                self.error(
                    "ML3006",
                    "Range endpoints must be integers",
                    expr.span,
                );
            }
            _ => {}
        }
    }

    /// Classify a variable reference against the context stack
    fn resolve_var_ref(&mut self, var: &mut VarRef, span: Span) {
        let mut funcs_traversed = 0u16;

        for ci in (0..self.contexts.len()).rev() {
            let kind = self.contexts[ci].kind;
            if kind == ContextKind::Function {
                funcs_traversed += 1;
            }

            let Some(decl) = self.contexts[ci].table.lookup(&var.name) else {
                continue;
            };

            match kind {
                ContextKind::Root => {
                    var.slot = Slot {
                        location: VarLocation::Global,
                        idx: decl.idx,
                    };
                }
                ContextKind::Function => {
                    if funcs_traversed > 1 {
                        var.slot = Slot {
                            location: VarLocation::Upvalue,
                            idx: self.thread_upvalue(ci, decl.idx, &var.name),
                        };
                    } else {
                        var.slot = Slot {
                            location: VarLocation::Local,
                            idx: decl.idx,
                        };
                    }
                }
                ContextKind::Class => {
                    var.slot = Slot {
                        location: VarLocation::ClassMember,
                        idx: decl.idx,
                    };
                }
            }
            return;
        }

        self.error(
            "ML3002",
            format!("Undeclared identifier {}", var.name),
            span,
        );
    }

    /// Register an upvalue capture in every function between the declaring
    /// context and the current one, outermost first
    ///
    /// The function immediately inside the declaring one captures directly
    /// from the declaring function's locals; every deeper function captures
    /// the next-outer function's upvalue slot. Returns the innermost slot.
    fn thread_upvalue(&mut self, declaring_ci: usize, local_idx: u16, name: &str) -> u16 {
        let mut idx = local_idx;
        let mut is_direct = true;
        let mut innermost = 0;

        for ci in declaring_ci + 1..self.contexts.len() {
            if self.contexts[ci].kind != ContextKind::Function {
                continue;
            }
            innermost = add_upvalue(&mut self.contexts[ci].upvalues, name, is_direct, idx);
            idx = innermost;
            is_direct = false;
        }

        innermost
    }

    // === Scope helpers ===

    fn enter_scope(&mut self) {
        self.contexts
            .last_mut()
            .expect("context")
            .table
            .enter_scope();
    }

    fn exit_scope(&mut self, span: Span) {
        let context = self.contexts.last_mut().expect("context");
        let nlocals = context.table.exit_scope();
        if context.kind == ContextKind::Function && nlocals > MAX_LOCALS {
            self.error("ML3004", "Maximum number of local variables reached", span);
        }
    }

    // === Diagnostics ===

    fn duplicate_error(&mut self, what: &str, name: &str, span: Span) {
        self.error(
            "ML3001",
            format!("{} {} is already defined", what, name),
            span,
        );
    }

    fn error(&mut self, code: &str, message: impl Into<String>, span: Span) {
        self.diagnostics.push(
            Diagnostic::error_with_code(code, message, span).with_location(self.source, span),
        );
    }
}

/// Add a capture to a function's upvalue list, deduplicating by name
fn add_upvalue(upvalues: &mut Vec<UpvalueSpec>, name: &str, is_direct: bool, idx: u16) -> u16 {
    if let Some(pos) = upvalues.iter().position(|u| u.name == name) {
        return pos as u16;
    }
    upvalues.push(UpvalueSpec {
        is_direct,
        idx,
        name: name.to_string(),
    });
    (upvalues.len() - 1) as u16
}
