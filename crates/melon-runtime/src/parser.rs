//! Parsing (tokens to AST)
//!
//! Statements are parsed by recursive descent; expressions by precedence
//! climbing with the original Melon precedence ladder:
//! assignment < `||` < `&&` < comparison < term < factor < unary < postfix.
//!
//! Two desugarings happen here:
//! - compound assignment (`x += e`) becomes a plain assignment whose value
//!   is a binary expression over a *clone* of the target;
//! - named `func`/`operator` declarations become `var` declarations whose
//!   initializer is a function expression (`operator +` binds `$add`, etc).

use crate::ast::*;
use crate::diagnostic::Diagnostic;
use crate::span::Span;
use crate::token::{Token, TokenKind};

/// Expression precedence levels, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Assign,
    Or,
    And,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
}

/// Parser state for building an AST from tokens
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    source: String,
    diagnostics: Vec<Diagnostic>,
}

impl Parser {
    /// Create a new parser for the given tokens
    ///
    /// `source` is kept for diagnostic snippets.
    pub fn new(tokens: Vec<Token>, source: impl Into<String>) -> Self {
        let mut tokens = tokens;
        if tokens.is_empty() {
            tokens.push(Token::new(TokenKind::Eof, "", Span::dummy()));
        }
        Self {
            tokens,
            current: 0,
            source: source.into(),
            diagnostics: Vec::new(),
        }
    }

    /// Parse tokens into a program, accumulating diagnostics
    pub fn parse(&mut self) -> (Program, Vec<Diagnostic>) {
        let mut body = Vec::new();

        while !self.check(&TokenKind::Eof) {
            match self.parse_decl() {
                Some(stmt) => body.push(stmt),
                None => self.synchronize(),
            }
        }

        (Program { body }, std::mem::take(&mut self.diagnostics))
    }

    // === Declarations ===

    /// Parse a declaration or fall through to a statement
    fn parse_decl(&mut self) -> Option<Stmt> {
        let is_static = self.match_kind(&TokenKind::Static);

        if self.match_kind(&TokenKind::Var) {
            return self.parse_var_decl(is_static);
        }
        if self.match_kind(&TokenKind::Func) {
            return self.parse_func_decl(is_static, false);
        }
        if self.match_kind(&TokenKind::Operator) {
            return self.parse_func_decl(is_static, true);
        }
        if self.match_kind(&TokenKind::Class) {
            return self.parse_class_decl();
        }

        if is_static {
            self.error_here("ML2001", "'static' must be followed by 'var' or 'func'");
            return None;
        }
        self.parse_stmt()
    }

    fn parse_var_decl(&mut self, is_static: bool) -> Option<Stmt> {
        let name_token = self.expect_ident("variable")?;
        let span = name_token.span;
        let name = ident_name(&name_token);

        let init = if self.match_kind(&TokenKind::Equal) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.match_kind(&TokenKind::Semicolon);

        Some(Stmt {
            kind: StmtKind::VarDecl(VarDecl {
                name,
                is_static,
                init,
                slot: Slot::default(),
                span,
            }),
            span,
        })
    }

    /// Parse `func name(params) { … }` or `operator + (other) { … }` into a
    /// var declaration with a function-expression initializer
    fn parse_func_decl(&mut self, is_static: bool, is_operator: bool) -> Option<Stmt> {
        let (name, span) = if is_operator {
            let token = self.advance().clone();
            match token.kind.overload_name() {
                Some(name) => (name.to_string(), token.span),
                None => {
                    self.error_at(
                        "ML2003",
                        format!("{} cannot be overloaded", token.kind),
                        token.span,
                    );
                    return None;
                }
            }
        } else {
            let token = self.expect_ident("function")?;
            (ident_name(&token), token.span)
        };

        self.expect(&TokenKind::LeftParen)?;
        let params = self.parse_params()?;
        self.expect(&TokenKind::RightParen)?;
        let body = self.parse_block()?;

        let func = FuncDecl {
            name: name.clone(),
            params,
            body,
            upvalues: Vec::new(),
        };

        Some(Stmt {
            kind: StmtKind::VarDecl(VarDecl {
                name,
                is_static,
                init: Some(Expr {
                    kind: ExprKind::Func(func),
                    span,
                }),
                slot: Slot::default(),
                span,
            }),
            span,
        })
    }

    fn parse_params(&mut self) -> Option<Vec<Param>> {
        let mut params = Vec::new();
        if self.check(&TokenKind::RightParen) {
            return Some(params);
        }
        loop {
            let token = self.expect_ident("parameter")?;
            params.push(Param {
                name: ident_name(&token),
                span: token.span,
            });
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Some(params)
    }

    fn parse_class_decl(&mut self) -> Option<Stmt> {
        let name_token = self.expect_ident("class")?;
        let span = name_token.span;
        let name = ident_name(&name_token);

        let members = self.parse_block()?;

        Some(Stmt {
            kind: StmtKind::ClassDecl(ClassDecl {
                name,
                members,
                slot: Slot::default(),
                num_instvars: 0,
                num_staticvars: 0,
                constructor: None,
                member_table: crate::symbol::SymbolTable::new(),
                span,
            }),
            span,
        })
    }

    // === Statements ===

    fn parse_stmt(&mut self) -> Option<Stmt> {
        if self.match_kind(&TokenKind::If) {
            return self.parse_if();
        }
        if self.match_kind(&TokenKind::While) {
            return self.parse_while();
        }
        if self.match_kind(&TokenKind::For) {
            return self.parse_for();
        }
        if self.match_kind(&TokenKind::Return) {
            return self.parse_return();
        }
        self.parse_expr_stmt()
    }

    fn parse_if(&mut self) -> Option<Stmt> {
        let span = self.previous_span();
        self.expect(&TokenKind::LeftParen)?;
        let cond = self.parse_expression()?;
        self.expect(&TokenKind::RightParen)?;

        let then_branch = self.parse_block()?;

        let else_branch = if self.match_kind(&TokenKind::Else) {
            if self.match_kind(&TokenKind::If) {
                // else-if chains nest as a single-statement else branch
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };

        Some(Stmt {
            kind: StmtKind::If {
                cond,
                then_branch,
                else_branch,
            },
            span,
        })
    }

    fn parse_while(&mut self) -> Option<Stmt> {
        let span = self.previous_span();
        self.expect(&TokenKind::LeftParen)?;
        let cond = self.parse_expression()?;
        self.expect(&TokenKind::RightParen)?;
        let body = self.parse_block()?;

        Some(Stmt {
            kind: StmtKind::While { cond, body },
            span,
        })
    }

    fn parse_for(&mut self) -> Option<Stmt> {
        let span = self.previous_span();
        self.expect(&TokenKind::LeftParen)?;
        self.expect(&TokenKind::Var)?;
        let init = self.parse_var_decl(false)?;

        if self.match_kind(&TokenKind::In) {
            let iterable = self.parse_expression()?;
            self.expect(&TokenKind::RightParen)?;
            let body = self.parse_block()?;

            let decl = match init.kind {
                StmtKind::VarDecl(decl) => decl,
                _ => return None,
            };
            if decl.init.is_some() {
                self.error_at(
                    "ML2001",
                    "for-in loop variable cannot have an initializer",
                    decl.span,
                );
            }

            return Some(Stmt {
                kind: StmtKind::ForIn(ForIn {
                    decl,
                    iterable,
                    body,
                    loc: VarLocation::Unresolved,
                    target_slot: 0,
                    iter_slot: 0,
                }),
                span,
            });
        }

        // C-style: the declaration consumed the first `;`
        let cond = self.parse_expression()?;
        self.expect(&TokenKind::Semicolon)?;
        let inc = self.parse_expression()?;
        self.expect(&TokenKind::RightParen)?;
        let body = self.parse_block()?;

        Some(Stmt {
            kind: StmtKind::For {
                init: Box::new(init),
                cond,
                inc,
                body,
            },
            span,
        })
    }

    fn parse_return(&mut self) -> Option<Stmt> {
        let span = self.previous_span();
        let expr = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.match_kind(&TokenKind::Semicolon);

        Some(Stmt {
            kind: StmtKind::Return(expr),
            span,
        })
    }

    fn parse_expr_stmt(&mut self) -> Option<Stmt> {
        let expr = self.parse_expression()?;
        let span = expr.span;
        self.match_kind(&TokenKind::Semicolon);
        Some(Stmt {
            kind: StmtKind::Expr(expr),
            span,
        })
    }

    /// Parse a `{ … }` block of declarations
    fn parse_block(&mut self) -> Option<Vec<Stmt>> {
        self.expect(&TokenKind::LeftBrace)?;
        let mut stmts = Vec::new();

        while !self.check(&TokenKind::RightBrace) {
            if self.check(&TokenKind::Eof) {
                self.error_here("ML2002", "Unexpected end of file while parsing a block");
                return None;
            }
            match self.parse_decl() {
                Some(stmt) => stmts.push(stmt),
                None => self.synchronize(),
            }
        }

        self.expect(&TokenKind::RightBrace)?;
        Some(stmts)
    }

    // === Expressions ===

    fn parse_expression(&mut self) -> Option<Expr> {
        self.parse_precedence(Precedence::Lowest)
    }

    fn parse_precedence(&mut self, prec: Precedence) -> Option<Expr> {
        let token = self.advance().clone();
        let mut left = self.parse_prefix(token)?;

        while prec < self.peek_precedence() {
            let token = self.advance().clone();
            left = self.parse_infix(left, token)?;
        }

        Some(left)
    }

    fn parse_prefix(&mut self, token: Token) -> Option<Expr> {
        let span = token.span;
        let kind = match token.kind {
            TokenKind::Int(value) => ExprKind::Int(value),
            TokenKind::Float(value) => ExprKind::Float(value),
            TokenKind::Str(value) => ExprKind::Str(value),
            TokenKind::True => ExprKind::Bool(true),
            TokenKind::False => ExprKind::Bool(false),
            TokenKind::Ident(name) => ExprKind::Var(VarRef {
                name,
                slot: Slot::default(),
            }),
            TokenKind::LeftParen => {
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RightParen)?;
                return Some(expr);
            }
            TokenKind::LeftBracket => return self.parse_array(span),
            TokenKind::Func => return self.parse_func_expr(span),
            TokenKind::Bang => {
                let operand = self.parse_precedence(Precedence::Unary)?;
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                }
            }
            TokenKind::Minus => {
                let operand = self.parse_precedence(Precedence::Unary)?;
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                }
            }
            other => {
                self.error_at(
                    "ML2001",
                    format!("Expected an expression but found {}", other),
                    span,
                );
                return None;
            }
        };
        Some(Expr { kind, span })
    }

    fn parse_infix(&mut self, left: Expr, token: Token) -> Option<Expr> {
        let op_span = token.span;
        match token.kind {
            TokenKind::Equal => self.parse_assignment(left),
            kind if kind.is_compound_assign() => {
                let op = match kind {
                    TokenKind::PlusEqual => BinaryOp::Add,
                    TokenKind::MinusEqual => BinaryOp::Sub,
                    TokenKind::StarEqual => BinaryOp::Mul,
                    _ => BinaryOp::Div,
                };
                // desugar over a clone of the target so both sides own
                // their own subtree
                let rhs = self.parse_precedence(Precedence::Lowest)?;
                let span = left.span.merge(rhs.span);
                let value = Expr {
                    kind: ExprKind::Binary {
                        op,
                        lhs: Box::new(left.clone()),
                        rhs: Box::new(rhs),
                    },
                    span,
                };
                self.finish_assignment(left, value)
            }
            kind @ (TokenKind::Dot | TokenKind::LeftParen | TokenKind::LeftBracket) => {
                self.parse_postfix(left, kind)
            }
            TokenKind::DotDot => {
                // the end expression is greedy: `0..n-1` is `0..(n-1)`
                let end = self.parse_precedence(Precedence::Lowest)?;
                let span = left.span.merge(end.span);
                Some(Expr {
                    kind: ExprKind::Range {
                        start: Box::new(left),
                        end: Box::new(end),
                    },
                    span,
                })
            }
            kind => {
                let op = match kind {
                    TokenKind::Plus => BinaryOp::Add,
                    TokenKind::Minus => BinaryOp::Sub,
                    TokenKind::Star => BinaryOp::Mul,
                    TokenKind::Slash => BinaryOp::Div,
                    TokenKind::Percent => BinaryOp::Mod,
                    TokenKind::AmpAmp => BinaryOp::And,
                    TokenKind::PipePipe => BinaryOp::Or,
                    TokenKind::Less => BinaryOp::Lt,
                    TokenKind::Greater => BinaryOp::Gt,
                    TokenKind::LessEqual => BinaryOp::Le,
                    TokenKind::GreaterEqual => BinaryOp::Ge,
                    TokenKind::EqualEqual => BinaryOp::Eq,
                    TokenKind::BangEqual => BinaryOp::Ne,
                    other => {
                        self.error_at(
                            "ML2001",
                            format!("{} is not an infix operator", other),
                            op_span,
                        );
                        return None;
                    }
                };
                let rhs = self.parse_precedence(precedence_of(&kind))?;
                let span = left.span.merge(rhs.span);
                Some(Expr {
                    kind: ExprKind::Binary {
                        op,
                        lhs: Box::new(left),
                        rhs: Box::new(rhs),
                    },
                    span,
                })
            }
        }
    }

    fn parse_assignment(&mut self, target: Expr) -> Option<Expr> {
        // assignment is right-associative: `a = b = c` is `a = (b = c)`
        let value = self.parse_precedence(Precedence::Lowest)?;
        self.finish_assignment(target, value)
    }

    fn finish_assignment(&mut self, target: Expr, value: Expr) -> Option<Expr> {
        if !is_assignable(&target) {
            self.error_at("ML2004", "Invalid assignment target", target.span);
            return None;
        }
        let span = target.span.merge(value.span);
        Some(Expr {
            kind: ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        })
    }

    /// Parse a postfix chain starting with the operator in `kind`
    fn parse_postfix(&mut self, target: Expr, kind: TokenKind) -> Option<Expr> {
        let mut chain = Vec::new();
        let mut kind = kind;

        loop {
            let item = match kind {
                TokenKind::Dot => {
                    let name_token = self.expect_ident("member")?;
                    PostfixItem::Field {
                        name: ident_name(&name_token),
                        span: name_token.span,
                    }
                }
                TokenKind::LeftParen => {
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RightParen) {
                        loop {
                            args.push(self.parse_expression()?);
                            if !self.match_kind(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&TokenKind::RightParen)?;
                    PostfixItem::Call(args)
                }
                TokenKind::LeftBracket => {
                    let index = self.parse_expression()?;
                    self.expect(&TokenKind::RightBracket)?;
                    PostfixItem::Index(Box::new(index))
                }
                _ => break,
            };
            chain.push(item);

            if self.match_kind(&TokenKind::Dot) {
                kind = TokenKind::Dot;
            } else if self.match_kind(&TokenKind::LeftParen) {
                kind = TokenKind::LeftParen;
            } else if self.match_kind(&TokenKind::LeftBracket) {
                kind = TokenKind::LeftBracket;
            } else {
                break;
            }
        }

        let span = target.span.merge(self.previous_span());
        Some(Expr {
            kind: ExprKind::Postfix {
                target: Box::new(target),
                chain,
            },
            span,
        })
    }

    fn parse_array(&mut self, span: Span) -> Option<Expr> {
        let mut items = Vec::new();
        if !self.check(&TokenKind::RightBracket) {
            loop {
                items.push(self.parse_expression()?);
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightBracket)?;
        Some(Expr {
            kind: ExprKind::Array(items),
            span: span.merge(self.previous_span()),
        })
    }

    /// Parse an anonymous `func (params) { … }` expression
    fn parse_func_expr(&mut self, span: Span) -> Option<Expr> {
        self.expect(&TokenKind::LeftParen)?;
        let params = self.parse_params()?;
        self.expect(&TokenKind::RightParen)?;
        let body = self.parse_block()?;

        Some(Expr {
            kind: ExprKind::Func(FuncDecl {
                name: "<anonymous>".to_string(),
                params,
                body,
                upvalues: Vec::new(),
            }),
            span,
        })
    }

    // === Token navigation ===

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> &Token {
        let idx = self.current.min(self.tokens.len() - 1);
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        &self.tokens[idx]
    }

    fn previous_span(&self) -> Span {
        if self.current == 0 {
            Span::dummy()
        } else {
            self.tokens[self.current - 1].span
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn match_kind(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Option<()> {
        if self.match_kind(kind) {
            Some(())
        } else {
            let found = self.peek().kind.clone();
            let span = self.peek().span;
            self.error_at(
                "ML2001",
                format!("Expected {} but found {}", kind, found),
                span,
            );
            None
        }
    }

    fn expect_ident(&mut self, what: &str) -> Option<Token> {
        if matches!(self.peek().kind, TokenKind::Ident(_)) {
            Some(self.advance().clone())
        } else {
            let span = self.peek().span;
            self.error_at("ML2005", format!("Missing identifier for {}", what), span);
            None
        }
    }

    /// Skip tokens until a likely statement boundary
    fn synchronize(&mut self) {
        while !self.check(&TokenKind::Eof) {
            if self.match_kind(&TokenKind::Semicolon) {
                return;
            }
            match self.peek().kind {
                TokenKind::RightBrace
                | TokenKind::Var
                | TokenKind::Func
                | TokenKind::Class
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // === Diagnostics ===

    fn peek_precedence(&self) -> Precedence {
        precedence_of(&self.peek().kind)
    }

    fn error_at(&mut self, code: &str, message: impl Into<String>, span: Span) {
        let source = self.source.clone();
        self.diagnostics.push(
            Diagnostic::error_with_code(code, message, span).with_location(&source, span),
        );
    }

    fn error_here(&mut self, code: &str, message: impl Into<String>) {
        let span = self.peek().span;
        self.error_at(code, message, span);
    }
}

/// Infix precedence of a token (Lowest when not an infix operator)
fn precedence_of(kind: &TokenKind) -> Precedence {
    match kind {
        TokenKind::Equal
        | TokenKind::PlusEqual
        | TokenKind::MinusEqual
        | TokenKind::StarEqual
        | TokenKind::SlashEqual => Precedence::Assign,
        TokenKind::PipePipe => Precedence::Or,
        TokenKind::AmpAmp => Precedence::And,
        TokenKind::EqualEqual
        | TokenKind::BangEqual
        | TokenKind::Less
        | TokenKind::Greater
        | TokenKind::LessEqual
        | TokenKind::GreaterEqual => Precedence::Comparison,
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Factor,
        TokenKind::Dot
        | TokenKind::DotDot
        | TokenKind::LeftParen
        | TokenKind::LeftBracket => Precedence::Call,
        _ => Precedence::Lowest,
    }
}

/// Whether an expression is a valid assignment target
fn is_assignable(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Var(_) => true,
        ExprKind::Postfix { chain, .. } => matches!(
            chain.last(),
            Some(PostfixItem::Field { .. }) | Some(PostfixItem::Index(_))
        ),
        _ => false,
    }
}

fn ident_name(token: &Token) -> String {
    match &token.kind {
        TokenKind::Ident(name) => name.clone(),
        _ => token.lexeme.clone(),
    }
}
