// File: src/parser.rs
//
// Recursive-descent parser for the Vesper programming language.
// Single token of lookahead, except at statement entry where the
// `IDENT ':'` variable-declaration form needs a second token. Errors
// synchronize at statement boundaries; a mode bit suppresses reporting
// of errors at end-of-input so the REPL can ask for more lines.

use crate::ast::{
    BinaryOp, CatchClause, Expr, ExprKind, FnDecl, Pattern, PatternKind, Stmt, StmtKind, UnaryOp,
    UseBinding,
};
use crate::errors::Reporter;
use crate::lexer::{Token, TokenKind};
use crate::source::{SourceMap, Span};

/// Marker for the unwinding path out of a bad statement; the error
/// itself has already gone through the reporter.
struct ParseError;

type PResult<T> = Result<T, ParseError>;

pub struct ParseOutcome {
    pub had_error: bool,
    /// True when every reported error happened at end-of-input; the
    /// REPL uses this to keep accumulating lines.
    pub error_at_eof: bool,
    pub ast: Vec<Stmt>,
}

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    map: &'a SourceMap,
    ignore_eof_errors: bool,
    had_error: bool,
    error_at_eof: bool,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token], map: &'a SourceMap) -> Self {
        Self::with_mode(tokens, map, false)
    }

    /// REPL mode: errors at end-of-input are recorded but not reported.
    pub fn with_mode(tokens: &'a [Token], map: &'a SourceMap, ignore_eof_errors: bool) -> Self {
        Parser { tokens, pos: 0, map, ignore_eof_errors, had_error: false, error_at_eof: false }
    }

    pub fn parse(mut self, reporter: &mut dyn Reporter) -> ParseOutcome {
        let mut ast = Vec::new();
        while !self.is_at_end() {
            if self.match_kind(TokenKind::Semicolon) {
                continue; // null statement
            }
            match self.stmt(reporter) {
                Ok(stmt) => ast.push(stmt),
                Err(ParseError) => {
                    if self.check(TokenKind::Eof) {
                        self.error_at_eof = true;
                    }
                    self.synchronize();
                }
            }
        }
        ParseOutcome { had_error: self.had_error, error_at_eof: self.error_at_eof, ast }
    }

    // === Statements ===

    fn stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        if self.match_kind(TokenKind::LeftBrace) {
            return self.block_stmt(r);
        }
        if self.match_kind(TokenKind::Fn) {
            let start = self.previous().span.start;
            let decl = self.function(start, r)?;
            let span = decl.span;
            return Ok(Stmt::new(StmtKind::Fn(decl), span));
        }
        if self.match_kind(TokenKind::Ret) {
            return self.ret_stmt(r);
        }
        if self.match_kind(TokenKind::If) {
            return self.if_stmt(r);
        }
        if self.match_kind(TokenKind::Loop) {
            return self.loop_stmt(r);
        }
        if self.match_kind(TokenKind::While) {
            return self.while_stmt(r);
        }
        if self.match_kind(TokenKind::For) {
            return self.for_stmt(r);
        }
        if self.match_kind(TokenKind::Break) {
            let start = self.previous().span.start;
            self.expect(TokenKind::Semicolon, "expected ';'", r)?;
            return Ok(Stmt::new(StmtKind::Break, Span::new(start, self.previous().span.end)));
        }
        if self.match_kind(TokenKind::Class) {
            return self.class_stmt(r);
        }
        if self.match_kind(TokenKind::Impl) {
            return self.impl_stmt(r);
        }
        if self.match_kind(TokenKind::Try) {
            return self.try_stmt(r);
        }
        if self.match_kind(TokenKind::Throw) {
            return self.throw_stmt(r);
        }
        if self.match_kind(TokenKind::Match) {
            return self.match_stmt(r);
        }
        if self.match_kind(TokenKind::Use) {
            return self.use_stmt(r);
        }

        if self.check(TokenKind::Identifier) && self.peek_next().kind == TokenKind::Colon {
            return self.var_decl_stmt(r);
        }

        self.expr_stmt(r)
    }

    fn expr_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.peek().span.start;
        let expr = self.expr(r)?;
        self.expect(TokenKind::Semicolon, "expected ';'", r)?;
        Ok(Stmt::new(StmtKind::Expr(expr), Span::new(start, self.previous().span.end)))
    }

    fn block_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        let mut stmts = Vec::new();
        while !self.is_at_end() && !self.match_kind(TokenKind::RightBrace) {
            match self.stmt(r) {
                Ok(stmt) => stmts.push(stmt),
                Err(ParseError) => {
                    if self.check(TokenKind::Eof) {
                        self.error_at_eof = true;
                    }
                    self.synchronize();
                }
            }
        }
        Ok(Stmt::new(StmtKind::Block(stmts), Span::new(start, self.previous().span.end)))
    }

    fn ret_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        let value = if self.check(TokenKind::Semicolon) { None } else { Some(self.expr(r)?) };
        self.expect(TokenKind::Semicolon, "expected ';'", r)?;
        Ok(Stmt::new(StmtKind::Ret(value), Span::new(start, self.previous().span.end)))
    }

    fn if_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        let cond = self.expr(r)?;
        let then = self.block(r)?;

        let else_ = if self.match_kind(TokenKind::Else) {
            self.expect(TokenKind::LeftBrace, "expected '{'", r)?;
            Some(Box::new(self.block_stmt(r)?))
        } else if self.match_kind(TokenKind::Elif) {
            Some(Box::new(self.if_stmt(r)?))
        } else {
            None
        };

        Ok(Stmt::new(
            StmtKind::If { cond, then, else_ },
            Span::new(start, self.previous().span.end),
        ))
    }

    fn loop_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        let body = self.block(r)?;
        Ok(Stmt::new(
            StmtKind::Loop { init: None, cond: None, step: None, body },
            Span::new(start, self.previous().span.end),
        ))
    }

    fn while_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        let cond = self.expr(r)?;
        let body = self.block(r)?;
        Ok(Stmt::new(
            StmtKind::Loop { init: None, cond: Some(cond), step: None, body },
            Span::new(start, self.previous().span.end),
        ))
    }

    /// `for x in EXPR { ... }` desugars to the iterator protocol:
    ///
    /// ```text
    /// {
    ///     .iterator : (EXPR).$iter();
    ///     try {
    ///         x : .iterator.$next();
    ///         loop { ...; x = .iterator.$next(); }
    ///     } catch StopIteration {}
    /// }
    /// ```
    ///
    /// `.iterator` cannot collide with user names since `.` never
    /// starts an identifier in source text.
    fn for_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        self.expect(TokenKind::Identifier, "expected variable name", r)?;
        let item = self.previous().text.clone();
        let item_span = self.previous().span;
        self.expect(TokenKind::In, "expected 'in'", r)?;
        let iterable = self.expr(r)?;
        let iterable_span = iterable.span;
        let body = self.block(r)?;
        let span = Span::new(start, self.previous().span.end);

        const ITERATOR: &str = ".iterator";

        let iter_call = Expr::new(
            ExprKind::Call {
                callee: Box::new(Expr::new(
                    ExprKind::GetField { object: Box::new(iterable), name: "$iter".to_string() },
                    iterable_span,
                )),
                args: Vec::new(),
            },
            iterable_span,
        );
        let iterator_decl = Stmt::new(
            StmtKind::VarDecl(vec![(ITERATOR.to_string(), Some(iter_call))]),
            span,
        );

        let next_call = |span: Span| {
            Expr::new(
                ExprKind::Call {
                    callee: Box::new(Expr::new(
                        ExprKind::GetField {
                            object: Box::new(Expr::new(
                                ExprKind::Identifier(ITERATOR.to_string()),
                                span,
                            )),
                            name: "$next".to_string(),
                        },
                        span,
                    )),
                    args: Vec::new(),
                },
                span,
            )
        };

        let item_decl = Stmt::new(
            StmtKind::VarDecl(vec![(item.clone(), Some(next_call(item_span)))]),
            item_span,
        );
        let step = Expr::new(
            ExprKind::Assign {
                target: Box::new(Expr::new(ExprKind::Identifier(item), item_span)),
                op: None,
                value: Box::new(next_call(item_span)),
            },
            item_span,
        );

        let desugared_loop = Stmt::new(
            StmtKind::Loop {
                init: Some(Box::new(item_decl)),
                cond: None,
                step: Some(step),
                body,
            },
            span,
        );

        let stop_iteration = CatchClause {
            pattern: Pattern::new(
                PatternKind::Class { name: "StopIteration".to_string(), fields: Vec::new() },
                span,
            ),
            binding: None,
            body: Vec::new(),
        };
        let try_stmt = Stmt::new(
            StmtKind::Try { body: vec![desugared_loop], catches: vec![stop_iteration], finally: None },
            span,
        );

        Ok(Stmt::new(StmtKind::Block(vec![iterator_decl, try_stmt]), span))
    }

    fn class_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        self.expect(TokenKind::Identifier, "expected class name", r)?;
        let name = self.previous().text.clone();

        let superclass = if self.match_kind(TokenKind::Less) {
            self.expect(TokenKind::Identifier, "expected superclass name", r)?;
            Some(self.previous().text.clone())
        } else {
            None
        };

        self.expect(TokenKind::LeftBrace, "expected '{'", r)?;
        let mut methods = Vec::new();
        while !self.is_at_end() && !self.check(TokenKind::RightBrace) {
            self.expect(TokenKind::Fn, "expected method", r)?;
            let fn_start = self.previous().span.start;
            methods.push(self.function(fn_start, r)?);
        }
        self.expect(TokenKind::RightBrace, "expected '}'", r)?;

        Ok(Stmt::new(
            StmtKind::Class { name, superclass, methods },
            Span::new(start, self.previous().span.end),
        ))
    }

    fn impl_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        self.expect(TokenKind::Identifier, "expected type name", r)?;
        let type_name = self.previous().text.clone();

        self.expect(TokenKind::LeftBrace, "expected '{'", r)?;
        let mut methods = Vec::new();
        while !self.is_at_end() && !self.check(TokenKind::RightBrace) {
            self.expect(TokenKind::Fn, "expected method", r)?;
            let fn_start = self.previous().span.start;
            methods.push(self.function(fn_start, r)?);
        }
        self.expect(TokenKind::RightBrace, "expected '}'", r)?;

        Ok(Stmt::new(
            StmtKind::Impl { type_name, methods },
            Span::new(start, self.previous().span.end),
        ))
    }

    fn try_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        let body = self.block(r)?;

        if self.match_kind(TokenKind::Finally) {
            let finally = self.block(r)?;
            return Ok(Stmt::new(
                StmtKind::Try { body, catches: Vec::new(), finally: Some(finally) },
                Span::new(start, self.previous().span.end),
            ));
        }

        if !self.check(TokenKind::Catch) {
            return Err(self.error_at(self.pos, "expected a catch block", r));
        }

        let mut catches = Vec::new();
        while !self.is_at_end() && self.match_kind(TokenKind::Catch) {
            let pattern = self.pattern(r)?;
            let binding = if self.match_kind(TokenKind::ThinArrow) {
                self.expect(TokenKind::Identifier, "expected caught value name", r)?;
                Some(self.previous().text.clone())
            } else {
                None
            };
            let body = self.block(r)?;
            catches.push(CatchClause { pattern, binding, body });
        }

        let finally =
            if self.match_kind(TokenKind::Finally) { Some(self.block(r)?) } else { None };

        Ok(Stmt::new(
            StmtKind::Try { body, catches, finally },
            Span::new(start, self.previous().span.end),
        ))
    }

    fn throw_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        let value = self.expr(r)?;
        self.expect(TokenKind::Semicolon, "expected ';'", r)?;
        Ok(Stmt::new(StmtKind::Throw(value), Span::new(start, self.previous().span.end)))
    }

    fn var_decl_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.peek().span.start;
        let mut vars = Vec::new();
        loop {
            self.expect(TokenKind::Identifier, "expected variable name", r)?;
            let name = self.previous().text.clone();
            let initializer =
                if self.match_kind(TokenKind::Colon) { Some(self.expr(r)?) } else { None };
            vars.push((name, initializer));
            if self.is_at_end() || !self.match_kind(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::Semicolon, "expected ';'", r)?;
        Ok(Stmt::new(StmtKind::VarDecl(vars), Span::new(start, self.previous().span.end)))
    }

    fn match_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        let expr = self.expr(r)?;
        self.expect(TokenKind::LeftBrace, "expected '{'", r)?;

        let mut cases = Vec::new();
        while !self.is_at_end() && !self.check(TokenKind::RightBrace) {
            let pattern = self.pattern(r)?;
            self.expect(TokenKind::Arrow, "expected '=>'", r)?;
            let stmt = self.stmt(r)?;
            cases.push((pattern, stmt));
        }
        self.expect(TokenKind::RightBrace, "expected '}'", r)?;

        Ok(Stmt::new(
            StmtKind::Match { expr, cases },
            Span::new(start, self.previous().span.end),
        ))
    }

    fn use_stmt(&mut self, r: &mut dyn Reporter) -> PResult<Stmt> {
        let start = self.previous().span.start;
        self.expect(TokenKind::Str, "expected path string", r)?;
        let path = self.previous().text.clone();

        if self.match_kind(TokenKind::Semicolon) {
            return Ok(Stmt::new(
                StmtKind::Use { path, binding: UseBinding::Default },
                Span::new(start, self.previous().span.end),
            ));
        }

        self.expect(TokenKind::ThinArrow, "expected '->'", r)?;
        if self.match_kind(TokenKind::Identifier) {
            let name = self.previous().text.clone();
            self.expect(TokenKind::Semicolon, "expected ';'", r)?;
            return Ok(Stmt::new(
                StmtKind::Use { path, binding: UseBinding::Named(name) },
                Span::new(start, self.previous().span.end),
            ));
        }
        if self.match_kind(TokenKind::Star) {
            self.expect(TokenKind::Semicolon, "expected ';'", r)?;
            return Ok(Stmt::new(
                StmtKind::Use { path, binding: UseBinding::All },
                Span::new(start, self.previous().span.end),
            ));
        }

        self.expect(TokenKind::LeftParen, "expected '('", r)?;
        let mut imports = Vec::new();
        loop {
            self.expect(TokenKind::Identifier, "expected name of variable to import", r)?;
            let original = self.previous().text.clone();
            let alias = if self.match_kind(TokenKind::ThinArrow) {
                self.expect(TokenKind::Identifier, "expected import alias name", r)?;
                Some(self.previous().text.clone())
            } else {
                None
            };
            imports.push((original, alias));
            if self.is_at_end() || !self.match_kind(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen, "expected ')'", r)?;
        self.expect(TokenKind::Semicolon, "expected ';'", r)?;
        Ok(Stmt::new(
            StmtKind::Use { path, binding: UseBinding::Selective(imports) },
            Span::new(start, self.previous().span.end),
        ))
    }

    fn function(&mut self, start: usize, r: &mut dyn Reporter) -> PResult<FnDecl> {
        self.expect(TokenKind::Identifier, "expected function name", r)?;
        let name = self.previous().text.clone();

        self.expect(TokenKind::LeftParen, "expected '('", r)?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expect(TokenKind::Identifier, "expected function argument name", r)?;
                params.push(self.previous().text.clone());
                if self.is_at_end() || !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen, "expected ')'", r)?;

        let body = self.block(r)?;
        Ok(FnDecl { name, params, body, span: Span::new(start, self.previous().span.end) })
    }

    fn block(&mut self, r: &mut dyn Reporter) -> PResult<Vec<Stmt>> {
        self.expect(TokenKind::LeftBrace, "expected '{'", r)?;
        let mut stmts = Vec::new();
        while !self.is_at_end() && !self.check(TokenKind::RightBrace) {
            match self.stmt(r) {
                Ok(stmt) => stmts.push(stmt),
                Err(ParseError) => {
                    if self.check(TokenKind::Eof) {
                        self.error_at_eof = true;
                    }
                    self.synchronize();
                }
            }
        }
        self.expect(TokenKind::RightBrace, "expected '}'", r)?;
        Ok(stmts)
    }

    // === Expressions ===

    fn expr(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        self.assignment(r)
    }

    fn assignment(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let lhs = self.or_expr(r)?;

        let compound = match self.peek().kind {
            TokenKind::Equals => Some(None),
            TokenKind::PlusEquals => Some(Some(BinaryOp::Add)),
            TokenKind::PlusPlusEquals => Some(Some(BinaryOp::Concat)),
            TokenKind::MinusEquals => Some(Some(BinaryOp::Sub)),
            TokenKind::StarEquals => Some(Some(BinaryOp::Mul)),
            TokenKind::SlashEquals => Some(Some(BinaryOp::Div)),
            TokenKind::PercentEquals => Some(Some(BinaryOp::Mod)),
            _ => None,
        };

        if let Some(op) = compound {
            self.advance();
            let value = self.assignment(r)?;
            let span = Span::new(start, self.previous().span.end);
            return Ok(Expr::new(
                ExprKind::Assign { target: Box::new(lhs), op, value: Box::new(value) },
                span,
            ));
        }

        Ok(lhs)
    }

    fn or_expr(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let mut expr = self.and_expr(r)?;
        while !self.is_at_end() && self.match_kind(TokenKind::Or) {
            let rhs = self.and_expr(r)?;
            let span = Span::new(start, self.previous().span.end);
            expr = Expr::new(
                ExprKind::Binary { lhs: Box::new(expr), op: BinaryOp::Or, rhs: Box::new(rhs) },
                span,
            );
        }
        Ok(expr)
    }

    fn and_expr(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let mut expr = self.equality(r)?;
        while !self.is_at_end() && self.match_kind(TokenKind::And) {
            let rhs = self.equality(r)?;
            let span = Span::new(start, self.previous().span.end);
            expr = Expr::new(
                ExprKind::Binary { lhs: Box::new(expr), op: BinaryOp::And, rhs: Box::new(rhs) },
                span,
            );
        }
        Ok(expr)
    }

    fn equality(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let mut expr = self.comparison(r)?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqualsEquals => BinaryOp::Eq,
                TokenKind::NotEquals => BinaryOp::NotEq,
                _ => break,
            };
            self.advance();
            let rhs = self.comparison(r)?;
            let span = Span::new(start, self.previous().span.end);
            expr = Expr::new(
                ExprKind::Binary { lhs: Box::new(expr), op, rhs: Box::new(rhs) },
                span,
            );
        }
        Ok(expr)
    }

    fn comparison(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let mut expr = self.additive(r)?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEquals => BinaryOp::LessEq,
                TokenKind::More => BinaryOp::More,
                TokenKind::MoreEquals => BinaryOp::MoreEq,
                _ => break,
            };
            self.advance();
            let rhs = self.additive(r)?;
            let span = Span::new(start, self.previous().span.end);
            expr = Expr::new(
                ExprKind::Binary { lhs: Box::new(expr), op, rhs: Box::new(rhs) },
                span,
            );
        }
        Ok(expr)
    }

    fn additive(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let mut expr = self.multiplicative(r)?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::PlusPlus => BinaryOp::Concat,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.multiplicative(r)?;
            let span = Span::new(start, self.previous().span.end);
            expr = Expr::new(
                ExprKind::Binary { lhs: Box::new(expr), op, rhs: Box::new(rhs) },
                span,
            );
        }
        Ok(expr)
    }

    fn multiplicative(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let mut expr = self.unary(r)?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.unary(r)?;
            let span = Span::new(start, self.previous().span.end);
            expr = Expr::new(
                ExprKind::Binary { lhs: Box::new(expr), op, rhs: Box::new(rhs) },
                span,
            );
        }
        Ok(expr)
    }

    fn unary(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Negate),
            TokenKind::Not => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.postfix(r)?;
            let span = Span::new(start, self.previous().span.end);
            return Ok(Expr::new(ExprKind::Unary { op, expr: Box::new(expr) }, span));
        }
        self.postfix(r)
    }

    fn postfix(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let mut expr = self.primary(r)?;

        loop {
            if self.match_kind(TokenKind::LeftParen) {
                let mut args = Vec::new();
                if !self.is_at_end() && !self.check(TokenKind::RightParen) {
                    loop {
                        args.push(self.expr(r)?);
                        if self.is_at_end() || !self.match_kind(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RightParen, "expected ')'", r)?;
                let span = Span::new(start, self.previous().span.end);
                expr = Expr::new(ExprKind::Call { callee: Box::new(expr), args }, span);
            } else if self.match_kind(TokenKind::Dot) {
                self.expect(TokenKind::Identifier, "expected field name", r)?;
                let name = self.previous().text.clone();
                let span = Span::new(start, self.previous().span.end);
                expr = Expr::new(ExprKind::GetField { object: Box::new(expr), name }, span);
            } else if self.match_kind(TokenKind::LeftBracket) {
                let index = self.expr(r)?;
                self.expect(TokenKind::RightBracket, "expected ']'", r)?;
                let span = Span::new(start, self.previous().span.end);
                expr = Expr::new(
                    ExprKind::Binary {
                        lhs: Box::new(expr),
                        op: BinaryOp::Index,
                        rhs: Box::new(index),
                    },
                    span,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        if self.match_kind(TokenKind::Int) {
            let t = self.previous();
            return Ok(Expr::new(ExprKind::Int(t.int_value), t.span));
        }
        if self.match_kind(TokenKind::Float) {
            let t = self.previous();
            return Ok(Expr::new(ExprKind::Float(t.float_value), t.span));
        }
        if self.match_kind(TokenKind::Identifier) {
            let t = self.previous();
            return Ok(Expr::new(ExprKind::Identifier(t.text.clone()), t.span));
        }
        if self.match_kind(TokenKind::Str) {
            let t = self.previous();
            return Ok(Expr::new(
                ExprKind::Str { text: t.text.clone(), char_len: t.char_len },
                t.span,
            ));
        }
        if self.match_kind(TokenKind::True) {
            return Ok(Expr::new(ExprKind::Bool(true), self.previous().span));
        }
        if self.match_kind(TokenKind::False) {
            return Ok(Expr::new(ExprKind::Bool(false), self.previous().span));
        }
        if self.match_kind(TokenKind::Null) {
            return Ok(Expr::new(ExprKind::Null, self.previous().span));
        }
        if self.match_kind(TokenKind::LeftBracket) {
            return self.list_literal(r);
        }
        if self.match_kind(TokenKind::LeftBrace) {
            return self.dict_literal(r);
        }
        if self.match_kind(TokenKind::LeftParen) {
            let expr = self.expr(r)?;
            self.expect(TokenKind::RightParen, "expected ')'", r)?;
            return Ok(expr);
        }
        if self.check(TokenKind::Pipe) || self.check(TokenKind::PipePipe) {
            return self.lambda(r);
        }

        Err(self.error_at(self.pos, "expected expression", r))
    }

    fn list_literal(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.previous().span.start;
        if self.match_kind(TokenKind::RightBracket) {
            return Ok(Expr::new(
                ExprKind::List(Vec::new()),
                Span::new(start, self.previous().span.end),
            ));
        }
        let mut values = Vec::new();
        loop {
            values.push(self.expr(r)?);
            if self.match_kind(TokenKind::RightBracket) {
                break;
            }
            self.expect(TokenKind::Comma, "expected ','", r)?;
            if self.match_kind(TokenKind::RightBracket) {
                break; // trailing comma
            }
        }
        Ok(Expr::new(ExprKind::List(values), Span::new(start, self.previous().span.end)))
    }

    fn dict_literal(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.previous().span.start;
        if self.match_kind(TokenKind::RightBrace) {
            return Ok(Expr::new(
                ExprKind::Dict(Vec::new()),
                Span::new(start, self.previous().span.end),
            ));
        }
        let mut values = Vec::new();
        loop {
            let key = self.expr(r)?;
            self.expect(TokenKind::Colon, "expected ':'", r)?;
            let value = self.expr(r)?;
            values.push((key, value));
            if self.match_kind(TokenKind::RightBrace) {
                break;
            }
            self.expect(TokenKind::Comma, "expected ','", r)?;
            if self.match_kind(TokenKind::RightBrace) {
                break; // trailing comma
            }
        }
        Ok(Expr::new(ExprKind::Dict(values), Span::new(start, self.previous().span.end)))
    }

    /// `|a, b| expr`, `|a, b| { stmts }`, or `|| ...` for no arguments.
    fn lambda(&mut self, r: &mut dyn Reporter) -> PResult<Expr> {
        let start = self.peek().span.start;
        let mut params = Vec::new();

        if self.match_kind(TokenKind::PipePipe) {
            // no parameters
        } else {
            self.expect(TokenKind::Pipe, "expected '|'", r)?;
            if !self.match_kind(TokenKind::Pipe) {
                loop {
                    self.expect(TokenKind::Identifier, "expected argument name", r)?;
                    params.push(self.previous().text.clone());
                    if !self.match_kind(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::Pipe, "expected '|'", r)?;
            }
        }

        if self.check(TokenKind::LeftBrace) {
            let body = self.block(r)?;
            let span = Span::new(start, self.previous().span.end);
            return Ok(Expr::new(ExprKind::Lambda { params, body }, span));
        }

        // Single-expression body is an implicit return.
        let value_start = self.peek().span.start;
        let value = self.expr(r)?;
        let value_span = Span::new(value_start, self.previous().span.end);
        let body = vec![Stmt::new(StmtKind::Ret(Some(value)), value_span)];
        let span = Span::new(start, self.previous().span.end);
        Ok(Expr::new(ExprKind::Lambda { params, body }, span))
    }

    // === Patterns ===

    fn pattern(&mut self, r: &mut dyn Reporter) -> PResult<Pattern> {
        if self.match_kind(TokenKind::Identifier) {
            return self.class_pattern(r);
        }
        if self.match_kind(TokenKind::LeftBrace) {
            let start = self.previous().span.start;
            let expr = self.expr(r)?;
            self.expect(TokenKind::RightBrace, "expected '}'", r)?;
            let span = Span::new(start, self.previous().span.end);
            return Ok(Pattern::new(PatternKind::Expr(Box::new(expr)), span));
        }
        if self.match_kind(TokenKind::Star) {
            return Ok(Pattern::new(PatternKind::Wildcard, self.previous().span));
        }

        Err(self.error_at(self.pos, "expected pattern", r))
    }

    fn class_pattern(&mut self, r: &mut dyn Reporter) -> PResult<Pattern> {
        let name = self.previous().text.clone();
        let start = self.previous().span.start;

        if !self.match_kind(TokenKind::LeftParen) {
            return Ok(Pattern::new(
                PatternKind::Class { name, fields: Vec::new() },
                Span::new(start, self.previous().span.end),
            ));
        }

        let mut fields = Vec::new();
        loop {
            self.expect(TokenKind::Identifier, "expected field name", r)?;
            let field = self.previous().text.clone();
            self.expect(TokenKind::Equals, "expected '='", r)?;
            let pattern = self.pattern(r)?;
            fields.push((field, pattern));
            if self.is_at_end() || !self.match_kind(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen, "expected ')'", r)?;
        Ok(Pattern::new(
            PatternKind::Class { name, fields },
            Span::new(start, self.previous().span.end),
        ))
    }

    // === Token plumbing ===

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> &Token {
        if self.is_at_end() {
            return self.peek();
        }
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos - 1]
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.pos += 1;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        false
    }

    fn expect(&mut self, kind: TokenKind, message: &str, r: &mut dyn Reporter) -> PResult<()> {
        if self.match_kind(kind) {
            return Ok(());
        }
        Err(self.error_at(self.pos, message, r))
    }

    fn error_at(&mut self, token_index: usize, message: &str, r: &mut dyn Reporter) -> ParseError {
        self.had_error = true;
        let token = &self.tokens[token_index.min(self.tokens.len() - 1)];
        // Error tokens were already reported by the scanner; errors at
        // end-of-input are swallowed in REPL mode.
        let suppress = token.kind == TokenKind::Error
            || (self.ignore_eof_errors && self.check(TokenKind::Eof));
        if !suppress {
            r.parser_error(self.map, token, message);
        }
        ParseError
    }

    fn synchronize(&mut self) {
        while !self.is_at_end() {
            match self.peek().kind {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Class
                | TokenKind::Try
                | TokenKind::Throw
                | TokenKind::Fn
                | TokenKind::For
                | TokenKind::Loop
                | TokenKind::While
                | TokenKind::If
                | TokenKind::Ret
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Use
                | TokenKind::Match => return,
                _ => self.advance(),
            }
        }
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CollectingReporter;
    use crate::lexer::tokenize;
    use std::path::PathBuf;

    fn parse(src: &str) -> (Vec<Stmt>, bool) {
        let mut map = SourceMap::new(src.to_string(), "<test>".into(), PathBuf::from("."));
        let mut reporter = CollectingReporter::default();
        let lexed = tokenize(src, &mut map, &mut reporter);
        let outcome = Parser::new(&lexed.tokens, &map).parse(&mut reporter);
        (outcome.ast, outcome.had_error)
    }

    #[test]
    fn parses_variable_declarations() {
        let (ast, err) = parse("x : 1, y : 2;");
        assert!(!err);
        assert_eq!(ast.len(), 1);
        match &ast[0].kind {
            StmtKind::VarDecl(vars) => {
                assert_eq!(vars.len(), 2);
                assert_eq!(vars[0].0, "x");
                assert_eq!(vars[1].0, "y");
            }
            other => panic!("expected VarDecl, got {:?}", other),
        }
    }

    #[test]
    fn identifier_colon_needs_two_tokens_of_lookahead() {
        // `x ;` is an expression statement, not a declaration.
        let (ast, err) = parse("x;");
        assert!(!err);
        assert!(matches!(ast[0].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn parses_precedence() {
        let (ast, err) = parse("a : 1 + 2 * 3;");
        assert!(!err);
        let StmtKind::VarDecl(vars) = &ast[0].kind else { panic!() };
        let Some(init) = &vars[0].1 else { panic!() };
        let ExprKind::Binary { op, rhs, .. } = &init.kind else { panic!() };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn for_desugars_to_iterator_protocol() {
        let (ast, err) = parse("for x in xs { put(x); }");
        assert!(!err);
        let StmtKind::Block(stmts) = &ast[0].kind else { panic!("expected block") };
        assert!(matches!(&stmts[0].kind, StmtKind::VarDecl(v) if v[0].0 == ".iterator"));
        let StmtKind::Try { catches, .. } = &stmts[1].kind else { panic!("expected try") };
        assert!(matches!(
            &catches[0].pattern.kind,
            PatternKind::Class { name, .. } if name == "StopIteration"
        ));
    }

    #[test]
    fn parses_lambdas() {
        let (ast, err) = parse("f : |a, b| a + b; g : || { ret 1; };");
        assert!(!err);
        let StmtKind::VarDecl(vars) = &ast[0].kind else { panic!() };
        let Some(Expr { kind: ExprKind::Lambda { params, body }, .. }) = vars[0].1.as_ref() else {
            panic!()
        };
        assert_eq!(params, &["a", "b"]);
        assert!(matches!(body[0].kind, StmtKind::Ret(Some(_))));
    }

    #[test]
    fn parses_class_with_superclass() {
        let (ast, err) = parse("class Dog < Animal { fn speak($) { ret 1; } }");
        assert!(!err);
        let StmtKind::Class { name, superclass, methods } = &ast[0].kind else { panic!() };
        assert_eq!(name, "Dog");
        assert_eq!(superclass.as_deref(), Some("Animal"));
        assert_eq!(methods[0].name, "speak");
        assert_eq!(methods[0].params, &["$"]);
    }

    #[test]
    fn parses_try_catch_finally() {
        let (ast, err) = parse("try { f(); } catch TypeError -> e { g(); } finally { h(); }");
        assert!(!err);
        let StmtKind::Try { catches, finally, .. } = &ast[0].kind else { panic!() };
        assert_eq!(catches.len(), 1);
        assert_eq!(catches[0].binding.as_deref(), Some("e"));
        assert!(finally.is_some());
    }

    #[test]
    fn parses_use_forms() {
        let (ast, err) = parse(
            "use \"m\"; use \"m\" -> x; use \"m\" -> *; use \"m\" -> (a, b -> c);",
        );
        assert!(!err);
        assert!(matches!(&ast[0].kind, StmtKind::Use { binding: UseBinding::Default, .. }));
        assert!(matches!(&ast[1].kind, StmtKind::Use { binding: UseBinding::Named(n), .. } if n == "x"));
        assert!(matches!(&ast[2].kind, StmtKind::Use { binding: UseBinding::All, .. }));
        match &ast[3].kind {
            StmtKind::Use { binding: UseBinding::Selective(imports), .. } => {
                assert_eq!(imports[0], ("a".to_string(), None));
                assert_eq!(imports[1], ("b".to_string(), Some("c".to_string())));
            }
            other => panic!("expected selective use, got {:?}", other),
        }
    }

    #[test]
    fn error_recovery_synchronizes_at_statements() {
        let (ast, err) = parse("x : ; y : 2;");
        assert!(err);
        // The second declaration still parses.
        assert!(ast.iter().any(|s| matches!(&s.kind, StmtKind::VarDecl(v) if v[0].0 == "y")));
    }

    #[test]
    fn eof_errors_are_flagged_for_the_repl() {
        let src = "fn f() {";
        let mut map = SourceMap::new(src.to_string(), "<test>".into(), PathBuf::from("."));
        let mut reporter = CollectingReporter::default();
        let lexed = tokenize(src, &mut map, &mut reporter);
        let outcome = Parser::with_mode(&lexed.tokens, &map, true).parse(&mut reporter);
        assert!(outcome.had_error);
        assert!(outcome.error_at_eof);
        assert!(reporter.is_empty());
    }
}
