// File: src/ast.rs
//
// Abstract syntax tree for the Vesper programming language.
// One tagged enum per syntactic category; every node carries its byte
// span so the compiler can attach line numbers to emitted bytecode.

use crate::source::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Concat,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Less,
    LessEq,
    More,
    MoreEq,
    And,
    Or,
    /// `a[i]`; also reused as the target shape of `a[i] = v`.
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Str { text: String, char_len: usize },
    Identifier(String),
    Binary { lhs: Box<Expr>, op: BinaryOp, rhs: Box<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    /// `target = value`, or a compound assignment when `op` is set.
    Assign { target: Box<Expr>, op: Option<BinaryOp>, value: Box<Expr> },
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    GetField { object: Box<Expr>, name: String },
    Lambda { params: Vec<String>, body: Vec<Stmt> },
}

#[derive(Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug)]
pub struct CatchClause {
    pub pattern: Pattern,
    pub binding: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug)]
pub enum UseBinding {
    /// `use "path";` binds under the path stem.
    Default,
    /// `use "path" -> name;`
    Named(String),
    /// `use "path" -> *;`
    All,
    /// `use "path" -> (a, b -> c);` pairs of original name and
    /// optional alias.
    Selective(Vec<(String, Option<String>)>),
}

#[derive(Debug)]
pub enum StmtKind {
    Expr(Expr),
    /// `a : 1, b : 2;` names with optional initializers.
    VarDecl(Vec<(String, Option<Expr>)>),
    Block(Vec<Stmt>),
    Fn(FnDecl),
    Ret(Option<Expr>),
    If { cond: Expr, then: Vec<Stmt>, else_: Option<Box<Stmt>> },
    /// `loop`, `while`, and the desugared `for` all lower to this shape.
    Loop { init: Option<Box<Stmt>>, cond: Option<Expr>, step: Option<Expr>, body: Vec<Stmt> },
    Break,
    Class { name: String, superclass: Option<String>, methods: Vec<FnDecl> },
    Impl { type_name: String, methods: Vec<FnDecl> },
    Try { body: Vec<Stmt>, catches: Vec<CatchClause>, finally: Option<Vec<Stmt>> },
    Throw(Expr),
    Match { expr: Expr, cases: Vec<(Pattern, Stmt)> },
    Use { path: String, binding: UseBinding },
}

#[derive(Debug)]
pub struct Pattern {
    pub kind: PatternKind,
    pub span: Span,
}

#[derive(Debug)]
pub enum PatternKind {
    /// `Name` or `Name(field = pattern, ...)`.
    Class { name: String, fields: Vec<(String, Pattern)> },
    /// `{ expr }`: matches when the value equals the expression.
    Expr(Box<Expr>),
    /// `*`
    Wildcard,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr { kind, span }
    }
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Stmt { kind, span }
    }
}

impl Pattern {
    pub fn new(kind: PatternKind, span: Span) -> Self {
        Pattern { kind, span }
    }
}
