//! Resolved AST types: the input boundary this crate compiles from.
//!
//! Lexing, parsing, and type checking are out of scope —
//! they are external collaborators. This module is the *interface* a parser
//! and type checker would produce: a [`Program`] made of already-merged
//! package module lists, with every name still a bare identifier (symbol
//! resolution into load/store opcodes is the compiler's job, not the
//! front end's). Tests in this crate build `Program` values directly with
//! the constructors below rather than through a textual parser.

use std::collections::BTreeMap;

use crate::errors::Span;

/// A fully resolved compilation unit: a root package name, the main
/// package's name, and every package's module list (imports already
/// resolved into this map by the external loader).
#[derive(Debug, Clone)]
pub struct Program {
    pub root: String,
    pub main: String,
    pub pkgs: BTreeMap<String, Vec<Module>>,
}

impl Program {
    #[must_use]
    pub fn single_module(pkg: impl Into<String>, module: Module) -> Self {
        let pkg = pkg.into();
        let mut pkgs = BTreeMap::new();
        pkgs.insert(pkg.clone(), vec![module]);
        Self { root: pkg.clone(), main: pkg, pkgs }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub filename: String,
    pub body: Vec<Stmt>,
}

impl Module {
    #[must_use]
    pub fn new(filename: impl Into<String>, body: Vec<Stmt>) -> Self {
        Self { filename: filename.into(), body }
    }
}

/// A dotted name reference, e.g. `a.b.c` in `a.b.c = 1` or an import path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub names: Vec<String>,
    pub span: Span,
}

impl Identifier {
    #[must_use]
    pub fn single(name: impl Into<String>) -> Self {
        Self { names: vec![name.into()], span: Span::dummy() }
    }

    #[must_use]
    pub fn dotted(names: Vec<&str>) -> Self {
        Self { names: names.into_iter().map(str::to_owned).collect(), span: Span::dummy() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    And,
    Or,
    As,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
    /// Bare `not` used as a binary comparison operator; the compiler lowers
    /// this identically to `IsNot`.
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Invert,
    Not,
    Pos,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AugOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
}

/// How a config entry's value combines with any pre-existing value at the
/// same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEntryOp {
    Override,
    Union,
    Insert,
}

#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub key: ConfigKey,
    pub value: Expr,
    pub op: ConfigEntryOp,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ConfigKey {
    /// `a` or a dotted `a.b.c` (rewritten to nested entries before lowering).
    Name(Identifier),
    /// `"a"` or a computed `[expr]` key.
    Computed(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum StringPart {
    Literal(String),
    /// `${expr}` or `${expr:spec}`.
    Interpolated(Box<Expr>, Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantifierKind {
    All,
    Any,
    Map,
    Filter,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Undefined,
    /// Integer literal with a unit suffix, e.g. `1Mi`.
    NumberMultiplier(i64, String),
    StringInterpolation(Vec<StringPart>),
    Name(Identifier),
    List(Vec<Expr>),
    /// `[expr for var(s) in iter if cond]`.
    ListComp { element: Box<Expr>, vars: Vec<String>, iter: Box<Expr>, cond: Option<Box<Expr>> },
    Config(Vec<ConfigEntry>),
    /// `Name { config }` schema construction.
    SchemaExpr { name: Identifier, config: Vec<ConfigEntry> },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    Attr(Box<Expr>, String),
    Subscript(Box<Expr>, Box<Expr>),
    Call { func: Box<Expr>, args: Vec<Expr>, kwargs: Vec<(String, Expr)> },
    Lambda { params: Vec<Param>, body: Vec<Stmt>, result: Box<Expr> },
    Quantifier { kind: QuantifierKind, vars: Vec<String>, iter: Box<Expr>, cond: Option<Box<Expr>>, map_expr: Option<Box<Expr>> },
}

#[derive(Debug, Clone)]
pub enum AssignTarget {
    Name(Identifier),
    Attr(Box<Expr>, String),
    Subscript(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct SchemaAttr {
    pub name: String,
    pub type_str: String,
    pub default: Option<Expr>,
    pub is_optional: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct CheckExpr {
    pub test: Expr,
    pub message: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Default)]
pub struct Decorator {
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
}

#[derive(Debug, Clone)]
pub struct SchemaStmt {
    pub name: String,
    pub parent_name: Option<Identifier>,
    pub mixins: Vec<Identifier>,
    pub index_signature: Option<(String, String, String)>,
    pub attrs: Vec<SchemaAttr>,
    pub body: Vec<Stmt>,
    pub checks: Vec<CheckExpr>,
    pub decorators: Vec<Decorator>,
    pub is_relaxed: bool,
    pub docstring: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct RuleStmt {
    pub name: String,
    pub parent_rules: Vec<Identifier>,
    pub checks: Vec<CheckExpr>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Assign { targets: Vec<AssignTarget>, value: Expr, span: Span },
    AugAssign { target: AssignTarget, op: AugOp, value: Expr, span: Span },
    If { branches: Vec<(Expr, Vec<Stmt>)>, orelse: Vec<Stmt> },
    Assert { test: Expr, message: Option<Expr>, span: Span },
    Import { path: String, asname: Option<String>, span: Span },
    Schema(SchemaStmt),
    Rule(RuleStmt),
    Expr(Expr),
}
