//! The abstract syntax tree consumed by the compiler.
//!
//! Trees are produced by an external front end; the node taxonomy here is the
//! accepted language subset plus the sugar forms (`assert`, `lambda`,
//! decorated `def`, list comprehensions) that [`crate::desugar`] eliminates.
//! All nodes are `serde`-serializable so any front end that can emit the
//! matching JSON shape can drive the compiler.
//!
//! `line` fields are 1-based source lines; 0 means "unassigned" and is filled
//! in by the desugarer's location-repair pass. `scope_id` fields are likewise
//! assigned during repair and key the scope analyzer's child table.

use serde::{Deserialize, Serialize};

/// A whole compilation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub body: Vec<Stmt>,
}

/// A statement with its source line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    #[serde(default)]
    pub line: u32,
    pub kind: StmtKind,
}

/// An expression with its source line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    #[serde(default)]
    pub line: u32,
    pub kind: ExprKind,
}

/// Whether a name/attribute/subscript/sequence node reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ctx {
    Load,
    Store,
}

/// Literal constants: numeric, string, bytes, and the named constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryKind {
    Pos,
    Neg,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinKind {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpKind {
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolKind {
    And,
    Or,
}

/// Formal parameters of a function: positionals, then `*args`, then `**kwargs`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Arguments {
    pub args: Vec<String>,
    #[serde(default)]
    pub vararg: Option<String>,
    #[serde(default)]
    pub kwarg: Option<String>,
}

impl Arguments {
    /// All parameter names in binding order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .map(String::as_str)
            .chain(self.vararg.as_deref())
            .chain(self.kwarg.as_deref())
    }
}

/// A `key=value` argument at a call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub arg: String,
    pub value: Expr,
}

/// One name in an `import` / `from ... import` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub name: String,
    #[serde(default)]
    pub asname: Option<String>,
}

impl Alias {
    /// The name the import binds: the alias, or for dotted imports the
    /// first component of the module path.
    #[must_use]
    pub fn binding(&self) -> &str {
        match &self.asname {
            Some(asname) => asname,
            None => self.name.split('.').next().unwrap_or(&self.name),
        }
    }
}

/// One `for target in iter [if cond]*` clause of a comprehension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comprehension {
    pub target: Expr,
    pub iter: Expr,
    #[serde(default)]
    pub ifs: Vec<Expr>,
}

/// One `except [class [as name]]:` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptHandler {
    #[serde(default)]
    pub class: Option<Expr>,
    #[serde(default)]
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

/// A function expression: the single unified node the desugarer produces for
/// `def`, `lambda`, and comprehension bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionExpr {
    pub name: String,
    pub args: Arguments,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub scope_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Literal(Literal),
    Name {
        id: String,
        ctx: Ctx,
    },
    UnaryOp {
        op: UnaryKind,
        operand: Box<Expr>,
    },
    BinOp {
        left: Box<Expr>,
        op: BinKind,
        right: Box<Expr>,
    },
    /// A single comparison; chained comparisons are outside the subset.
    Compare {
        left: Box<Expr>,
        op: CmpKind,
        right: Box<Expr>,
    },
    BoolOp {
        op: BoolKind,
        values: Vec<Expr>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
        ctx: Ctx,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
        ctx: Ctx,
    },
    List {
        elts: Vec<Expr>,
        ctx: Ctx,
    },
    Tuple {
        elts: Vec<Expr>,
        ctx: Ctx,
    },
    Dict {
        keys: Vec<Expr>,
        values: Vec<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        #[serde(default)]
        keywords: Vec<Keyword>,
        #[serde(default)]
        starargs: Option<Box<Expr>>,
        #[serde(default)]
        kwargs: Option<Box<Expr>>,
    },
    /// Sugar; eliminated by the desugarer.
    Lambda {
        args: Arguments,
        body: Box<Expr>,
    },
    /// Sugar; eliminated by the desugarer.
    ListComp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    /// Introduced by the desugarer; never produced by front ends.
    Function(Box<FunctionExpr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    Expr(Expr),
    Assign {
        targets: Vec<Expr>,
        value: Expr,
    },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Raise {
        #[serde(default)]
        exc: Option<Expr>,
        #[serde(default)]
        cause: Option<Expr>,
    },
    Try {
        body: Vec<Stmt>,
        #[serde(default)]
        handlers: Vec<ExceptHandler>,
        #[serde(default)]
        orelse: Vec<Stmt>,
        #[serde(default)]
        finalbody: Vec<Stmt>,
    },
    Break,
    Continue,
    Import(Vec<Alias>),
    ImportFrom {
        module: String,
        names: Vec<Alias>,
        #[serde(default)]
        level: u32,
    },
    Pass,
    ClassDef {
        name: String,
        bases: Vec<Expr>,
        body: Vec<Stmt>,
        #[serde(default)]
        scope_id: u32,
    },
    /// Sugar; eliminated by the desugarer.
    FunctionDef {
        name: String,
        args: Arguments,
        body: Vec<Stmt>,
        #[serde(default)]
        decorators: Vec<Expr>,
    },
    /// Sugar; eliminated by the desugarer.
    Assert {
        test: Expr,
        #[serde(default)]
        msg: Option<Expr>,
    },
}

impl Stmt {
    #[must_use]
    pub fn new(kind: StmtKind) -> Self {
        Self { line: 0, kind }
    }

    /// Sets the source line, builder-style.
    #[must_use]
    pub fn at(mut self, line: u32) -> Self {
        self.line = line;
        self
    }
}

impl Expr {
    #[must_use]
    pub fn new(kind: ExprKind) -> Self {
        Self { line: 0, kind }
    }

    #[must_use]
    pub fn at(mut self, line: u32) -> Self {
        self.line = line;
        self
    }
}

/// Returns the docstring of a function or class body: the leading statement
/// when it is a bare string literal.
#[must_use]
pub fn docstring(body: &[Stmt]) -> Option<&str> {
    match body.first().map(|stmt| &stmt.kind) {
        Some(StmtKind::Expr(Expr {
            kind: ExprKind::Literal(Literal::Str(text)),
            ..
        })) => Some(text),
        _ => None,
    }
}

/// Shorthand constructors for building trees in host code and tests.
///
/// These mirror how an external front end assembles nodes; every constructor
/// leaves `line` at 0 so the repair pass (or an explicit `.at(line)`) decides
/// placement.
pub mod build {
    use super::*;

    #[must_use]
    pub fn module(body: Vec<Stmt>) -> Module {
        Module { body }
    }

    // --- expressions ---

    #[must_use]
    pub fn name(id: &str) -> Expr {
        Expr::new(ExprKind::Name {
            id: id.to_owned(),
            ctx: Ctx::Load,
        })
    }

    #[must_use]
    pub fn store(id: &str) -> Expr {
        Expr::new(ExprKind::Name {
            id: id.to_owned(),
            ctx: Ctx::Store,
        })
    }

    #[must_use]
    pub fn int(value: i64) -> Expr {
        Expr::new(ExprKind::Literal(Literal::Int(value)))
    }

    #[must_use]
    pub fn float(value: f64) -> Expr {
        Expr::new(ExprKind::Literal(Literal::Float(value)))
    }

    #[must_use]
    pub fn str(value: &str) -> Expr {
        Expr::new(ExprKind::Literal(Literal::Str(value.to_owned())))
    }

    #[must_use]
    pub fn none() -> Expr {
        Expr::new(ExprKind::Literal(Literal::None))
    }

    #[must_use]
    pub fn bool(value: bool) -> Expr {
        Expr::new(ExprKind::Literal(Literal::Bool(value)))
    }

    #[must_use]
    pub fn binop(left: Expr, op: BinKind, right: Expr) -> Expr {
        Expr::new(ExprKind::BinOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    #[must_use]
    pub fn unary(op: UnaryKind, operand: Expr) -> Expr {
        Expr::new(ExprKind::UnaryOp {
            op,
            operand: Box::new(operand),
        })
    }

    #[must_use]
    pub fn compare(left: Expr, op: CmpKind, right: Expr) -> Expr {
        Expr::new(ExprKind::Compare {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    #[must_use]
    pub fn boolop(op: BoolKind, values: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::BoolOp { op, values })
    }

    #[must_use]
    pub fn ifexp(test: Expr, body: Expr, orelse: Expr) -> Expr {
        Expr::new(ExprKind::IfExp {
            test: Box::new(test),
            body: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    #[must_use]
    pub fn attr(value: Expr, attr: &str) -> Expr {
        Expr::new(ExprKind::Attribute {
            value: Box::new(value),
            attr: attr.to_owned(),
            ctx: Ctx::Load,
        })
    }

    #[must_use]
    pub fn attr_store(value: Expr, attr: &str) -> Expr {
        Expr::new(ExprKind::Attribute {
            value: Box::new(value),
            attr: attr.to_owned(),
            ctx: Ctx::Store,
        })
    }

    #[must_use]
    pub fn subscript(value: Expr, index: Expr) -> Expr {
        Expr::new(ExprKind::Subscript {
            value: Box::new(value),
            index: Box::new(index),
            ctx: Ctx::Load,
        })
    }

    #[must_use]
    pub fn list(elts: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::List {
            elts,
            ctx: Ctx::Load,
        })
    }

    #[must_use]
    pub fn tuple(elts: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::Tuple {
            elts,
            ctx: Ctx::Load,
        })
    }

    #[must_use]
    pub fn dict(pairs: Vec<(Expr, Expr)>) -> Expr {
        let (keys, values) = pairs.into_iter().unzip();
        Expr::new(ExprKind::Dict { keys, values })
    }

    #[must_use]
    pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::Call {
            func: Box::new(func),
            args,
            keywords: Vec::new(),
            starargs: None,
            kwargs: None,
        })
    }

    #[must_use]
    pub fn call_kw(func: Expr, args: Vec<Expr>, keywords: Vec<(&str, Expr)>) -> Expr {
        Expr::new(ExprKind::Call {
            func: Box::new(func),
            args,
            keywords: keywords
                .into_iter()
                .map(|(arg, value)| Keyword {
                    arg: arg.to_owned(),
                    value,
                })
                .collect(),
            starargs: None,
            kwargs: None,
        })
    }

    #[must_use]
    pub fn lambda(params: &[&str], body: Expr) -> Expr {
        Expr::new(ExprKind::Lambda {
            args: params_of(params),
            body: Box::new(body),
        })
    }

    // --- statements ---

    #[must_use]
    pub fn expr_stmt(expr: Expr) -> Stmt {
        Stmt::new(StmtKind::Expr(expr))
    }

    #[must_use]
    pub fn assign(target: Expr, value: Expr) -> Stmt {
        Stmt::new(StmtKind::Assign {
            targets: vec![target],
            value,
        })
    }

    #[must_use]
    pub fn assign_many(targets: Vec<Expr>, value: Expr) -> Stmt {
        Stmt::new(StmtKind::Assign { targets, value })
    }

    #[must_use]
    pub fn ret(value: Expr) -> Stmt {
        Stmt::new(StmtKind::Return(Some(value)))
    }

    #[must_use]
    pub fn ret_none() -> Stmt {
        Stmt::new(StmtKind::Return(None))
    }

    #[must_use]
    pub fn pass() -> Stmt {
        Stmt::new(StmtKind::Pass)
    }

    #[must_use]
    pub fn if_(test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::If { test, body, orelse })
    }

    #[must_use]
    pub fn while_(test: Expr, body: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::While { test, body })
    }

    #[must_use]
    pub fn for_(target: Expr, iter: Expr, body: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::For { target, iter, body })
    }

    #[must_use]
    pub fn raise(exc: Expr) -> Stmt {
        Stmt::new(StmtKind::Raise {
            exc: Some(exc),
            cause: None,
        })
    }

    #[must_use]
    pub fn def(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::FunctionDef {
            name: name.to_owned(),
            args: params_of(params),
            body,
            decorators: Vec::new(),
        })
    }

    #[must_use]
    pub fn class(name: &str, bases: Vec<Expr>, body: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::ClassDef {
            name: name.to_owned(),
            bases,
            body,
            scope_id: 0,
        })
    }

    #[must_use]
    pub fn assert(test: Expr, msg: Option<Expr>) -> Stmt {
        Stmt::new(StmtKind::Assert { test, msg })
    }

    #[must_use]
    pub fn params_of(params: &[&str]) -> Arguments {
        Arguments {
            args: params.iter().map(|&p| p.to_owned()).collect(),
            vararg: None,
            kwarg: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docstring_is_leading_string_literal() {
        let body = vec![
            build::expr_stmt(build::str("doc")),
            build::ret(build::int(1)),
        ];
        assert_eq!(docstring(&body), Some("doc"));
        assert_eq!(docstring(&body[1..]), None);
        assert_eq!(docstring(&[]), None);
    }

    #[test]
    fn alias_binding_uses_first_dotted_component() {
        let plain = Alias {
            name: "os.path".to_owned(),
            asname: None,
        };
        assert_eq!(plain.binding(), "os");
        let renamed = Alias {
            name: "os.path".to_owned(),
            asname: Some("p".to_owned()),
        };
        assert_eq!(renamed.binding(), "p");
    }

    #[test]
    fn serde_round_trip() {
        let module = build::module(vec![build::assign(
            build::store("x"),
            build::binop(build::int(2), BinKind::Mul, build::int(3)),
        )
        .at(1)]);
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(back, module);
    }
}
