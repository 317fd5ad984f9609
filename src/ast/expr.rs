//! Expression AST nodes.

use crate::ast::stmt::Stmt;
use crate::span::Span;

/// An expression in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Attach a source line to this node (builder style).
    pub fn at(mut self, line: u32) -> Self {
        self.span = Span::line(line);
        self
    }
}

/// All expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Number literal: 42, 3.14
    Number(f64),
    /// String literal: "hello"
    Str(String),
    /// Keyword literal: #name
    Keyword(String),
    /// Boolean literal: true, false
    Bool(bool),
    /// Null literal
    Null,

    /// Variable reference: foo
    Variable(String),

    /// Binary operation: a + b
    Binary {
        left: Box<Expr>,
        operator: BinaryOp,
        right: Box<Expr>,
    },

    /// Unary operation: -x, !x
    Unary {
        operator: UnaryOp,
        operand: Box<Expr>,
    },

    /// Grouping expression: (expr)
    Grouping(Box<Expr>),

    /// Logical and: a && b (short-circuit)
    LogicalAnd { left: Box<Expr>, right: Box<Expr> },

    /// Logical or: a || b (short-circuit)
    LogicalOr { left: Box<Expr>, right: Box<Expr> },

    /// Assignment: x = v, obj.p = v, a[i] = v
    Assign { target: Box<Expr>, value: Box<Expr> },

    /// Compound assignment: x += v and friends. The target location's
    /// sub-expressions are evaluated exactly once.
    CompoundAssign {
        target: Box<Expr>,
        operator: BinaryOp,
        value: Box<Expr>,
    },

    /// Pre/post increment or decrement: ++x, x--, obj.p++, a[i]--
    Increment {
        target: Box<Expr>,
        /// +1.0 for increment, -1.0 for decrement.
        delta: f64,
        /// True for prefix (yields the new value), false for postfix.
        prefix: bool,
    },

    /// Function call: foo(a, b)
    Call {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
    },

    /// Lambda: \a, b -> { ... }
    Lambda {
        params: Vec<String>,
        varargs: bool,
        body: Vec<Stmt>,
    },

    /// Property access: obj.field
    Member { object: Box<Expr>, name: String },

    /// Index access: obj[index]
    Index { object: Box<Expr>, index: Box<Expr> },

    /// this reference
    This,

    /// super.method reference (always names the method being looked up)
    Super { method: String },

    /// List literal: [1, 2, 3]
    List(Vec<Expr>),

    /// Map literal: { key: value, ... }
    Map(Vec<(Expr, Expr)>),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Subtract => write!(f, "-"),
            BinaryOp::Multiply => write!(f, "*"),
            BinaryOp::Divide => write!(f, "/"),
            BinaryOp::Modulo => write!(f, "%"),
            BinaryOp::Equal => write!(f, "=="),
            BinaryOp::NotEqual => write!(f, "!="),
            BinaryOp::Less => write!(f, "<"),
            BinaryOp::LessEqual => write!(f, "<="),
            BinaryOp::Greater => write!(f, ">"),
            BinaryOp::GreaterEqual => write!(f, ">="),
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnaryOp::Negate => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
        }
    }
}

/// Destructuring patterns as written in source, before the compiler lowers
/// them into [`crate::pattern::Pattern`] constant-pool entries.
#[derive(Debug, Clone, PartialEq)]
pub enum AstPattern {
    /// Wildcard: _
    Wildcard,
    /// Variable binding: name
    Variable(String),
    /// Bind-and-continue: name = subpattern
    Binding(String, Box<AstPattern>),
    /// Equality test against an interpolated constant: $expr or a literal
    Constant(Expr),
    /// List pattern with optional tail variable: [a, b : rest]
    List(Vec<AstPattern>, Option<String>),
    /// Map pattern; keys are constant expressions: { #a: x, #b: 2 }
    Map(Vec<(Expr, AstPattern)>),
}

// Builder helpers; the parser collaborator produces the same shapes.
impl Expr {
    pub fn number(n: f64) -> Expr {
        Expr::new(ExprKind::Number(n), Span::default())
    }

    pub fn string(s: impl Into<String>) -> Expr {
        Expr::new(ExprKind::Str(s.into()), Span::default())
    }

    pub fn keyword(s: impl Into<String>) -> Expr {
        Expr::new(ExprKind::Keyword(s.into()), Span::default())
    }

    pub fn bool(b: bool) -> Expr {
        Expr::new(ExprKind::Bool(b), Span::default())
    }

    pub fn null() -> Expr {
        Expr::new(ExprKind::Null, Span::default())
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::new(ExprKind::Variable(name.into()), Span::default())
    }

    pub fn binary(left: Expr, operator: BinaryOp, right: Expr) -> Expr {
        let span = left.span;
        Expr::new(
            ExprKind::Binary {
                left: Box::new(left),
                operator,
                right: Box::new(right),
            },
            span,
        )
    }

    pub fn unary(operator: UnaryOp, operand: Expr) -> Expr {
        let span = operand.span;
        Expr::new(
            ExprKind::Unary {
                operator,
                operand: Box::new(operand),
            },
            span,
        )
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        let span = left.span;
        Expr::new(
            ExprKind::LogicalAnd {
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        let span = left.span;
        Expr::new(
            ExprKind::LogicalOr {
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    pub fn assign(target: Expr, value: Expr) -> Expr {
        let span = target.span;
        Expr::new(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        )
    }

    pub fn compound(target: Expr, operator: BinaryOp, value: Expr) -> Expr {
        let span = target.span;
        Expr::new(
            ExprKind::CompoundAssign {
                target: Box::new(target),
                operator,
                value: Box::new(value),
            },
            span,
        )
    }

    pub fn incr(target: Expr, delta: f64, prefix: bool) -> Expr {
        let span = target.span;
        Expr::new(
            ExprKind::Increment {
                target: Box::new(target),
                delta,
                prefix,
            },
            span,
        )
    }

    pub fn call(callee: Expr, arguments: Vec<Expr>) -> Expr {
        let span = callee.span;
        Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                arguments,
            },
            span,
        )
    }

    pub fn lambda(params: Vec<&str>, body: Vec<Stmt>) -> Expr {
        Expr::new(
            ExprKind::Lambda {
                params: params.into_iter().map(String::from).collect(),
                varargs: false,
                body,
            },
            Span::default(),
        )
    }

    pub fn member(object: Expr, name: impl Into<String>) -> Expr {
        let span = object.span;
        Expr::new(
            ExprKind::Member {
                object: Box::new(object),
                name: name.into(),
            },
            span,
        )
    }

    pub fn index(object: Expr, index: Expr) -> Expr {
        let span = object.span;
        Expr::new(
            ExprKind::Index {
                object: Box::new(object),
                index: Box::new(index),
            },
            span,
        )
    }

    pub fn this() -> Expr {
        Expr::new(ExprKind::This, Span::default())
    }

    pub fn super_(method: impl Into<String>) -> Expr {
        Expr::new(
            ExprKind::Super {
                method: method.into(),
            },
            Span::default(),
        )
    }

    pub fn list(items: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::List(items), Span::default())
    }

    pub fn map(pairs: Vec<(Expr, Expr)>) -> Expr {
        Expr::new(ExprKind::Map(pairs), Span::default())
    }
}
