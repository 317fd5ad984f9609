//! Statement AST nodes.

use crate::ast::expr::{AstPattern, Expr};
use crate::span::Span;

/// A statement in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Attach a source line to this node (builder style).
    pub fn at(mut self, line: u32) -> Self {
        self.span = Span::line(line);
        self
    }
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Expression statement: expr;
    Expression(Expr),

    /// Variable declaration with a destructuring pattern: var pat = expr;
    /// A plain `var x = expr;` uses an `AstPattern::Variable` pattern.
    Var {
        pattern: AstPattern,
        initializer: Option<Expr>,
    },

    /// Block: { statements }
    Block(Vec<Stmt>),

    /// If statement: if (cond) { ... } else { ... }
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },

    /// While loop: while (cond) { ... }
    While { condition: Expr, body: Box<Stmt> },

    /// Foreach loop: foreach pat : iterable { ... }
    /// The pattern is re-evaluated and re-bound on every iteration.
    ForEach {
        pattern: AstPattern,
        iterable: Expr,
        body: Box<Stmt>,
    },

    /// Break out of the innermost loop.
    Break,

    /// Continue the innermost loop.
    Continue,

    /// Return statement: return expr;
    Return(Option<Expr>),

    /// Assertion: assert cond [, message];
    /// `text` is the condition's source text, used when no message is given.
    Assert {
        condition: Expr,
        message: Option<Expr>,
        text: String,
    },

    /// Match statement: match (expr) { case pat [if guard] -> { ... } ... }
    Match { target: Expr, arms: Vec<MatchArm> },

    /// Function declaration
    Function(FunctionDecl),

    /// Class declaration
    Class(ClassDecl),
}

/// A single arm in a match statement.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: AstPattern,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// Function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    /// When true, the trailing parameter collects excess arguments as a list.
    pub varargs: bool,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// Class declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    /// Superclass expression, compiled before any method body.
    pub superclass: Option<Expr>,
    pub methods: Vec<MethodDecl>,
    pub static_methods: Vec<MethodDecl>,
    /// Statements executed once, right after the class object is built.
    pub static_init: Vec<Stmt>,
    pub span: Span,
}

/// Method declaration in a class. The initializer is a method named `init`.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDecl {
    pub name: String,
    pub params: Vec<String>,
    pub varargs: bool,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// A complete program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Self { statements }
    }
}

// Builder helpers; the parser collaborator produces the same shapes.
impl Stmt {
    pub fn expr(e: Expr) -> Stmt {
        let span = e.span;
        Stmt::new(StmtKind::Expression(e), span)
    }

    pub fn var(name: impl Into<String>, initializer: Expr) -> Stmt {
        let span = initializer.span;
        Stmt::new(
            StmtKind::Var {
                pattern: AstPattern::Variable(name.into()),
                initializer: Some(initializer),
            },
            span,
        )
    }

    pub fn var_pattern(pattern: AstPattern, initializer: Expr) -> Stmt {
        let span = initializer.span;
        Stmt::new(
            StmtKind::Var {
                pattern,
                initializer: Some(initializer),
            },
            span,
        )
    }

    pub fn block(statements: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::Block(statements), Span::default())
    }

    pub fn if_(condition: Expr, then_branch: Stmt, else_branch: Option<Stmt>) -> Stmt {
        let span = condition.span;
        Stmt::new(
            StmtKind::If {
                condition,
                then_branch: Box::new(then_branch),
                else_branch: else_branch.map(Box::new),
            },
            span,
        )
    }

    pub fn while_(condition: Expr, body: Stmt) -> Stmt {
        let span = condition.span;
        Stmt::new(
            StmtKind::While {
                condition,
                body: Box::new(body),
            },
            span,
        )
    }

    pub fn foreach(pattern: AstPattern, iterable: Expr, body: Stmt) -> Stmt {
        let span = iterable.span;
        Stmt::new(
            StmtKind::ForEach {
                pattern,
                iterable,
                body: Box::new(body),
            },
            span,
        )
    }

    pub fn ret(value: Option<Expr>) -> Stmt {
        Stmt::new(StmtKind::Return(value), Span::default())
    }

    pub fn func(name: impl Into<String>, params: Vec<&str>, body: Vec<Stmt>) -> Stmt {
        Stmt::new(
            StmtKind::Function(FunctionDecl {
                name: name.into(),
                params: params.into_iter().map(String::from).collect(),
                varargs: false,
                body,
                span: Span::default(),
            }),
            Span::default(),
        )
    }
}
