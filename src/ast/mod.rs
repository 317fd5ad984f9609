//! Abstract Syntax Tree for Skiff.
//!
//! The tree is produced by an external parser and consumed by the bytecode
//! compiler. Every node carries a [`Span`](crate::span::Span) so compile
//! errors and runtime traces can name source lines. Builder helpers on
//! [`Expr`] and [`Stmt`] let embedders and tests construct programs directly.

pub mod expr;
pub mod stmt;

pub use expr::{AstPattern, BinaryOp, Expr, ExprKind, UnaryOp};
pub use stmt::{ClassDecl, FunctionDecl, MatchArm, MethodDecl, Program, Stmt, StmtKind};
