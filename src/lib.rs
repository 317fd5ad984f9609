//! Skiff: an embeddable scripting-language runtime.
//!
//! Skiff takes an AST produced by an external parser, compiles it to
//! bytecode in a single pass, and executes it on a stack-based virtual
//! machine with closures, classes and structural pattern matching.
//!
//! # Embedding
//!
//! ```no_run
//! use skiff::ast::{Expr, Program, Stmt};
//! use skiff::bytecode::{compile, VM};
//!
//! let program = Program::new(vec![Stmt::var("answer", Expr::number(42.0))]);
//! let function = compile("demo.sk", &program).unwrap();
//!
//! let mut vm = VM::new();
//! vm.interpret(function).unwrap();
//! assert!(vm.get_global("answer").is_some());
//! ```
//!
//! Hosts extend the runtime with [`bytecode::VM::define_native`] for free
//! functions and [`bytecode::VM::register_native_type`] for classes scripts
//! can inherit from, and call back into script code with
//! [`bytecode::VM::call_from_host`].

pub mod ast;
pub mod bytecode;
pub mod error;
pub mod pattern;
pub mod span;
pub mod value;

use std::rc::Rc;

use error::SkiffError;

pub use bytecode::{compile, VM};
pub use value::Value;

/// Compile and run a program, returning the script's result value.
pub fn run(script: &str, program: &ast::Program) -> Result<Value, SkiffError> {
    let mut vm = VM::new();
    run_in(&mut vm, script, program)
}

/// Compile and run a program on an existing VM, keeping its globals and
/// registered natives.
pub fn run_in(vm: &mut VM, script: &str, program: &ast::Program) -> Result<Value, SkiffError> {
    let function = compile(script, program)?;
    Ok(vm.interpret(function)?)
}

/// Disassemble compiled bytecode to a string.
pub fn disassemble(function: &Rc<bytecode::Function>) -> String {
    bytecode::disassemble_function(function)
}
