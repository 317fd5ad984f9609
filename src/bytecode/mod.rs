//! Bytecode backend for the Skiff runtime.
//!
//! # Architecture
//!
//! - `instruction`: OpCode definitions for the bytecode instruction set
//! - `chunk`: Bytecode chunks containing instructions and constant pools
//! - `compiler`: Single-pass AST to bytecode compiler
//! - `vm`: Stack-based virtual machine for executing bytecode
//! - `disassembler`: Debug output for bytecode inspection

pub mod chunk;
pub mod compiler;
pub mod disassembler;
pub mod instruction;
pub mod vm;

pub use chunk::{Chunk, Constant, Function, FunctionKind};
pub use compiler::compile;
pub use disassembler::{disassemble_function, print_disassembly};
pub use instruction::OpCode;
pub use vm::VM;
