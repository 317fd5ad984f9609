//! Bytecode chunk containing instructions and constants.

use std::fmt;
use std::rc::Rc;

use crate::bytecode::instruction::OpCode;
use crate::pattern::CompiledPattern;

/// A chunk of bytecode containing instructions and metadata.
///
/// Chunks are immutable once compilation finishes; the VM only reads them.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// The bytecode instructions.
    pub code: Vec<u8>,
    /// The constant pool.
    pub constants: Vec<Constant>,
    /// Line information for debugging (one entry per code byte).
    pub lines: Vec<u32>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an opcode to the chunk.
    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.code.push(op as u8);
        self.lines.push(line);
    }

    /// Write a raw byte to the chunk.
    pub fn write_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Write a 16-bit value to the chunk (little-endian).
    pub fn write_u16(&mut self, value: u16, line: u32) {
        self.code.push((value & 0xff) as u8);
        self.lines.push(line);
        self.code.push((value >> 8) as u8);
        self.lines.push(line);
    }

    /// Read a 16-bit value from the chunk at offset.
    pub fn read_u16(&self, offset: usize) -> u16 {
        let lo = self.code[offset] as u16;
        let hi = self.code[offset + 1] as u16;
        lo | (hi << 8)
    }

    /// Add a constant to the pool and return its index.
    ///
    /// Scalar constants are deduplicated; functions and patterns are each
    /// unique and always get a fresh slot.
    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        if constant.is_scalar() {
            for (i, c) in self.constants.iter().enumerate() {
                if c == &constant {
                    return i as u16;
                }
            }
        }
        let index = self.constants.len();
        assert!(index < 65536, "Too many constants in chunk");
        self.constants.push(constant);
        index as u16
    }

    /// Get the current offset in the code.
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Patch a jump instruction's offset at the given location.
    pub fn patch_jump(&mut self, offset: usize) {
        // offset points to the first byte of the 16-bit jump offset
        let jump_distance = self.code.len() - offset - 2;
        assert!(jump_distance < 65536, "Jump too large");

        self.code[offset] = (jump_distance & 0xff) as u8;
        self.code[offset + 1] = (jump_distance >> 8) as u8;
    }

    /// Patch a u16 value at the given offset.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.code[offset] = (value & 0xff) as u8;
        self.code[offset + 1] = (value >> 8) as u8;
    }

    /// Get the line number at a given offset.
    pub fn get_line(&self, offset: usize) -> u32 {
        if offset < self.lines.len() {
            self.lines[offset]
        } else {
            0
        }
    }
}

/// A constant value in the constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    /// Number constant
    Number(f64),
    /// String constant (also used for identifiers)
    String(Rc<str>),
    /// Keyword constant
    Keyword(Rc<str>),
    /// Boolean constant
    Bool(bool),
    /// Null constant
    Null,
    /// Function constant
    Function(Rc<Function>),
    /// Compiled destructuring pattern
    Pattern(Rc<CompiledPattern>),
}

impl Constant {
    pub fn string(s: impl AsRef<str>) -> Constant {
        Constant::String(Rc::from(s.as_ref()))
    }

    fn is_scalar(&self) -> bool {
        !matches!(self, Constant::Function(_) | Constant::Pattern(_))
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Number(a), Constant::Number(b)) => a == b,
            (Constant::String(a), Constant::String(b)) => a == b,
            (Constant::Keyword(a), Constant::Keyword(b)) => a == b,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Null, Constant::Null) => true,
            // Functions and patterns are never equal (each is unique)
            _ => false,
        }
    }
}

/// What kind of function a chunk belongs to; drives trace wording and
/// `this`/`super`/`return` validation in the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Top-level script body
    Script,
    /// Named function declaration
    Function,
    /// Anonymous function expression
    Lambda,
    /// Instance method
    Method,
    /// The `init` method
    Initializer,
    /// Static method
    StaticMethod,
    /// Class-body statements run once at class definition
    StaticInitializer,
}

impl FunctionKind {
    /// The noun used in stack traces.
    pub fn describe(self) -> &'static str {
        match self {
            FunctionKind::Script => "script",
            FunctionKind::Function => "function",
            FunctionKind::Lambda => "lambda",
            FunctionKind::Method => "method",
            FunctionKind::Initializer => "initializer",
            FunctionKind::StaticMethod => "static method",
            FunctionKind::StaticInitializer => "static initializer",
        }
    }
}

/// A compiled function (bytecode representation).
#[derive(Debug, Clone)]
pub struct Function {
    /// Function name; the top level is named after its script, e.g.
    /// "<main.sk>".
    pub name: Rc<str>,
    pub kind: FunctionKind,
    /// Parameter names, in declaration order.
    pub params: Vec<Rc<str>>,
    /// When true, the trailing parameter collects excess arguments.
    pub varargs: bool,
    /// Number of upvalues captured by closures over this function.
    pub upvalue_count: usize,
    /// The bytecode chunk.
    pub chunk: Chunk,
    /// Line of the declaration, for traces.
    pub line: u32,
}

impl Function {
    pub fn new(name: impl AsRef<str>, kind: FunctionKind) -> Self {
        Self {
            name: Rc::from(name.as_ref()),
            kind,
            params: Vec::new(),
            varargs: false,
            upvalue_count: 0,
            chunk: Chunk::new(),
            line: 0,
        }
    }

    /// Minimum number of arguments a call must supply.
    pub fn arity(&self) -> usize {
        if self.varargs {
            self.params.len() - 1
        } else {
            self.params.len()
        }
    }

    /// Human-readable signature, e.g. `sum(a, ..rest)`.
    pub fn signature(&self) -> String {
        let mut out = String::from(&*self.name);
        out.push('(');
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            if self.varargs && i == self.params.len() - 1 {
                out.push_str("..");
            }
            out.push_str(param);
        }
        out.push(')');
        out
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn {}>", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_basics() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_u16(0, 1);
        chunk.write_op(OpCode::Return, 1);

        assert_eq!(chunk.code.len(), 4);
        assert_eq!(chunk.code[0], OpCode::Constant as u8);
        assert_eq!(chunk.read_u16(1), 0);
        assert_eq!(chunk.code[3], OpCode::Return as u8);
        assert_eq!(chunk.get_line(3), 1);
    }

    #[test]
    fn test_constant_pool_dedups_scalars() {
        let mut chunk = Chunk::new();
        let idx1 = chunk.add_constant(Constant::Number(42.0));
        let idx2 = chunk.add_constant(Constant::Number(42.0));
        let idx3 = chunk.add_constant(Constant::string("hello"));

        assert_eq!(idx1, 0);
        assert_eq!(idx2, 0);
        assert_eq!(idx3, 1);
    }

    #[test]
    fn test_functions_never_dedup() {
        let mut chunk = Chunk::new();
        let f1 = Rc::new(Function::new("f", FunctionKind::Function));
        let f2 = Rc::new(Function::new("f", FunctionKind::Function));
        let idx1 = chunk.add_constant(Constant::Function(f1));
        let idx2 = chunk.add_constant(Constant::Function(f2));
        assert_ne!(idx1, idx2);
    }

    #[test]
    fn test_jump_patching() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::JumpIfFalse, 1);
        let jump_offset = chunk.current_offset();
        chunk.write_u16(0xFFFF, 1); // Placeholder

        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Pop, 1);

        chunk.patch_jump(jump_offset);

        // Should jump over 2 Pop instructions (2 bytes)
        assert_eq!(chunk.read_u16(jump_offset), 2);
    }

    #[test]
    fn test_signature_formatting() {
        let mut f = Function::new("sum", FunctionKind::Function);
        f.params = vec![Rc::from("a"), Rc::from("rest")];
        f.varargs = true;
        assert_eq!(f.signature(), "sum(a, ..rest)");
        assert_eq!(f.arity(), 1);
    }
}
