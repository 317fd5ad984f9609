//! Bytecode instruction definitions for the Skiff VM.

/// Opcodes for the bytecode virtual machine.
///
/// Multi-byte operands are little-endian u16 unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // ============ Constants & Stack ============
    /// Load a constant from the constant pool: CONSTANT <index:u16>
    Constant = 0,
    /// Push null onto the stack
    Null,
    /// Push true onto the stack
    True,
    /// Push false onto the stack
    False,
    /// Pop the top value from the stack
    Pop,
    /// Duplicate the top value on the stack
    Dup,
    /// Duplicate the top two values on the stack: a b -> a b a b
    Dup2,

    // ============ Variables ============
    /// Get a local variable: GET_LOCAL <slot:u16>
    GetLocal,
    /// Set a local variable: SET_LOCAL <slot:u16>
    SetLocal,
    /// Get a global variable: GET_GLOBAL <name_index:u16>
    GetGlobal,
    /// Set a global variable: SET_GLOBAL <name_index:u16>
    SetGlobal,
    /// Define a global variable: DEFINE_GLOBAL <name_index:u16>
    DefineGlobal,
    /// Get an upvalue (captured variable): GET_UPVALUE <index:u8>
    GetUpvalue,
    /// Set an upvalue: SET_UPVALUE <index:u8>
    SetUpvalue,
    /// Close the upvalue aliasing the top stack slot, then pop it
    CloseUpvalue,

    // ============ Arithmetic ============
    /// Add two values: a + b
    Add,
    /// Subtract two values: a - b
    Subtract,
    /// Multiply two values: a * b
    Multiply,
    /// Divide two values: a / b
    Divide,
    /// Modulo: a % b
    Modulo,
    /// Negate a value: -a
    Negate,

    // ============ Comparison ============
    /// Equal: a == b
    Equal,
    /// Not equal: a != b
    NotEqual,
    /// Less than: a < b
    Less,
    /// Less or equal: a <= b
    LessEqual,
    /// Greater than: a > b
    Greater,
    /// Greater or equal: a >= b
    GreaterEqual,

    // ============ Logic ============
    /// Logical not: !a
    Not,

    // ============ Control Flow ============
    /// Unconditional forward jump: JUMP <offset:u16>
    Jump,
    /// Jump forward if top of stack is falsey, without popping:
    /// JUMP_IF_FALSE <offset:u16>
    JumpIfFalse,
    /// Jump forward if top of stack is truthy, without popping:
    /// JUMP_IF_TRUE <offset:u16>
    JumpIfTrue,
    /// Loop back: LOOP <offset:u16>
    Loop,

    // ============ Functions & Calls ============
    /// Call a value: CALL <arg_count:u8>
    Call,
    /// Return from the current function
    Return,
    /// Create a closure: CLOSURE <func_index:u16> [is_local:u8 index:u8]...
    Closure,

    // ============ Classes & Objects ============
    /// Create a class: CLASS <name_index:u16>
    Class,
    /// Inherit: copies the superclass method table into the subclass
    Inherit,
    /// Define a method from the stack top: METHOD <name_index:u16>
    Method,
    /// Define a static method: STATIC_METHOD <name_index:u16>
    StaticMethod,
    /// Get a property: GET_PROPERTY <name_index:u16>
    GetProperty,
    /// Set a property: SET_PROPERTY <name_index:u16>
    SetProperty,
    /// Look up a method on the static superclass: GET_SUPER <name_index:u16>
    GetSuper,

    // ============ Collections ============
    /// Build a list from the top n stack values: BUILD_LIST <count:u16>
    BuildList,
    /// Build a map from the top n key/value pairs: BUILD_MAP <pair_count:u16>
    BuildMap,
    /// Get element by index: obj[index]
    Index,
    /// Set element by index: obj[index] = value
    IndexSet,

    // ============ Iteration ============
    /// Pop an iterable, push its iterator
    GetIterator,
    /// Advance the iterator on top of the stack, pushing the next element,
    /// or jump forward when exhausted: ITER_NEXT <offset:u16>
    IterNext,

    // ============ Patterns ============
    /// Match a value against a pattern, binding into local slots:
    /// MATCH_LOCAL <pattern_index:u16> <base_slot:u16>
    /// Pops the target and the pattern's constant list, pushes a bool.
    MatchLocal,
    /// Match and bind into globals: MATCH_GLOBAL <pattern_index:u16>
    MatchGlobal,
    /// Raise a runtime fault for an irrefutable pattern that failed;
    /// the failing target is on top of the stack
    PatternFail,

    // ============ Assertions ============
    /// Pop a message and raise an assertion fault with it
    Assert,
}

impl OpCode {
    /// The number of fixed operand bytes for this opcode.
    ///
    /// `Closure` additionally carries two bytes per upvalue; the reader
    /// gets that count from the function constant.
    pub fn operand_size(self) -> usize {
        match self {
            // No operands
            OpCode::Null
            | OpCode::True
            | OpCode::False
            | OpCode::Pop
            | OpCode::Dup
            | OpCode::Dup2
            | OpCode::CloseUpvalue
            | OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Modulo
            | OpCode::Negate
            | OpCode::Equal
            | OpCode::NotEqual
            | OpCode::Less
            | OpCode::LessEqual
            | OpCode::Greater
            | OpCode::GreaterEqual
            | OpCode::Not
            | OpCode::Return
            | OpCode::Inherit
            | OpCode::Index
            | OpCode::IndexSet
            | OpCode::GetIterator
            | OpCode::PatternFail
            | OpCode::Assert => 0,

            // 1 byte operand
            OpCode::Call | OpCode::GetUpvalue | OpCode::SetUpvalue => 1,

            // 2 byte operand
            OpCode::Constant
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::DefineGlobal
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTrue
            | OpCode::Loop
            | OpCode::Closure
            | OpCode::Class
            | OpCode::Method
            | OpCode::StaticMethod
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::BuildList
            | OpCode::BuildMap
            | OpCode::IterNext
            | OpCode::MatchGlobal => 2,

            // 4 byte operand (2 bytes + 2 bytes)
            OpCode::MatchLocal => 4,
        }
    }

    /// Convert from u8 to OpCode.
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        if byte <= OpCode::Assert as u8 {
            Some(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            None
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

/// Information about an upvalue for closure creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueInfo {
    /// True if this upvalue captures a local in the enclosing function,
    /// false if it captures an upvalue from the enclosing function.
    pub is_local: bool,
    /// The index of the local or upvalue being captured.
    pub index: u8,
}

impl UpvalueInfo {
    pub fn new(is_local: bool, index: u8) -> Self {
        Self { is_local, index }
    }
}
