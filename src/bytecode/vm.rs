//! Stack-based virtual machine executing compiled chunks.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::chunk::{Chunk, Constant, Function, FunctionKind};
use crate::bytecode::instruction::OpCode;
use crate::error::RuntimeFault;
use crate::pattern;
use crate::value::{
    ClassObject, Closure, Globals, Instance, NativeFn, NativeFunction, NativeMethod, NativeType,
    Table, Upvalue, Value, ValueIter,
};

/// Maximum call depth.
const FRAMES_MAX: usize = 256;

/// Where a call frame came from. Returning from a host-origin frame hands
/// control back to the embedder instead of the calling chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOrigin {
    Host,
    Script,
}

/// A single call frame.
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    /// Stack index of slot 0 (the callee / receiver slot).
    base: usize,
    origin: FrameOrigin,
    /// Extra trace line for implicit calls, so a fault inside `init` is
    /// attributed to the class and not just the method.
    annotation: Option<String>,
}

impl CallFrame {
    fn chunk(&self) -> &Chunk {
        &self.closure.function.chunk
    }

    /// Trace line for this frame, pointing at the instruction being
    /// executed when the fault surfaced.
    fn trace_line(&self) -> String {
        let function = &self.closure.function;
        let line = function.chunk.get_line(self.ip.saturating_sub(1));
        match function.kind {
            FunctionKind::Script => format!("In {} (line {})", function.name, line),
            kind => format!("In {} {} (line {})", kind.describe(), function.signature(), line),
        }
    }
}

/// The bytecode virtual machine.
///
/// Faults are unrecoverable from script code; the VM unwinds to the nearest
/// host boundary, restores the stack, and hands the fault (with its trace)
/// to the embedder. The VM itself stays usable afterwards.
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Default global namespace; closures capture the namespace that was
    /// current when they were created.
    globals: Globals,
    /// Open upvalues, each aliasing a live stack slot.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl VM {
    pub fn new() -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            globals: Rc::new(RefCell::new(Table::default())),
            open_upvalues: Vec::new(),
        };
        vm.define_native("print", native_print);
        vm.define_native("println", native_println);
        vm.define_native("str", native_str);
        vm.define_native("len", native_len);
        vm.define_native("typeName", native_type_name);
        vm
    }

    /// Register a host function under a global name.
    pub fn define_native(&mut self, name: &'static str, func: NativeFn) {
        self.globals.borrow_mut().insert(
            name.to_string(),
            Value::Native(Rc::new(NativeFunction { name, func })),
        );
    }

    /// Register a host type as a global class scripted classes can extend.
    pub fn register_native_type(&mut self, native: NativeType) {
        let name = native.name.clone();
        let mut class = ClassObject::new(&name);
        class.native_ancestor = Some(Rc::new(native));
        self.globals
            .borrow_mut()
            .insert(name, Value::Class(Rc::new(RefCell::new(class))));
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.borrow_mut().insert(name.into(), value);
    }

    /// Run a compiled script to completion.
    pub fn interpret(&mut self, function: Rc<Function>) -> Result<Value, RuntimeFault> {
        let closure = Rc::new(Closure::new(function, self.globals.clone()));
        self.stack.push(Value::Closure(closure.clone()));
        let base = self.stack.len() - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
            origin: FrameOrigin::Host,
            annotation: None,
        });
        let boundary = self.frames.len() - 1;
        self.execute(boundary)
    }

    /// Call a script value from host code.
    ///
    /// Safe to invoke from inside a native function; the VM saves and
    /// restores its stack discipline around the call, so a fault raised by
    /// the callee leaves the interpreter exactly as it was.
    pub fn call_from_host(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeFault> {
        let stack_len = self.stack.len();
        let frame_len = self.frames.len();

        self.stack.push(callee);
        self.stack.extend_from_slice(args);

        let outcome = self
            .call_value(args.len(), FrameOrigin::Host)
            .and_then(|pushed_frame| {
                if pushed_frame {
                    self.execute(frame_len)
                } else {
                    Ok(self.pop())
                }
            });

        if outcome.is_err() {
            self.close_upvalues(stack_len);
            self.stack.truncate(stack_len);
            self.frames.truncate(frame_len);
        }
        outcome
    }

    // ===== Dispatch loop =====

    fn execute(&mut self, boundary: usize) -> Result<Value, RuntimeFault> {
        loop {
            match self.step() {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(fault) => return Err(self.unwind(fault, boundary)),
            }
        }
    }

    /// Execute one instruction. Returns a value when a host-origin frame
    /// returns.
    fn step(&mut self) -> Result<Option<Value>, RuntimeFault> {
        let op_byte = self.read_byte();
        let op = OpCode::from_u8(op_byte)
            .ok_or_else(|| RuntimeFault::new(format!("Unknown opcode {op_byte}")))?;

        match op {
            OpCode::Constant => {
                let idx = self.read_u16() as usize;
                let value = self.constant_value(idx)?;
                self.stack.push(value);
            }
            OpCode::Null => self.stack.push(Value::Null),
            OpCode::True => self.stack.push(Value::Bool(true)),
            OpCode::False => self.stack.push(Value::Bool(false)),
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                let top = self.peek(0).clone();
                self.stack.push(top);
            }
            OpCode::Dup2 => {
                let a = self.peek(1).clone();
                let b = self.peek(0).clone();
                self.stack.push(a);
                self.stack.push(b);
            }

            OpCode::GetLocal => {
                let slot = self.read_u16() as usize;
                let base = self.frame().base;
                let value = self.stack[base + slot].clone();
                self.stack.push(value);
            }
            OpCode::SetLocal => {
                let slot = self.read_u16() as usize;
                let base = self.frame().base;
                let value = self.peek(0).clone();
                self.stack[base + slot] = value;
            }
            OpCode::GetGlobal => {
                let name = self.read_identifier()?;
                let globals = self.frame().closure.globals.clone();
                let value = globals.borrow().get(&*name).cloned();
                match value {
                    Some(value) => self.stack.push(value),
                    None => {
                        return Err(RuntimeFault::new(format!("Undefined variable '{name}'")));
                    }
                }
            }
            OpCode::SetGlobal => {
                let name = self.read_identifier()?;
                let globals = self.frame().closure.globals.clone();
                let value = self.peek(0).clone();
                let mut globals = globals.borrow_mut();
                match globals.get_mut(&*name) {
                    Some(slot) => *slot = value,
                    None => {
                        return Err(RuntimeFault::new(format!("Undefined variable '{name}'")));
                    }
                }
            }
            OpCode::DefineGlobal => {
                let name = self.read_identifier()?;
                let globals = self.frame().closure.globals.clone();
                let value = self.pop();
                globals.borrow_mut().insert(name.to_string(), value);
            }
            OpCode::GetUpvalue => {
                let idx = self.read_byte() as usize;
                let upvalue = self.frame().closure.upvalues[idx].clone();
                let value = match &*upvalue.borrow() {
                    Upvalue::Open(slot) => self.stack[*slot].clone(),
                    Upvalue::Closed(value) => value.clone(),
                };
                self.stack.push(value);
            }
            OpCode::SetUpvalue => {
                let idx = self.read_byte() as usize;
                let upvalue = self.frame().closure.upvalues[idx].clone();
                let value = self.peek(0).clone();
                let slot = match &*upvalue.borrow() {
                    Upvalue::Open(slot) => Some(*slot),
                    Upvalue::Closed(_) => None,
                };
                match slot {
                    Some(slot) => self.stack[slot] = value,
                    None => *upvalue.borrow_mut() = Upvalue::Closed(value),
                }
            }
            OpCode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }

            OpCode::Add => self.add_values()?,
            OpCode::Subtract => self.numeric_binary("-", |a, b| a - b)?,
            OpCode::Multiply => self.numeric_binary("*", |a, b| a * b)?,
            OpCode::Divide => self.numeric_binary("/", |a, b| a / b)?,
            OpCode::Modulo => self.numeric_binary("%", |a, b| a % b)?,
            OpCode::Negate => {
                let value = self.pop();
                match value {
                    Value::Number(n) => self.stack.push(Value::Number(-n)),
                    other => {
                        return Err(RuntimeFault::new(format!(
                            "Operand to '-' must be a number, got {}",
                            other.type_name()
                        )));
                    }
                }
            }
            OpCode::Not => {
                let value = self.pop();
                self.stack.push(Value::Bool(!value.is_truthy()));
            }

            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Bool(a == b));
            }
            OpCode::NotEqual => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Bool(a != b));
            }
            OpCode::Less => self.comparison("<", |a, b| a < b, |a, b| a < b)?,
            OpCode::LessEqual => self.comparison("<=", |a, b| a <= b, |a, b| a <= b)?,
            OpCode::Greater => self.comparison(">", |a, b| a > b, |a, b| a > b)?,
            OpCode::GreaterEqual => self.comparison(">=", |a, b| a >= b, |a, b| a >= b)?,

            OpCode::Jump => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip += offset;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                if !self.peek(0).is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            OpCode::JumpIfTrue => {
                let offset = self.read_u16() as usize;
                if self.peek(0).is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip -= offset;
            }

            OpCode::Call => {
                let arg_count = self.read_byte() as usize;
                self.call_value(arg_count, FrameOrigin::Script)?;
            }
            OpCode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("call frame underflow");
                self.close_upvalues(frame.base);
                self.stack.truncate(frame.base);
                if frame.origin == FrameOrigin::Host {
                    return Ok(Some(result));
                }
                self.stack.push(result);
            }
            OpCode::Closure => {
                self.make_closure()?;
            }

            OpCode::Class => {
                let name = self.read_identifier()?;
                let class = ClassObject::new(&*name);
                self.stack.push(Value::Class(Rc::new(RefCell::new(class))));
            }
            OpCode::Inherit => {
                let subclass = self.pop();
                let superclass = self.peek(0).clone();
                let (Value::Class(sub), Value::Class(sup)) = (&subclass, &superclass) else {
                    return Err(RuntimeFault::new("Superclass must be a class"));
                };
                if Rc::ptr_eq(sub, sup) {
                    return Err(RuntimeFault::new(format!(
                        "Class '{}' cannot inherit from itself",
                        sub.borrow().name
                    )));
                }
                // Flatten: copy the full method table down so lookups never
                // walk the chain at call time.
                let sup_ref = sup.borrow();
                let mut sub_ref = sub.borrow_mut();
                for (name, method) in &sup_ref.methods {
                    sub_ref.methods.insert(name.clone(), method.clone());
                }
                for (name, method) in &sup_ref.static_methods {
                    sub_ref.static_methods.insert(name.clone(), method.clone());
                }
                sub_ref.native_ancestor = sup_ref.native_ancestor.clone();
                sub_ref.superclass = Some(sup.clone());
            }
            OpCode::Method => {
                let name = self.read_identifier()?;
                self.define_method(&name, false)?;
            }
            OpCode::StaticMethod => {
                let name = self.read_identifier()?;
                self.define_method(&name, true)?;
            }
            OpCode::GetProperty => {
                let name = self.read_identifier()?;
                let object = self.pop();
                let value = self.get_property(&object, &name)?;
                self.stack.push(value);
            }
            OpCode::SetProperty => {
                let name = self.read_identifier()?;
                let value = self.pop();
                let object = self.pop();
                match &object {
                    Value::Instance(instance) => {
                        instance.borrow_mut().set(&*name, value.clone());
                    }
                    Value::Class(class) => {
                        class
                            .borrow_mut()
                            .static_fields
                            .insert(name.to_string(), value.clone());
                    }
                    other => {
                        return Err(RuntimeFault::new(format!(
                            "Cannot set property '{}' on {}",
                            name,
                            other.type_name()
                        )));
                    }
                }
                self.stack.push(value);
            }
            OpCode::GetSuper => {
                let name = self.read_identifier()?;
                let superclass = self.pop();
                let instance = self.pop();
                let Value::Class(superclass) = superclass else {
                    return Err(RuntimeFault::new("Superclass must be a class"));
                };
                let Value::Instance(receiver) = instance else {
                    return Err(RuntimeFault::new("'super' requires a receiver"));
                };
                let superclass = superclass.borrow();
                if let Some(method) = superclass.find_method(&name) {
                    self.stack.push(Value::BoundMethod(receiver, method));
                } else if let Some(method) = superclass.find_native_method(&name) {
                    self.stack.push(Value::BoundNative(receiver, method));
                } else {
                    return Err(RuntimeFault::new(format!(
                        "Undefined method '{}' in superclass '{}'",
                        name, superclass.name
                    )));
                }
            }

            OpCode::BuildList => {
                let count = self.read_u16() as usize;
                let items = self.stack.split_off(self.stack.len() - count);
                self.stack.push(Value::list(items));
            }
            OpCode::BuildMap => {
                let count = self.read_u16() as usize;
                let flat = self.stack.split_off(self.stack.len() - count * 2);
                let mut pairs = Vec::with_capacity(count);
                let mut entries = flat.into_iter();
                while let (Some(key), Some(value)) = (entries.next(), entries.next()) {
                    pairs.push((key, value));
                }
                self.stack.push(Value::map(pairs));
            }
            OpCode::Index => {
                let index = self.pop();
                let object = self.pop();
                let value = self.index_get(&object, &index)?;
                self.stack.push(value);
            }
            OpCode::IndexSet => {
                let value = self.pop();
                let index = self.pop();
                let object = self.pop();
                self.index_set(&object, index, value.clone())?;
                self.stack.push(value);
            }

            OpCode::GetIterator => {
                let value = self.pop();
                let iter = match &value {
                    Value::List(list) => ValueIter::List {
                        list: list.clone(),
                        index: 0,
                    },
                    Value::Map(pairs) => ValueIter::Pairs {
                        pairs: pairs.borrow().clone(),
                        index: 0,
                    },
                    Value::String(s) => ValueIter::Chars {
                        chars: s.chars().collect(),
                        index: 0,
                    },
                    Value::Iterator(_) => {
                        self.stack.push(value);
                        return Ok(None);
                    }
                    other => {
                        return Err(RuntimeFault::new(format!(
                            "Value of type '{}' is not iterable",
                            other.type_name()
                        )));
                    }
                };
                self.stack
                    .push(Value::Iterator(Rc::new(RefCell::new(iter))));
            }
            OpCode::IterNext => {
                let offset = self.read_u16() as usize;
                let iterator = self.pop();
                let Value::Iterator(iter) = iterator else {
                    return Err(RuntimeFault::new("Iterator state corrupted"));
                };
                let next = iter.borrow_mut().next();
                match next {
                    Some(value) => self.stack.push(value),
                    None => self.frame_mut().ip += offset,
                }
            }

            OpCode::MatchLocal => {
                let pat_idx = self.read_u16() as usize;
                let base_slot = self.read_u16() as usize;
                let compiled = self.pattern_constant(pat_idx)?;
                let constants = self.pop_constant_list()?;
                let target = self.peek(0).clone();
                let base = self.frame().base + base_slot;
                let stack = &mut self.stack;
                let matched = pattern::bind(
                    &compiled.pattern,
                    &target,
                    &|i| constants[i].clone(),
                    &mut |id, value| stack[base + id] = value,
                );
                self.stack.push(Value::Bool(matched));
            }
            OpCode::MatchGlobal => {
                let pat_idx = self.read_u16() as usize;
                let compiled = self.pattern_constant(pat_idx)?;
                let constants = self.pop_constant_list()?;
                let target = self.peek(0).clone();
                let globals = self.frame().closure.globals.clone();
                // Every name is defined even when the match fails; the
                // following PatternFail raises before any code can read them.
                {
                    let mut globals = globals.borrow_mut();
                    for name in &compiled.bindings {
                        globals.insert(name.to_string(), Value::Null);
                    }
                }
                let bindings = &compiled.bindings;
                let matched = pattern::bind(
                    &compiled.pattern,
                    &target,
                    &|i| constants[i].clone(),
                    &mut |id, value| {
                        globals.borrow_mut().insert(bindings[id].to_string(), value);
                    },
                );
                self.stack.push(Value::Bool(matched));
            }
            OpCode::PatternFail => {
                let target = self.pop();
                return Err(RuntimeFault::new(format!(
                    "Pattern did not match value '{target}'"
                )));
            }

            OpCode::Assert => {
                let message = self.pop();
                let text = self.stringify(&message)?;
                return Err(RuntimeFault::assertion(text));
            }
        }

        Ok(None)
    }

    /// Attach trace lines for every frame above `boundary` (inclusive) and
    /// restore the stack to the state before the boundary frame was pushed.
    fn unwind(&mut self, mut fault: RuntimeFault, boundary: usize) -> RuntimeFault {
        while self.frames.len() > boundary {
            let frame = self.frames.pop().expect("call frame underflow");
            fault.traces.push(frame.trace_line());
            if let Some(annotation) = frame.annotation {
                fault.traces.push(annotation);
            }
            // Closures that escaped the dying frames must not keep open
            // upvalues into the truncated region.
            self.close_upvalues(frame.base);
            self.stack.truncate(frame.base);
        }
        fault
    }

    // ===== Calls =====

    /// Dispatch a call to the value sitting `arg_count` slots below the
    /// stack top. Returns whether a new frame was pushed (native calls
    /// complete in place).
    fn call_value(&mut self, arg_count: usize, origin: FrameOrigin) -> Result<bool, RuntimeFault> {
        let callee_idx = self.stack.len() - 1 - arg_count;
        let callee = self.stack[callee_idx].clone();

        match callee {
            Value::Closure(closure) => {
                self.call_closure(closure, arg_count, origin)?;
                Ok(true)
            }
            Value::BoundMethod(instance, method) => {
                self.stack[callee_idx] = Value::Instance(instance);
                self.call_closure(method, arg_count, origin)?;
                Ok(true)
            }
            Value::Native(native) => {
                let args = self.stack.split_off(callee_idx + 1);
                self.pop(); // callee
                let result = (native.func)(self, &args)?;
                self.stack.push(result);
                Ok(false)
            }
            Value::BoundNative(instance, method) => {
                let args = self.stack.split_off(callee_idx + 1);
                self.pop(); // callee
                let receiver = Value::Instance(instance);
                let result = (method.func)(self, &receiver, &args)?;
                self.stack.push(result);
                Ok(false)
            }
            Value::Class(class) => self.instantiate(class, arg_count, origin),
            other => Err(RuntimeFault::new(format!(
                "Value of type '{}' is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_closure(
        &mut self,
        closure: Rc<Closure>,
        arg_count: usize,
        origin: FrameOrigin,
    ) -> Result<(), RuntimeFault> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeFault::stack_overflow());
        }

        let function = &closure.function;
        Self::check_arity_of(function, arg_count)?;
        if function.varargs {
            // Excess arguments collect into a list bound to the last param.
            let required = function.arity();
            let rest = self.stack.split_off(self.stack.len() - (arg_count - required));
            self.stack.push(Value::list(rest));
        }

        let base = self.stack.len() - closure.function.params.len() - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
            origin,
            annotation: None,
        });
        Ok(())
    }

    /// Validate an argument count against a function's parameter list.
    fn check_arity_of(function: &Function, arg_count: usize) -> Result<(), RuntimeFault> {
        if function.varargs {
            let required = function.arity();
            if arg_count < required {
                return Err(RuntimeFault::new(format!(
                    "Expected at least {} argument(s) but got {} in call to '{}'",
                    required,
                    arg_count,
                    function.signature()
                )));
            }
        } else if arg_count != function.params.len() {
            return Err(RuntimeFault::new(format!(
                "Expected {} argument(s) but got {} in call to '{}'",
                function.params.len(),
                arg_count,
                function.signature()
            )));
        }
        Ok(())
    }

    fn instantiate(
        &mut self,
        class: Rc<RefCell<ClassObject>>,
        arg_count: usize,
        origin: FrameOrigin,
    ) -> Result<bool, RuntimeFault> {
        let callee_idx = self.stack.len() - 1 - arg_count;
        let instance = Rc::new(RefCell::new(Instance::new(class.clone())));

        let native_init = class
            .borrow()
            .native_ancestor
            .as_ref()
            .and_then(|native| native.initializer);
        let init = class.borrow().find_method("init");

        if let Some(init) = init {
            // Arity is validated before any initializer runs.
            Self::check_arity_of(&init.function, arg_count)?;
            // Host-provided ancestors initialize their state first.
            if let Some(native_init) = native_init {
                let args: Vec<Value> = self.stack[callee_idx + 1..].to_vec();
                let receiver = Value::Instance(instance.clone());
                native_init(self, &receiver, &args)?;
            }
            self.stack[callee_idx] = Value::Instance(instance);
            self.call_closure(init, arg_count, origin)?;
            let annotation = format!("In class {}", class.borrow().name);
            if let Some(frame) = self.frames.last_mut() {
                frame.annotation = Some(annotation);
            }
            Ok(true)
        } else if let Some(native_init) = native_init {
            // The native initializer consumes the arguments.
            let args = self.stack.split_off(callee_idx + 1);
            let receiver = Value::Instance(instance.clone());
            native_init(self, &receiver, &args)?;
            self.pop(); // callee
            self.stack.push(Value::Instance(instance));
            Ok(false)
        } else {
            if arg_count != 0 {
                return Err(RuntimeFault::new(format!(
                    "Expected 0 argument(s) but got {} in call to '{}'",
                    arg_count,
                    class.borrow().name
                )));
            }
            self.pop(); // callee
            self.stack.push(Value::Instance(instance));
            Ok(false)
        }
    }

    fn make_closure(&mut self) -> Result<(), RuntimeFault> {
        let func_idx = self.read_u16() as usize;
        let frame = self.frame();
        let Constant::Function(function) = frame.chunk().constants[func_idx].clone() else {
            return Err(RuntimeFault::new("Closure operand is not a function"));
        };
        let globals = frame.closure.globals.clone();

        let mut upvalues = Vec::with_capacity(function.upvalue_count);
        for _ in 0..function.upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let slot = self.frame().base + index;
                upvalues.push(self.capture_upvalue(slot));
            } else {
                upvalues.push(self.frame().closure.upvalues[index].clone());
            }
        }

        let closure = Closure {
            function,
            upvalues,
            globals,
        };
        self.stack.push(Value::Closure(Rc::new(closure)));
        Ok(())
    }

    // ===== Upvalues =====

    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        for upvalue in &self.open_upvalues {
            if matches!(&*upvalue.borrow(), Upvalue::Open(s) if *s == slot) {
                return upvalue.clone();
            }
        }
        let upvalue = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.push(upvalue.clone());
        upvalue
    }

    /// Close every open upvalue aliasing `from_slot` or above.
    fn close_upvalues(&mut self, from_slot: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|upvalue| {
            let slot = match &*upvalue.borrow() {
                Upvalue::Open(slot) => *slot,
                Upvalue::Closed(_) => return false,
            };
            if slot >= from_slot {
                *upvalue.borrow_mut() = Upvalue::Closed(stack[slot].clone());
                false
            } else {
                true
            }
        });
    }

    // ===== Properties & indexing =====

    fn get_property(&mut self, object: &Value, name: &str) -> Result<Value, RuntimeFault> {
        match object {
            Value::Instance(instance) => {
                if let Some(value) = instance.borrow().get(name) {
                    return Ok(value);
                }
                let class = instance.borrow().class.clone();
                let class = class.borrow();
                if let Some(method) = class.find_method(name) {
                    return Ok(Value::BoundMethod(instance.clone(), method));
                }
                if let Some(method) = class.find_native_method(name) {
                    return Ok(Value::BoundNative(instance.clone(), method));
                }
                if name == "toString" {
                    // Every instance can stringify itself.
                    return Ok(Value::BoundNative(
                        instance.clone(),
                        Rc::new(NativeMethod {
                            name: "toString".to_string(),
                            func: native_default_to_string,
                        }),
                    ));
                }
                Err(RuntimeFault::new(format!(
                    "Undefined property '{}' on instance of '{}'",
                    name, class.name
                )))
            }
            Value::Class(class) => {
                let mut current = Some(class.clone());
                while let Some(class) = current {
                    let class = class.borrow();
                    if let Some(value) = class.static_fields.get(name) {
                        return Ok(value.clone());
                    }
                    if let Some(method) = class.static_methods.get(name) {
                        return Ok(Value::Closure(method.clone()));
                    }
                    current = class.superclass.clone();
                }
                Err(RuntimeFault::new(format!(
                    "Undefined static member '{name}'"
                )))
            }
            other => Err(RuntimeFault::new(format!(
                "Cannot read property '{}' of {}",
                name,
                other.type_name()
            ))),
        }
    }

    fn define_method(&mut self, name: &str, is_static: bool) -> Result<(), RuntimeFault> {
        let method = self.pop();
        let class = self.peek(0).clone();
        let (Value::Closure(method), Value::Class(class)) = (method, class) else {
            return Err(RuntimeFault::new("Method definition outside a class"));
        };
        let mut class = class.borrow_mut();
        if is_static {
            class.static_methods.insert(name.to_string(), method);
        } else {
            class.methods.insert(name.to_string(), method);
        }
        Ok(())
    }

    fn index_get(&mut self, object: &Value, index: &Value) -> Result<Value, RuntimeFault> {
        match (object, index) {
            (Value::List(list), Value::Number(n)) => {
                let list = list.borrow();
                let i = *n as usize;
                if n.fract() != 0.0 || *n < 0.0 || i >= list.len() {
                    return Err(RuntimeFault::new(format!(
                        "List index {} out of range (length {})",
                        Value::Number(*n),
                        list.len()
                    )));
                }
                Ok(list[i].clone())
            }
            (Value::Map(pairs), key) => {
                let pairs = pairs.borrow();
                Ok(pairs
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null))
            }
            (Value::String(s), Value::Number(n)) => {
                let chars: Vec<char> = s.chars().collect();
                let i = *n as usize;
                if n.fract() != 0.0 || *n < 0.0 || i >= chars.len() {
                    return Err(RuntimeFault::new(format!(
                        "String index {} out of range (length {})",
                        Value::Number(*n),
                        chars.len()
                    )));
                }
                Ok(Value::string(chars[i].to_string()))
            }
            (other, _) => Err(RuntimeFault::new(format!(
                "Value of type '{}' is not indexable",
                other.type_name()
            ))),
        }
    }

    fn index_set(&mut self, object: &Value, index: Value, value: Value) -> Result<(), RuntimeFault> {
        match (object, &index) {
            (Value::List(list), Value::Number(n)) => {
                let mut list = list.borrow_mut();
                let i = *n as usize;
                if n.fract() != 0.0 || *n < 0.0 || i >= list.len() {
                    return Err(RuntimeFault::new(format!(
                        "List index {} out of range (length {})",
                        Value::Number(*n),
                        list.len()
                    )));
                }
                list[i] = value;
                Ok(())
            }
            (Value::Map(pairs), _) => {
                let mut pairs = pairs.borrow_mut();
                if let Some(entry) = pairs.iter_mut().find(|(k, _)| *k == index) {
                    entry.1 = value;
                } else {
                    pairs.push((index, value));
                }
                Ok(())
            }
            (other, _) => Err(RuntimeFault::new(format!(
                "Value of type '{}' is not indexable",
                other.type_name()
            ))),
        }
    }

    // ===== Arithmetic =====

    fn add_values(&mut self) -> Result<(), RuntimeFault> {
        let b = self.pop();
        let a = self.pop();
        let result = match (&a, &b) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Value::string(format!("{a}{b}"))
            }
            _ => {
                return Err(RuntimeFault::new(format!(
                    "Operands to '+' must be numbers or strings, got {} and {}",
                    a.type_name(),
                    b.type_name()
                )));
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn numeric_binary(
        &mut self,
        op: &str,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), RuntimeFault> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Number(a), Value::Number(b)) => {
                self.stack.push(Value::Number(f(*a, *b)));
                Ok(())
            }
            _ => Err(RuntimeFault::new(format!(
                "Operands to '{}' must be numbers, got {} and {}",
                op,
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn comparison(
        &mut self,
        op: &str,
        num: impl Fn(f64, f64) -> bool,
        string: impl Fn(&str, &str) -> bool,
    ) -> Result<(), RuntimeFault> {
        let b = self.pop();
        let a = self.pop();
        let result = match (&a, &b) {
            (Value::Number(a), Value::Number(b)) => num(*a, *b),
            (Value::String(a), Value::String(b)) => string(a, b),
            _ => {
                return Err(RuntimeFault::new(format!(
                    "Operands to '{}' must both be numbers or both be strings, got {} and {}",
                    op,
                    a.type_name(),
                    b.type_name()
                )));
            }
        };
        self.stack.push(Value::Bool(result));
        Ok(())
    }

    // ===== Helpers =====

    /// Stringify a value, dispatching to a scripted toString when one is
    /// defined.
    pub fn stringify(&mut self, value: &Value) -> Result<String, RuntimeFault> {
        if let Value::Instance(instance) = value {
            let has_script_to_string = instance
                .borrow()
                .class
                .borrow()
                .find_method("toString")
                .is_some();
            if has_script_to_string {
                let method = self.get_property(value, "toString")?;
                let result = self.call_from_host(method, &[])?;
                return Ok(result.to_string());
            }
        }
        Ok(value.to_string())
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.closure.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let value = frame.closure.function.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_identifier(&mut self) -> Result<Rc<str>, RuntimeFault> {
        let idx = self.read_u16() as usize;
        match &self.frame().chunk().constants[idx] {
            Constant::String(s) => Ok(s.clone()),
            _ => Err(RuntimeFault::new("Identifier operand is not a string")),
        }
    }

    fn constant_value(&mut self, idx: usize) -> Result<Value, RuntimeFault> {
        match &self.frame().chunk().constants[idx] {
            Constant::Number(n) => Ok(Value::Number(*n)),
            Constant::String(s) => Ok(Value::String(s.clone())),
            Constant::Keyword(k) => Ok(Value::Keyword(k.clone())),
            Constant::Bool(b) => Ok(Value::Bool(*b)),
            Constant::Null => Ok(Value::Null),
            Constant::Function(_) | Constant::Pattern(_) => {
                Err(RuntimeFault::new("Constant operand is not loadable"))
            }
        }
    }

    fn pattern_constant(
        &self,
        idx: usize,
    ) -> Result<Rc<crate::pattern::CompiledPattern>, RuntimeFault> {
        match &self.frame().chunk().constants[idx] {
            Constant::Pattern(p) => Ok(p.clone()),
            _ => Err(RuntimeFault::new("Match operand is not a pattern")),
        }
    }

    fn pop_constant_list(&mut self) -> Result<Vec<Value>, RuntimeFault> {
        match self.pop() {
            Value::List(items) => Ok(items.borrow().clone()),
            _ => Err(RuntimeFault::new("Pattern constants corrupted")),
        }
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Native functions =====

fn native_print(vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeFault> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(vm.stringify(arg)?);
    }
    print!("{}", parts.join(" "));
    Ok(Value::Null)
}

fn native_println(vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeFault> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(vm.stringify(arg)?);
    }
    println!("{}", parts.join(" "));
    Ok(Value::Null)
}

fn native_str(vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeFault> {
    let mut out = String::new();
    for arg in args {
        out.push_str(&vm.stringify(arg)?);
    }
    Ok(Value::string(out))
}

fn native_len(_vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeFault> {
    let [value] = args else {
        return Err(RuntimeFault::new(format!(
            "Expected 1 argument(s) but got {} in call to 'len(value)'",
            args.len()
        )));
    };
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::List(list) => list.borrow().len(),
        Value::Map(pairs) => pairs.borrow().len(),
        other => {
            return Err(RuntimeFault::new(format!(
                "Value of type '{}' has no length",
                other.type_name()
            )));
        }
    };
    Ok(Value::Number(len as f64))
}

fn native_type_name(_vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeFault> {
    let [value] = args else {
        return Err(RuntimeFault::new(format!(
            "Expected 1 argument(s) but got {} in call to 'typeName(value)'",
            args.len()
        )));
    };
    Ok(Value::string(value.type_name()))
}

fn native_default_to_string(
    _vm: &mut VM,
    receiver: &Value,
    _args: &[Value],
) -> Result<Value, RuntimeFault> {
    Ok(Value::string(receiver.to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ast::expr::{AstPattern, BinaryOp, Expr};
    use crate::ast::stmt::{ClassDecl, MatchArm, MethodDecl, Program, Stmt, StmtKind};
    use crate::bytecode::compiler::compile;
    use crate::error::FaultKind;
    use crate::span::Span;

    fn run(statements: Vec<Stmt>) -> (VM, Result<Value, RuntimeFault>) {
        let function = compile("test.sk", &Program::new(statements)).expect("compiles");
        let mut vm = VM::new();
        let result = vm.interpret(function);
        (vm, result)
    }

    fn global(vm: &VM, name: &str) -> Value {
        vm.get_global(name).unwrap_or_else(|| panic!("global {name}"))
    }

    #[test]
    fn test_arithmetic_and_globals() {
        let (vm, result) = run(vec![Stmt::var(
            "x",
            Expr::binary(
                Expr::number(2.0),
                BinaryOp::Add,
                Expr::binary(Expr::number(3.0), BinaryOp::Multiply, Expr::number(4.0)),
            ),
        )]);
        result.unwrap();
        assert_eq!(global(&vm, "x"), Value::Number(14.0));
    }

    #[test]
    fn test_string_concat_stringifies_other_operand() {
        let (vm, result) = run(vec![Stmt::var(
            "s",
            Expr::binary(Expr::string("n="), BinaryOp::Add, Expr::number(2.0)),
        )]);
        result.unwrap();
        assert_eq!(global(&vm, "s"), Value::string("n=2"));
    }

    #[test]
    fn test_undefined_variable_faults() {
        let (_, result) = run(vec![Stmt::expr(Expr::var("missing").at(3))]);
        let fault = result.unwrap_err();
        assert!(fault.message.contains("Undefined variable 'missing'"));
        assert_eq!(fault.traces, vec!["In <test.sk> (line 3)"]);
    }

    #[test]
    fn test_function_call_and_return() {
        // fn double(n) { return n + n; } var y = double(21);
        let (vm, result) = run(vec![
            Stmt::func(
                "double",
                vec!["n"],
                vec![Stmt::ret(Some(Expr::binary(
                    Expr::var("n"),
                    BinaryOp::Add,
                    Expr::var("n"),
                )))],
            ),
            Stmt::var("y", Expr::call(Expr::var("double"), vec![Expr::number(21.0)])),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "y"), Value::Number(42.0));
    }

    #[test]
    fn test_arity_fault_names_signature() {
        let (_, result) = run(vec![
            Stmt::func("f", vec!["a", "b"], vec![]),
            Stmt::expr(Expr::call(Expr::var("f"), vec![Expr::number(1.0)])),
        ]);
        let fault = result.unwrap_err();
        assert!(fault.message.contains("Expected 2 argument(s) but got 1"));
        assert!(fault.message.contains("f(a, b)"));
    }

    #[test]
    fn test_closure_shares_captured_variable() {
        // fn counter() { var n = 0; return \ -> { n = n + 1; return n; }; }
        let body = vec![
            Stmt::var("n", Expr::number(0.0)),
            Stmt::ret(Some(Expr::lambda(
                vec![],
                vec![
                    Stmt::expr(Expr::assign(
                        Expr::var("n"),
                        Expr::binary(Expr::var("n"), BinaryOp::Add, Expr::number(1.0)),
                    )),
                    Stmt::ret(Some(Expr::var("n"))),
                ],
            ))),
        ];
        let (vm, result) = run(vec![
            Stmt::func("counter", vec![], body),
            Stmt::var("tick", Expr::call(Expr::var("counter"), vec![])),
            Stmt::var("a", Expr::call(Expr::var("tick"), vec![])),
            Stmt::var("b", Expr::call(Expr::var("tick"), vec![])),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "a"), Value::Number(1.0));
        assert_eq!(global(&vm, "b"), Value::Number(2.0));
    }

    #[test]
    fn test_each_invocation_captures_independently() {
        // Two counters made by the same function keep separate state.
        let body = vec![
            Stmt::var("n", Expr::number(0.0)),
            Stmt::ret(Some(Expr::lambda(
                vec![],
                vec![
                    Stmt::expr(Expr::assign(
                        Expr::var("n"),
                        Expr::binary(Expr::var("n"), BinaryOp::Add, Expr::number(1.0)),
                    )),
                    Stmt::ret(Some(Expr::var("n"))),
                ],
            ))),
        ];
        let (vm, result) = run(vec![
            Stmt::func("counter", vec![], body),
            Stmt::var("first", Expr::call(Expr::var("counter"), vec![])),
            Stmt::var("second", Expr::call(Expr::var("counter"), vec![])),
            Stmt::expr(Expr::call(Expr::var("first"), vec![])),
            Stmt::expr(Expr::call(Expr::var("first"), vec![])),
            Stmt::var("a", Expr::call(Expr::var("first"), vec![])),
            Stmt::var("b", Expr::call(Expr::var("second"), vec![])),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "a"), Value::Number(3.0));
        assert_eq!(global(&vm, "b"), Value::Number(1.0));
    }

    #[test]
    fn test_escaped_closure_usable_after_fault_unwind() {
        // A closure over a local escapes into a global before the frame
        // faults; unwinding must close its upvalue, not leave it aliasing
        // the truncated stack.
        let (mut vm, result) = run(vec![
            Stmt::var("get", Expr::null()),
            Stmt::func(
                "boom",
                vec![],
                vec![
                    Stmt::var("n", Expr::number(10.0)),
                    Stmt::expr(Expr::assign(
                        Expr::var("get"),
                        Expr::lambda(vec![], vec![Stmt::ret(Some(Expr::var("n")))]),
                    )),
                    Stmt::expr(Expr::var("missing")),
                ],
            ),
            Stmt::expr(Expr::call(Expr::var("boom"), vec![])),
        ]);
        result.unwrap_err();

        let escaped = global(&vm, "get");
        let value = vm.call_from_host(escaped, &[]).unwrap();
        assert_eq!(value, Value::Number(10.0));
    }

    fn boxed_init(_vm: &mut VM, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeFault> {
        if let Value::Instance(instance) = receiver {
            let value = args.first().cloned().unwrap_or(Value::Null);
            instance.borrow_mut().set("value", value);
        }
        Ok(Value::Null)
    }

    fn boxed_get(_vm: &mut VM, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeFault> {
        if let Value::Instance(instance) = receiver {
            Ok(instance.borrow().get("value").unwrap_or(Value::Null))
        } else {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_native_type_initializer_takes_arguments() {
        let mut vm = VM::new();
        vm.register_native_type(
            NativeType::new("Boxed")
                .with_initializer(boxed_init)
                .with_method("get", boxed_get),
        );

        let class = global(&vm, "Boxed");
        let instance = vm.call_from_host(class, &[Value::Number(5.0)]).unwrap();

        // Native methods bind and dispatch from script code.
        vm.set_global("b", instance);
        let function = compile(
            "test.sk",
            &Program::new(vec![Stmt::var(
                "v",
                Expr::call(Expr::member(Expr::var("b"), "get"), vec![]),
            )]),
        )
        .expect("compiles");
        vm.interpret(function).unwrap();
        assert_eq!(global(&vm, "v"), Value::Number(5.0));
    }

    #[test]
    fn test_transitive_upvalue_capture() {
        // fn outer() { var x = 7; return \ -> { return \ -> { return x; }; }; }
        let (vm, result) = run(vec![
            Stmt::func(
                "outer",
                vec![],
                vec![
                    Stmt::var("x", Expr::number(7.0)),
                    Stmt::ret(Some(Expr::lambda(
                        vec![],
                        vec![Stmt::ret(Some(Expr::lambda(
                            vec![],
                            vec![Stmt::ret(Some(Expr::var("x")))],
                        )))],
                    ))),
                ],
            ),
            Stmt::var(
                "inner",
                Expr::call(Expr::call(Expr::var("outer"), vec![]), vec![]),
            ),
            Stmt::var("r", Expr::call(Expr::var("inner"), vec![])),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "r"), Value::Number(7.0));
    }

    #[test]
    fn test_while_loop_with_break_and_continue() {
        // var i = 0; var sum = 0;
        // while (i < 10) { i = i + 1; if (i == 3) continue; if (i > 5) break; sum = sum + i; }
        let incr = Stmt::expr(Expr::assign(
            Expr::var("i"),
            Expr::binary(Expr::var("i"), BinaryOp::Add, Expr::number(1.0)),
        ));
        let skip = Stmt::if_(
            Expr::binary(Expr::var("i"), BinaryOp::Equal, Expr::number(3.0)),
            Stmt::new(StmtKind::Continue, Span::default()),
            None,
        );
        let stop = Stmt::if_(
            Expr::binary(Expr::var("i"), BinaryOp::Greater, Expr::number(5.0)),
            Stmt::new(StmtKind::Break, Span::default()),
            None,
        );
        let add = Stmt::expr(Expr::assign(
            Expr::var("sum"),
            Expr::binary(Expr::var("sum"), BinaryOp::Add, Expr::var("i")),
        ));
        let (vm, result) = run(vec![
            Stmt::var("i", Expr::number(0.0)),
            Stmt::var("sum", Expr::number(0.0)),
            Stmt::while_(
                Expr::binary(Expr::var("i"), BinaryOp::Less, Expr::number(10.0)),
                Stmt::block(vec![incr, skip, stop, add]),
            ),
        ]);
        result.unwrap();
        // 1 + 2 + 4 + 5
        assert_eq!(global(&vm, "sum"), Value::Number(12.0));
    }

    #[test]
    fn test_foreach_destructures_and_skips_mismatches() {
        // var total = 0;
        // foreach [a, b] : [[1, 2], 3, [4, 5]] { total = total + a + b; }
        let pattern = AstPattern::List(
            vec![
                AstPattern::Variable("a".into()),
                AstPattern::Variable("b".into()),
            ],
            None,
        );
        let body = Stmt::block(vec![Stmt::expr(Expr::assign(
            Expr::var("total"),
            Expr::binary(
                Expr::binary(Expr::var("total"), BinaryOp::Add, Expr::var("a")),
                BinaryOp::Add,
                Expr::var("b"),
            ),
        ))]);
        let (vm, result) = run(vec![
            Stmt::var("total", Expr::number(0.0)),
            Stmt::foreach(
                pattern,
                Expr::list(vec![
                    Expr::list(vec![Expr::number(1.0), Expr::number(2.0)]),
                    Expr::number(3.0),
                    Expr::list(vec![Expr::number(4.0), Expr::number(5.0)]),
                ]),
                body,
            ),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "total"), Value::Number(12.0));
    }

    #[test]
    fn test_match_statement_selects_arm_with_guard() {
        // match (x) {
        //   case [a] if a > 10 -> { r = "big"; }
        //   case [a] -> { r = "small"; }
        //   case _ -> { r = "other"; }
        // }
        let arms = || {
            vec![
                MatchArm {
                    pattern: AstPattern::List(vec![AstPattern::Variable("a".into())], None),
                    guard: Some(Expr::binary(
                        Expr::var("a"),
                        BinaryOp::Greater,
                        Expr::number(10.0),
                    )),
                    body: vec![Stmt::expr(Expr::assign(Expr::var("r"), Expr::string("big")))],
                    span: Span::default(),
                },
                MatchArm {
                    pattern: AstPattern::List(vec![AstPattern::Variable("a".into())], None),
                    guard: None,
                    body: vec![Stmt::expr(Expr::assign(
                        Expr::var("r"),
                        Expr::string("small"),
                    ))],
                    span: Span::default(),
                },
                MatchArm {
                    pattern: AstPattern::Wildcard,
                    guard: None,
                    body: vec![Stmt::expr(Expr::assign(
                        Expr::var("r"),
                        Expr::string("other"),
                    ))],
                    span: Span::default(),
                },
            ]
        };

        let (vm, result) = run(vec![
            Stmt::var("r", Expr::null()),
            Stmt::new(
                StmtKind::Match {
                    target: Expr::list(vec![Expr::number(3.0)]),
                    arms: arms(),
                },
                Span::default(),
            ),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "r"), Value::string("small"));

        let (vm, result) = run(vec![
            Stmt::var("r", Expr::null()),
            Stmt::new(
                StmtKind::Match {
                    target: Expr::list(vec![Expr::number(42.0)]),
                    arms: arms(),
                },
                Span::default(),
            ),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "r"), Value::string("big"));
    }

    #[test]
    fn test_destructuring_declaration_mismatch_faults() {
        let pattern = AstPattern::List(
            vec![
                AstPattern::Variable("a".into()),
                AstPattern::Variable("b".into()),
            ],
            None,
        );
        let (_, result) = run(vec![Stmt::var_pattern(
            pattern,
            Expr::list(vec![Expr::number(1.0)]),
        )]);
        let fault = result.unwrap_err();
        assert!(fault.message.contains("Pattern did not match"));
    }

    #[test]
    fn test_tail_pattern_binds_remaining_elements() {
        let pattern = AstPattern::List(
            vec![AstPattern::Variable("head".into())],
            Some("rest".into()),
        );
        let (vm, result) = run(vec![Stmt::var_pattern(
            pattern,
            Expr::list(vec![
                Expr::number(1.0),
                Expr::number(2.0),
                Expr::number(3.0),
            ]),
        )]);
        result.unwrap();
        assert_eq!(global(&vm, "head"), Value::Number(1.0));
        assert_eq!(
            global(&vm, "rest"),
            Value::list(vec![Value::Number(2.0), Value::Number(3.0)])
        );
    }

    #[test]
    fn test_fault_trace_is_innermost_first() {
        // fn inner() { missing; } fn outer() { inner(); } outer();
        let (_, result) = run(vec![
            Stmt::func(
                "inner",
                vec![],
                vec![Stmt::expr(Expr::var("missing").at(2))],
            ),
            Stmt::func(
                "outer",
                vec![],
                vec![Stmt::expr(Expr::call(Expr::var("inner"), vec![]).at(5))],
            ),
            Stmt::expr(Expr::call(Expr::var("outer"), vec![]).at(9)),
        ]);
        let fault = result.unwrap_err();
        assert_eq!(
            fault.traces,
            vec![
                "In function inner() (line 2)",
                "In function outer() (line 5)",
                "In <test.sk> (line 9)",
            ]
        );
    }

    #[test]
    fn test_assert_raises_assertion_fault() {
        let (_, result) = run(vec![Stmt::new(
            StmtKind::Assert {
                condition: Expr::bool(false),
                message: None,
                text: "1 == 2".to_string(),
            },
            Span::line(4),
        )]);
        let fault = result.unwrap_err();
        assert_eq!(fault.kind, FaultKind::Assertion);
        assert_eq!(fault.message, "Assertion failed: 1 == 2");
    }

    #[test]
    fn test_stack_overflow_is_reported() {
        let (_, result) = run(vec![
            Stmt::func(
                "loop",
                vec![],
                vec![Stmt::ret(Some(Expr::call(Expr::var("loop"), vec![])))],
            ),
            Stmt::expr(Expr::call(Expr::var("loop"), vec![])),
        ]);
        let fault = result.unwrap_err();
        assert_eq!(fault.kind, FaultKind::StackOverflow);
    }

    #[test]
    fn test_varargs_collects_excess_arguments() {
        // fn tail(first, rest...) { return rest; }
        let decl = crate::ast::stmt::FunctionDecl {
            name: "tail".to_string(),
            params: vec!["first".to_string(), "rest".to_string()],
            varargs: true,
            body: vec![Stmt::ret(Some(Expr::var("rest")))],
            span: Span::default(),
        };
        let (vm, result) = run(vec![
            Stmt::new(StmtKind::Function(decl), Span::default()),
            Stmt::var(
                "r",
                Expr::call(
                    Expr::var("tail"),
                    vec![Expr::number(1.0), Expr::number(2.0), Expr::number(3.0)],
                ),
            ),
        ]);
        result.unwrap();
        assert_eq!(
            global(&vm, "r"),
            Value::list(vec![Value::Number(2.0), Value::Number(3.0)])
        );
    }

    fn method(name: &str, params: Vec<&str>, body: Vec<Stmt>) -> MethodDecl {
        MethodDecl {
            name: name.to_string(),
            params: params.into_iter().map(String::from).collect(),
            varargs: false,
            body,
            span: Span::default(),
        }
    }

    #[test]
    fn test_class_with_init_fields_and_methods() {
        // class Point { init(x, y) { this.x = x; this.y = y; }
        //               sum() { return this.x + this.y; } }
        let decl = ClassDecl {
            name: "Point".to_string(),
            superclass: None,
            methods: vec![
                method(
                    "init",
                    vec!["x", "y"],
                    vec![
                        Stmt::expr(Expr::assign(
                            Expr::member(Expr::this(), "x"),
                            Expr::var("x"),
                        )),
                        Stmt::expr(Expr::assign(
                            Expr::member(Expr::this(), "y"),
                            Expr::var("y"),
                        )),
                    ],
                ),
                method(
                    "sum",
                    vec![],
                    vec![Stmt::ret(Some(Expr::binary(
                        Expr::member(Expr::this(), "x"),
                        BinaryOp::Add,
                        Expr::member(Expr::this(), "y"),
                    )))],
                ),
            ],
            static_methods: vec![],
            static_init: vec![],
            span: Span::default(),
        };
        let (vm, result) = run(vec![
            Stmt::new(StmtKind::Class(decl), Span::default()),
            Stmt::var(
                "p",
                Expr::call(
                    Expr::var("Point"),
                    vec![Expr::number(3.0), Expr::number(4.0)],
                ),
            ),
            Stmt::var(
                "s",
                Expr::call(Expr::member(Expr::var("p"), "sum"), vec![]),
            ),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "s"), Value::Number(7.0));
    }

    #[test]
    fn test_inheritance_and_super_call() {
        // class A { greet() { return "A"; } }
        // class B < A { greet() { return super.greet() + "B"; } }
        let a = ClassDecl {
            name: "A".to_string(),
            superclass: None,
            methods: vec![method(
                "greet",
                vec![],
                vec![Stmt::ret(Some(Expr::string("A")))],
            )],
            static_methods: vec![],
            static_init: vec![],
            span: Span::default(),
        };
        let b = ClassDecl {
            name: "B".to_string(),
            superclass: Some(Expr::var("A")),
            methods: vec![method(
                "greet",
                vec![],
                vec![Stmt::ret(Some(Expr::binary(
                    Expr::call(Expr::super_("greet"), vec![]),
                    BinaryOp::Add,
                    Expr::string("B"),
                )))],
            )],
            static_methods: vec![],
            static_init: vec![],
            span: Span::default(),
        };
        let (vm, result) = run(vec![
            Stmt::new(StmtKind::Class(a), Span::default()),
            Stmt::new(StmtKind::Class(b), Span::default()),
            Stmt::var("inst", Expr::call(Expr::var("B"), vec![])),
            Stmt::var(
                "r",
                Expr::call(Expr::member(Expr::var("inst"), "greet"), vec![]),
            ),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "r"), Value::string("AB"));
    }

    #[test]
    fn test_init_fault_is_attributed_to_the_class() {
        let decl = ClassDecl {
            name: "Boom".to_string(),
            superclass: None,
            methods: vec![method(
                "init",
                vec![],
                vec![Stmt::expr(Expr::var("missing").at(7))],
            )],
            static_methods: vec![],
            static_init: vec![],
            span: Span::default(),
        };
        let (_, result) = run(vec![
            Stmt::new(StmtKind::Class(decl), Span::default()),
            Stmt::expr(Expr::call(Expr::var("Boom"), vec![])),
        ]);
        let fault = result.unwrap_err();
        assert_eq!(fault.traces[0], "In initializer init() (line 7)");
        assert_eq!(fault.traces[1], "In class Boom");
    }

    #[test]
    fn test_static_initializer_runs_once_at_definition() {
        // class C { } with static body: C.count = 99; via statics
        let decl = ClassDecl {
            name: "C".to_string(),
            superclass: None,
            methods: vec![],
            static_methods: vec![],
            static_init: vec![Stmt::expr(Expr::assign(
                Expr::member(Expr::var("C"), "count"),
                Expr::number(99.0),
            ))],
            span: Span::default(),
        };
        let (vm, result) = run(vec![
            Stmt::new(StmtKind::Class(decl), Span::default()),
            Stmt::var("n", Expr::member(Expr::var("C"), "count")),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "n"), Value::Number(99.0));
    }

    #[test]
    fn test_compound_index_assign_evaluates_target_once() {
        // var n = 0; fn bump() { n = n + 1; return 0; }
        // var xs = [10]; xs[bump()] += 5;
        let (vm, result) = run(vec![
            Stmt::var("n", Expr::number(0.0)),
            Stmt::func(
                "bump",
                vec![],
                vec![
                    Stmt::expr(Expr::assign(
                        Expr::var("n"),
                        Expr::binary(Expr::var("n"), BinaryOp::Add, Expr::number(1.0)),
                    )),
                    Stmt::ret(Some(Expr::number(0.0))),
                ],
            ),
            Stmt::var("xs", Expr::list(vec![Expr::number(10.0)])),
            Stmt::expr(Expr::compound(
                Expr::index(Expr::var("xs"), Expr::call(Expr::var("bump"), vec![])),
                BinaryOp::Add,
                Expr::number(5.0),
            )),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "n"), Value::Number(1.0));
        assert_eq!(global(&vm, "xs"), Value::list(vec![Value::Number(15.0)]));
    }

    #[test]
    fn test_postfix_increment_yields_old_value() {
        let (vm, result) = run(vec![
            Stmt::var("x", Expr::number(5.0)),
            Stmt::var("old", Expr::incr(Expr::var("x"), 1.0, false)),
            Stmt::var("new_", Expr::incr(Expr::var("x"), 1.0, true)),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "old"), Value::Number(5.0));
        assert_eq!(global(&vm, "new_"), Value::Number(7.0));
        assert_eq!(global(&vm, "x"), Value::Number(7.0));
    }

    #[test]
    fn test_call_from_host_restores_stack_on_fault() {
        let (mut vm, result) = run(vec![
            Stmt::func(
                "ok",
                vec!["a"],
                vec![Stmt::ret(Some(Expr::binary(
                    Expr::var("a"),
                    BinaryOp::Add,
                    Expr::number(1.0),
                )))],
            ),
            Stmt::func("bad", vec![], vec![Stmt::expr(Expr::var("missing"))]),
        ]);
        result.unwrap();

        let bad = global(&vm, "bad");
        let err = vm.call_from_host(bad, &[]).unwrap_err();
        assert!(err.message.contains("Undefined variable"));

        // The interpreter is still usable after the fault.
        let ok = global(&vm, "ok");
        let value = vm.call_from_host(ok, &[Value::Number(41.0)]).unwrap();
        assert_eq!(value, Value::Number(42.0));
    }

    #[test]
    fn test_native_str_uses_scripted_to_string() {
        let decl = ClassDecl {
            name: "Tag".to_string(),
            superclass: None,
            methods: vec![method(
                "toString",
                vec![],
                vec![Stmt::ret(Some(Expr::string("#tag")))],
            )],
            static_methods: vec![],
            static_init: vec![],
            span: Span::default(),
        };
        let (vm, result) = run(vec![
            Stmt::new(StmtKind::Class(decl), Span::default()),
            Stmt::var(
                "s",
                Expr::call(
                    Expr::var("str"),
                    vec![Expr::call(Expr::var("Tag"), vec![])],
                ),
            ),
        ]);
        result.unwrap();
        assert_eq!(global(&vm, "s"), Value::string("#tag"));
    }

    #[test]
    fn test_list_index_out_of_range_faults() {
        let (_, result) = run(vec![Stmt::expr(Expr::index(
            Expr::list(vec![Expr::number(1.0)]),
            Expr::number(4.0),
        ))]);
        let fault = result.unwrap_err();
        assert!(fault.message.contains("out of range"));
    }

    #[test]
    fn test_map_index_miss_is_null() {
        let (vm, result) = run(vec![Stmt::var(
            "v",
            Expr::index(
                Expr::map(vec![(Expr::keyword("a"), Expr::number(1.0))]),
                Expr::keyword("b"),
            ),
        )]);
        result.unwrap();
        assert_eq!(global(&vm, "v"), Value::Null);
    }
}
