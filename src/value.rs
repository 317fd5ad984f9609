//! Runtime values for the Skiff VM.
//!
//! Callables are a small closed set of tagged variants (native function,
//! closure, bound method, class) dispatched by `match` at call sites rather
//! than through trait objects.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::chunk::Function;
use crate::error::RuntimeFault;

/// Insertion-ordered string-keyed table used for globals, method tables and
/// instance fields.
pub type Table<V> = IndexMap<String, V, ahash::RandomState>;

/// A global namespace, shared by every closure created under it.
pub type Globals = Rc<RefCell<Table<Value>>>;

/// Signature of a host-provided function. Natives receive the interpreter
/// handle and the argument window, never raw VM internals.
pub type NativeFn = fn(&mut crate::bytecode::vm::VM, &[Value]) -> Result<Value, RuntimeFault>;

/// Signature of a host-provided method: interpreter handle, receiver,
/// argument window.
pub type NativeMethodFn =
    fn(&mut crate::bytecode::vm::VM, &Value, &[Value]) -> Result<Value, RuntimeFault>;

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Number value (IEEE-754 double)
    Number(f64),
    /// String value
    String(Rc<str>),
    /// Keyword value: #name
    Keyword(Rc<str>),
    /// List value
    List(Rc<RefCell<Vec<Value>>>),
    /// Map value (insertion-ordered key/value pairs)
    Map(Rc<RefCell<Vec<(Value, Value)>>>),
    /// Closure (function + captured upvalues + globals)
    Closure(Rc<Closure>),
    /// Host-provided function
    Native(Rc<NativeFunction>),
    /// Scripted method bound to a receiver
    BoundMethod(Rc<RefCell<Instance>>, Rc<Closure>),
    /// Native-ancestor method bound to a receiver
    BoundNative(Rc<RefCell<Instance>>, Rc<NativeMethod>),
    /// Class value
    Class(Rc<RefCell<ClassObject>>),
    /// Class instance
    Instance(Rc<RefCell<Instance>>),
    /// Iterator state for foreach
    Iterator(Rc<RefCell<ValueIter>>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(Rc::from(s.as_ref()))
    }

    pub fn keyword(s: impl AsRef<str>) -> Value {
        Value::Keyword(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(pairs: Vec<(Value, Value)>) -> Value {
        Value::Map(Rc::new(RefCell::new(pairs)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Boolean",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Keyword(_) => "Keyword",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::Closure(_) => "Function",
            Value::Native(_) => "Function",
            Value::BoundMethod(_, _) => "Method",
            Value::BoundNative(_, _) => "Method",
            Value::Class(_) => "Class",
            Value::Instance(_) => "Instance",
            Value::Iterator(_) => "Iterator",
        }
    }

    /// Only `false` and `null` are falsey.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false) | Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            // Integral numbers print without a trailing ".0". Above 2^53
            // the cast to i64 is no longer exact, so fall back to the
            // float formatting.
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < (1i64 << 53) as f64 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Value::String(s) => write!(f, "{s}"),
            Value::Keyword(k) => write!(f, "#{k}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Closure(closure) => write!(f, "<fn {}>", closure.function.name),
            Value::Native(native) => write!(f, "<native fn {}>", native.name),
            Value::BoundMethod(instance, method) => write!(
                f,
                "<method {} of {}>",
                method.function.name,
                instance.borrow().class.borrow().name
            ),
            Value::BoundNative(instance, method) => write!(
                f,
                "<method {} of {}>",
                method.name,
                instance.borrow().class.borrow().name
            ),
            Value::Class(class) => write!(f, "<class {}>", class.borrow().name),
            Value::Instance(instance) => {
                write!(f, "<{} instance>", instance.borrow().class.borrow().name)
            }
            Value::Iterator(_) => write!(f, "<iterator>"),
        }
    }
}

/// Runtime representation of a closure.
#[derive(Debug)]
pub struct Closure {
    /// The compiled function
    pub function: Rc<Function>,
    /// Captured upvalues, one per compile-time upvalue slot
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
    /// The global namespace active when the closure was created
    pub globals: Globals,
}

impl Closure {
    pub fn new(function: Rc<Function>, globals: Globals) -> Self {
        Self {
            function,
            upvalues: Vec::new(),
            globals,
        }
    }
}

/// An upvalue (captured variable).
///
/// Open upvalues alias a live stack slot by index; closing snapshots the
/// value into the cell. The transition happens exactly once.
#[derive(Debug, Clone)]
pub enum Upvalue {
    /// Open upvalue: aliases a stack slot
    Open(usize),
    /// Closed upvalue: owns the value
    Closed(Value),
}

impl Upvalue {
    pub fn is_open(&self) -> bool {
        matches!(self, Upvalue::Open(_))
    }
}

/// A host-provided function.
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// A single method on a native type.
pub struct NativeMethod {
    pub name: String,
    pub func: NativeMethodFn,
}

impl fmt::Debug for NativeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeMethod({})", self.name)
    }
}

/// A host-provided type. Scripted classes that extend one inherit it as
/// their "native ancestor" and delegate method binding to it when a name is
/// not found in the scripted method table.
#[derive(Debug)]
pub struct NativeType {
    pub name: String,
    methods: Table<Rc<NativeMethod>>,
    /// Invoked when an instance of the native type itself is created.
    pub initializer: Option<NativeMethodFn>,
}

impl NativeType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Table::default(),
            initializer: None,
        }
    }

    pub fn with_method(mut self, name: impl Into<String>, func: NativeMethodFn) -> Self {
        let name = name.into();
        self.methods.insert(
            name.clone(),
            Rc::new(NativeMethod { name, func }),
        );
        self
    }

    pub fn with_initializer(mut self, func: NativeMethodFn) -> Self {
        self.initializer = Some(func);
        self
    }

    pub fn find_method(&self, name: &str) -> Option<Rc<NativeMethod>> {
        self.methods.get(name).cloned()
    }
}

/// Runtime class representation.
///
/// Method tables are flattened at `Inherit` time: the table is fully
/// populated, inherited methods included, before any instance exists.
#[derive(Debug)]
pub struct ClassObject {
    pub name: Rc<str>,
    pub methods: Table<Rc<Closure>>,
    pub static_methods: Table<Rc<Closure>>,
    pub static_fields: Table<Value>,
    pub superclass: Option<Rc<RefCell<ClassObject>>>,
    /// Nearest host-provided ancestor, for method-binding delegation.
    pub native_ancestor: Option<Rc<NativeType>>,
}

impl ClassObject {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Rc::from(name.as_ref()),
            methods: Table::default(),
            static_methods: Table::default(),
            static_fields: Table::default(),
            superclass: None,
            native_ancestor: None,
        }
    }

    /// Method lookup never walks the superclass chain; inheritance is
    /// flattened when the subclass is created.
    pub fn find_method(&self, name: &str) -> Option<Rc<Closure>> {
        self.methods.get(name).cloned()
    }

    pub fn find_native_method(&self, name: &str) -> Option<Rc<NativeMethod>> {
        self.native_ancestor
            .as_ref()
            .and_then(|native| native.find_method(name))
    }
}

/// Runtime instance representation.
#[derive(Debug)]
pub struct Instance {
    pub class: Rc<RefCell<ClassObject>>,
    pub fields: Table<Value>,
}

impl Instance {
    pub fn new(class: Rc<RefCell<ClassObject>>) -> Self {
        Self {
            class,
            fields: Table::default(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }
}

/// Iterator state for foreach loops.
#[derive(Debug)]
pub enum ValueIter {
    List {
        list: Rc<RefCell<Vec<Value>>>,
        index: usize,
    },
    /// Map entries, snapshotted at loop entry; each element is a [key, value]
    /// pair so foreach patterns can destructure them.
    Pairs {
        pairs: Vec<(Value, Value)>,
        index: usize,
    },
    Chars {
        chars: Vec<char>,
        index: usize,
    },
}

impl ValueIter {
    pub fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::List { list, index } => {
                let list = list.borrow();
                if *index < list.len() {
                    let value = list[*index].clone();
                    *index += 1;
                    Some(value)
                } else {
                    None
                }
            }
            ValueIter::Pairs { pairs, index } => {
                if *index < pairs.len() {
                    let (k, v) = pairs[*index].clone();
                    *index += 1;
                    Some(Value::list(vec![k, v]))
                } else {
                    None
                }
            }
            ValueIter::Chars { chars, index } => {
                if *index < chars.len() {
                    let value = Value::string(chars[*index].to_string());
                    *index += 1;
                    Some(value)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::string("").is_truthy());
    }

    #[test]
    fn test_number_display() {
        assert_eq!(Value::Number(2.0).to_string(), "2");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Number(-7.0).to_string(), "-7");
    }

    #[test]
    fn test_number_display_beyond_exact_integer_range() {
        // Past 2^53 an i64 cast would print the wrong (or saturated) value.
        assert_eq!(Value::Number(1e19).to_string(), "10000000000000000000");
        assert_eq!(Value::Number(2f64.powi(53)).to_string(), "9007199254740992");
    }

    #[test]
    fn test_deep_list_equality() {
        let a = Value::list(vec![Value::Number(1.0), Value::string("x")]);
        let b = Value::list(vec![Value::Number(1.0), Value::string("x")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_pairs_iterator_yields_entries() {
        let mut iter = ValueIter::Pairs {
            pairs: vec![(Value::keyword("a"), Value::Number(1.0))],
            index: 0,
        };
        let entry = iter.next().unwrap();
        assert_eq!(
            entry,
            Value::list(vec![Value::keyword("a"), Value::Number(1.0)])
        );
        assert!(iter.next().is_none());
    }
}
