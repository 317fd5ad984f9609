//! Structural patterns and the binder.
//!
//! The compiler lowers source-level destructuring forms into [`Pattern`]
//! trees stored in the constant pool. At runtime the VM hands the binder a
//! target value, a resolver for the pattern's interpolated constants, and an
//! emitter that receives `(variable id, value)` pairs. Variable ids are
//! assigned by the compiler in first-appearance, depth-first, left-to-right
//! order, so the emitter can write straight into consecutive local slots.

use std::rc::Rc;

use crate::value::Value;

/// A compiled structural pattern.
///
/// Constant operands (`Value` payloads and map keys) are indices into a
/// per-pattern constant table materialized by the VM before binding starts.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Matches anything, binds nothing.
    Wildcard,
    /// Binds the whole target to a variable id.
    ValueBinding(usize),
    /// Binds the target to a variable id, then matches a sub-pattern
    /// against the same target.
    SubPatternBinding(usize, Box<Pattern>),
    /// Equality test against a resolved constant.
    Value(usize),
    /// List pattern. The optional tail id binds the remaining elements
    /// (possibly none) as a fresh list.
    List(Vec<Pattern>, Option<usize>),
    /// Map pattern keyed by resolved constants. Extra keys in the target
    /// are ignored; a missing key fails the match.
    Map(Vec<(usize, Pattern)>),
}

/// Attempts to match `target` against `pattern`.
///
/// `resolve` maps a constant id to its runtime value; `emit` receives each
/// binding as it is produced. Returns whether the match succeeded. On
/// failure, bindings emitted before the failing position are not rolled
/// back; the caller owns that cleanup.
pub fn bind<R, E>(pattern: &Pattern, target: &Value, resolve: &R, emit: &mut E) -> bool
where
    R: Fn(usize) -> Value,
    E: FnMut(usize, Value),
{
    match pattern {
        Pattern::Wildcard => true,
        Pattern::ValueBinding(id) => {
            emit(*id, target.clone());
            true
        }
        Pattern::SubPatternBinding(id, sub) => {
            emit(*id, target.clone());
            bind(sub, target, resolve, emit)
        }
        Pattern::Value(constant) => resolve(*constant) == *target,
        Pattern::List(elements, tail) => {
            let Value::List(items) = target else {
                return false;
            };
            let items = items.borrow();
            match tail {
                None if items.len() != elements.len() => return false,
                Some(_) if items.len() < elements.len() => return false,
                _ => {}
            }
            for (element, item) in elements.iter().zip(items.iter()) {
                if !bind(element, item, resolve, emit) {
                    return false;
                }
            }
            if let Some(id) = tail {
                let rest = items[elements.len()..].to_vec();
                emit(*id, Value::list(rest));
            }
            true
        }
        Pattern::Map(entries) => {
            let Value::Map(pairs) = target else {
                return false;
            };
            let pairs = pairs.borrow();
            for (key_constant, sub) in entries {
                let key = resolve(*key_constant);
                let Some((_, found)) = pairs.iter().find(|(k, _)| *k == key) else {
                    return false;
                };
                let found = found.clone();
                if !bind(sub, &found, resolve, emit) {
                    return false;
                }
            }
            true
        }
    }
}

/// A pattern together with the compiler-side metadata the VM needs to
/// execute a match instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPattern {
    pub pattern: Pattern,
    /// Variable names in id order (first appearance, depth first, left to
    /// right). The id of a name is its index here.
    pub bindings: Vec<Rc<str>>,
    /// Number of interpolated constants the VM must pop into the pattern's
    /// constant table before binding.
    pub constant_count: usize,
}

impl CompiledPattern {
    pub fn new(pattern: Pattern, bindings: Vec<Rc<str>>, constant_count: usize) -> Self {
        Self {
            pattern,
            bindings,
            constant_count,
        }
    }
}
