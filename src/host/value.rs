//! Host value representation.
//!
//! `Value` is the dynamic value universe of the host runtime. Ground kinds
//! (nil, booleans, numbers, strings) compare structurally; reference kinds
//! (lists, maps, functions, natives, modules, iterators) are handles and
//! compare by identity. Guards never compare values directly - they compare
//! the generation counters maintained by [`Namespace`](super::Namespace),
//! [`Module`] attribute tables, and closure [`Cell`]s.

use std::sync::Arc;

use parking_lot::Mutex;

use super::error::{HostError, HostResult};
use super::function::Function;
use super::namespace::Namespace;

/// Implementation signature for native functions
pub type NativeImpl =
    Arc<dyn Fn(&[Value], &[(String, Value)]) -> HostResult<Value> + Send + Sync>;

/// A host value
#[derive(Clone)]
pub enum Value {
    /// Nil/absent
    Nil,
    /// A boolean
    Bool(bool),
    /// A 64-bit integer
    Long(i64),
    /// A 64-bit float
    Float(f64),
    /// A string
    Str(String),
    /// A list of values
    List(Arc<Vec<Value>>),
    /// An association list of key/value pairs, insertion ordered
    Map(Arc<Vec<(Value, Value)>>),
    /// A live iterator over a sequence
    Iter(Arc<IterState>),
    /// A native (Rust) callable
    Native(Arc<NativeFn>),
    /// A user-defined bytecode function
    Function(Arc<Function>),
    /// A module with a mutable attribute table
    Module(Arc<Module>),
}

impl Value {
    /// Build a list value from a vector
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    /// Build a map value from pairs
    pub fn map(pairs: Vec<(Value, Value)>) -> Self {
        Value::Map(Arc::new(pairs))
    }

    /// Build a string value
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Short type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Iter(_) => "iter",
            Value::Native(_) => "native",
            Value::Function(_) => "function",
            Value::Module(_) => "module",
        }
    }

    /// Whether this value can be the target of a call
    #[inline]
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Native(_) | Value::Function(_))
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view, promoting longs to floats
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Long(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Index a sequence, permitting negative indices
    pub fn index(&self, index: i64) -> HostResult<Value> {
        match self {
            Value::List(items) => {
                let len = items.len();
                let resolved = if index < 0 {
                    index + len as i64
                } else {
                    index
                };
                if resolved < 0 || resolved as usize >= len {
                    return Err(HostError::IndexOutOfRange { index, len });
                }
                Ok(items[resolved as usize].clone())
            }
            other => Err(HostError::TypeError {
                expected: "list",
                got: other.type_name(),
            }),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Long(a), Value::Float(b)) | (Value::Float(b), Value::Long(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Iter(a), Value::Iter(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Long(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Iter(_) => write!(f, "<iterator>"),
            Value::Native(n) => write!(f, "<native {}>", n.name()),
            Value::Function(func) => write!(f, "<function {}>", func.name()),
            Value::Module(m) => write!(f, "<module {}>", m.name()),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// A native Rust function exposed to the host
pub struct NativeFn {
    name: String,
    /// Whether this native always produces a `Bool` result. Used by guard
    /// compilation to prove branch conditions boolean without a runtime check.
    boolean_result: bool,
    func: NativeImpl,
}

impl NativeFn {
    /// Wrap a closure as a native function
    pub fn new(
        name: impl Into<String>,
        boolean_result: bool,
        func: impl Fn(&[Value], &[(String, Value)]) -> HostResult<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(NativeFn {
            name: name.into(),
            boolean_result,
            func: Arc::new(func),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn boolean_result(&self) -> bool {
        self.boolean_result
    }

    /// Invoke the native implementation
    #[inline]
    pub fn call(&self, args: &[Value], kwargs: &[(String, Value)]) -> HostResult<Value> {
        (self.func)(args, kwargs)
    }
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFn")
            .field("name", &self.name)
            .field("boolean_result", &self.boolean_result)
            .finish()
    }
}

/// A module: a named, mutable attribute table
///
/// Attribute slots carry generation counters the same way namespace bindings
/// do, so attribute guards can detect replacement.
#[derive(Debug)]
pub struct Module {
    name: String,
    attrs: Namespace,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Module {
            name: name.into(),
            attrs: Namespace::new(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_attr(&self, attr: &str) -> Option<Value> {
        self.attrs.get(attr)
    }

    /// Set an attribute, bumping its generation
    pub fn set_attr(&self, attr: impl Into<String>, value: Value) {
        self.attrs.set(attr, value);
    }

    /// Generation of an attribute slot, if present
    pub fn attr_generation(&self, attr: &str) -> Option<u64> {
        self.attrs.generation_of(attr)
    }
}

/// A closure cell: a shared, mutable, possibly-empty slot
///
/// Cells are captured by reference when a function closes over an enclosing
/// local. Writes bump a generation counter so `deref_eq` guards can detect
/// rebinding without comparing values.
#[derive(Debug, Clone)]
pub struct Cell {
    inner: Arc<Mutex<CellSlot>>,
}

#[derive(Debug)]
struct CellSlot {
    value: Option<Value>,
    generation: u64,
}

impl Cell {
    /// Create a filled cell
    pub fn new(value: Value) -> Self {
        Cell {
            inner: Arc::new(Mutex::new(CellSlot {
                value: Some(value),
                generation: 0,
            })),
        }
    }

    /// Create an empty (unbound) cell
    pub fn empty() -> Self {
        Cell {
            inner: Arc::new(Mutex::new(CellSlot {
                value: None,
                generation: 0,
            })),
        }
    }

    /// Current contents, if the cell is filled
    pub fn get(&self) -> Option<Value> {
        self.inner.lock().value.clone()
    }

    /// Replace the contents, bumping the generation
    pub fn set(&self, value: Value) {
        let mut slot = self.inner.lock();
        slot.value = Some(value);
        slot.generation += 1;
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Identity comparison
    #[inline]
    pub fn same(&self, other: &Cell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// State for a live iterator over a list snapshot
#[derive(Debug)]
pub struct IterState {
    items: Vec<Value>,
    pos: Mutex<usize>,
}

impl IterState {
    pub fn new(items: Vec<Value>) -> Arc<Self> {
        Arc::new(IterState {
            items,
            pos: Mutex::new(0),
        })
    }

    /// Advance the iterator, returning the next element if any
    pub fn advance(&self) -> Option<Value> {
        let mut pos = self.pos.lock();
        let item = self.items.get(*pos).cloned();
        if item.is_some() {
            *pos += 1;
        }
        item
    }
}

/// Add two values: numeric addition, string and list concatenation
pub fn arith_add(l: &Value, r: &Value) -> HostResult<Value> {
    match (l, r) {
        (Value::Long(a), Value::Long(b)) => Ok(Value::Long(a.wrapping_add(*b))),
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
        (Value::List(a), Value::List(b)) => {
            let mut items = a.as_ref().clone();
            items.extend(b.iter().cloned());
            Ok(Value::list(items))
        }
        _ => numeric_binop(l, r, |a, b| Ok(Value::Float(a + b))),
    }
}

/// Subtract two numeric values
pub fn arith_sub(l: &Value, r: &Value) -> HostResult<Value> {
    match (l, r) {
        (Value::Long(a), Value::Long(b)) => Ok(Value::Long(a.wrapping_sub(*b))),
        _ => numeric_binop(l, r, |a, b| Ok(Value::Float(a - b))),
    }
}

/// Multiply two numeric values
pub fn arith_mul(l: &Value, r: &Value) -> HostResult<Value> {
    match (l, r) {
        (Value::Long(a), Value::Long(b)) => Ok(Value::Long(a.wrapping_mul(*b))),
        _ => numeric_binop(l, r, |a, b| Ok(Value::Float(a * b))),
    }
}

/// Divide two numeric values; always produces a float
pub fn arith_div(l: &Value, r: &Value) -> HostResult<Value> {
    numeric_binop(l, r, |a, b| {
        if b == 0.0 {
            Err(HostError::DivisionByZero)
        } else {
            Ok(Value::Float(a / b))
        }
    })
}

fn numeric_binop(
    l: &Value,
    r: &Value,
    f: impl Fn(f64, f64) -> HostResult<Value>,
) -> HostResult<Value> {
    match (l.as_float(), r.as_float()) {
        (Some(a), Some(b)) => f(a, b),
        (None, _) => Err(HostError::TypeError {
            expected: "number",
            got: l.type_name(),
        }),
        (_, None) => Err(HostError::TypeError {
            expected: "number",
            got: r.type_name(),
        }),
    }
}

/// Compare two values for ordering; numbers and strings are ordered
pub fn compare_values(l: &Value, r: &Value) -> HostResult<std::cmp::Ordering> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => match (l.as_float(), r.as_float()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).ok_or(HostError::TypeError {
                expected: "ordered number",
                got: "nan",
            }),
            _ => Err(HostError::TypeError {
                expected: "number or str",
                got: if l.as_float().is_none() {
                    l.type_name()
                } else {
                    r.type_name()
                },
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arith_promotion() {
        let v = arith_add(&Value::Long(1), &Value::Float(0.5)).unwrap();
        assert_eq!(v, Value::Float(1.5));
        let v = arith_mul(&Value::Long(6), &Value::Long(7)).unwrap();
        assert_eq!(v, Value::Long(42));
    }

    #[test]
    fn test_div_is_float() {
        assert_eq!(
            arith_div(&Value::Long(7), &Value::Long(2)).unwrap(),
            Value::Float(3.5)
        );
        assert_eq!(
            arith_div(&Value::Long(1), &Value::Long(0)),
            Err(HostError::DivisionByZero)
        );
    }

    #[test]
    fn test_str_concat() {
        assert_eq!(
            arith_add(&Value::str("foo"), &Value::str("bar")).unwrap(),
            Value::str("foobar")
        );
    }

    #[test]
    fn test_negative_index() {
        let list = Value::list(vec![Value::Long(1), Value::Long(2), Value::Long(3)]);
        assert_eq!(list.index(-1).unwrap(), Value::Long(3));
        assert_eq!(list.index(0).unwrap(), Value::Long(1));
        assert!(matches!(
            list.index(3),
            Err(HostError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_cell_generation() {
        let cell = Cell::new(Value::Long(10));
        assert_eq!(cell.generation(), 0);
        cell.set(Value::Long(11));
        assert_eq!(cell.generation(), 1);
        assert_eq!(cell.get(), Some(Value::Long(11)));
    }

    #[test]
    fn test_reference_identity() {
        let m = Module::new("math");
        let a = Value::Module(m.clone());
        let b = Value::Module(m);
        assert_eq!(a, b);
        let other = Value::Module(Module::new("math"));
        assert_ne!(a, other);
    }
}
