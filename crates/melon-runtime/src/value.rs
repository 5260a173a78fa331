//! Runtime value representation
//!
//! Scalars are stored inline; strings and every other heap object are
//! reference-counted. Equality is structural for scalars and strings and
//! identity for heap objects. Reference cycles created through upvalue
//! self-capture are never collected.

use crate::bytecode::Chunk;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Signature of a host-native function
///
/// Natives receive the core library (the counterpart of the VM pointer in
/// a C embedding) so protocol methods can resolve classes for any receiver.
pub type NativeFn = fn(&crate::stdlib::CoreLib, &[Value]) -> Result<Value, RuntimeError>;

/// Runtime value type
#[derive(Debug, Clone)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i32),
    /// Float value
    Float(f64),
    /// String value (reference-counted)
    Str(Rc<String>),
    /// Closure (function plus bound upvalues)
    Closure(Rc<Closure>),
    /// Class value
    Class(Rc<Class>),
    /// Class instance
    Instance(Rc<Instance>),
    /// Array value (reference-counted, mutable)
    Array(Rc<RefCell<Vec<Value>>>),
    /// Integer range
    Range(Rc<Range>),
}

impl Value {
    /// Create a new string value
    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(Rc::new(s.into()))
    }

    /// Create a new array value
    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(values)))
    }

    /// Short name of this value's type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Closure(_) => "closure",
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::Array(_) => "array",
            Value::Range(_) => "range",
        }
    }

    /// Get a string representation of this value
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.as_ref().clone(),
            Value::Closure(c) => {
                if c.function.is_native() {
                    format!("<native fn {}>", c.function.name)
                } else {
                    format!("<fn {}>", c.function.name)
                }
            }
            Value::Class(c) => format!("<class {}>", c.name),
            Value::Instance(i) => format!("<instance {}>", i.class.name),
            Value::Array(a) => {
                let items: Vec<String> =
                    a.borrow().iter().map(|v| v.to_display_string()).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Range(r) => format!("{}..{}", r.start, r.end),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

/// How a function is implemented
#[derive(Debug)]
pub enum FunctionKind {
    /// Compiled Melon bytecode
    Melon {
        /// Bytecode and constant pool
        chunk: Chunk,
        /// Number of upvalues closures over this function bind
        upvalue_count: u8,
    },
    /// Host-native callback
    Native(NativeFn),
}

/// Function record
#[derive(Debug)]
pub struct Function {
    /// Function name (used in display and disassembly)
    pub name: String,
    /// Implementation
    pub kind: FunctionKind,
}

impl Function {
    /// Create a native function
    pub fn native(name: impl Into<String>, callback: NativeFn) -> Self {
        Self {
            name: name.into(),
            kind: FunctionKind::Native(callback),
        }
    }

    /// Create a Melon function from a compiled chunk
    pub fn melon(name: impl Into<String>, chunk: Chunk, upvalue_count: u8) -> Self {
        Self {
            name: name.into(),
            kind: FunctionKind::Melon {
                chunk,
                upvalue_count,
            },
        }
    }

    /// Whether this function is host-native
    pub fn is_native(&self) -> bool {
        matches!(self.kind, FunctionKind::Native(_))
    }

    /// The function's chunk, if it is a Melon function
    pub fn chunk(&self) -> Option<&Chunk> {
        match &self.kind {
            FunctionKind::Melon { chunk, .. } => Some(chunk),
            FunctionKind::Native(_) => None,
        }
    }

    /// Declared upvalue count (zero for natives)
    pub fn upvalue_count(&self) -> u8 {
        match &self.kind {
            FunctionKind::Melon { upvalue_count, .. } => *upvalue_count,
            FunctionKind::Native(_) => 0,
        }
    }
}

/// A function paired with its bound upvalues
#[derive(Debug)]
pub struct Closure {
    /// The wrapped function
    pub function: Rc<Function>,
    /// Bound upvalues; length equals the function's declared upvalue count
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    /// Wrap a function with no upvalues bound
    pub fn new(function: Rc<Function>) -> Self {
        Self {
            function,
            upvalues: Vec::new(),
        }
    }
}

/// A captured variable
///
/// Open upvalues index into the VM value stack; closing copies the live
/// value into the upvalue's own cell.
#[derive(Debug, Clone)]
pub enum Upvalue {
    /// Still on the stack, at this slot
    Open(usize),
    /// Escaped; owns its value
    Closed(Value),
}

impl Upvalue {
    /// The stack slot of an open upvalue
    pub fn slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        }
    }
}

/// Class record
///
/// The table maps member names to values: data members bind to `Int(slot)`
/// and methods bind to their closures. Static members live as members of
/// the metaclass, with their values in `static_vars`.
#[derive(Debug)]
pub struct Class {
    /// Class name
    pub name: String,
    /// Number of instance variable slots
    pub nvars: u16,
    /// Member/method table
    table: RefCell<HashMap<String, Value>>,
    /// Superclass chain (links user and collection classes to the base
    /// object class; there is no user-facing inheritance)
    pub superclass: Option<Rc<Class>>,
    /// Metaclass carrying static members
    pub metaclass: Option<Rc<Class>>,
    /// Whether the metaclass initializer has run
    meta_inited: Cell<bool>,
    /// Static variable values (allocated when the metaclass initializes)
    static_vars: RefCell<Vec<Value>>,
}

impl Class {
    /// Create a class without a metaclass
    pub fn new(name: impl Into<String>, nvars: u16, superclass: Option<Rc<Class>>) -> Self {
        Self {
            name: name.into(),
            nvars,
            table: RefCell::new(HashMap::new()),
            superclass,
            metaclass: None,
            meta_inited: Cell::new(false),
            static_vars: RefCell::new(Vec::new()),
        }
    }

    /// Create a class with a metaclass for its static members
    pub fn with_meta(
        name: impl Into<String>,
        nvars: u16,
        superclass: Option<Rc<Class>>,
        metaclass: Rc<Class>,
    ) -> Self {
        Self {
            metaclass: Some(metaclass),
            ..Self::new(name, nvars, superclass)
        }
    }

    /// Bind a member name to a value
    pub fn bind(&self, name: impl Into<String>, value: Value) {
        self.table.borrow_mut().insert(name.into(), value);
    }

    /// Look up a member in this class only
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.table.borrow().get(name).cloned()
    }

    /// Look up a member through the superclass chain
    pub fn lookup_super(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.lookup(name) {
            return Some(value);
        }
        let mut current = self.superclass.clone();
        while let Some(class) = current {
            if let Some(value) = class.lookup(name) {
                return Some(value);
            }
            current = class.superclass.clone();
        }
        None
    }

    /// Look up a member in this class only, expecting a closure
    pub fn lookup_closure(&self, name: &str) -> Option<Rc<Closure>> {
        match self.lookup(name) {
            Some(Value::Closure(closure)) => Some(closure),
            _ => None,
        }
    }

    /// Whether the metaclass initializer has already run
    pub fn meta_inited(&self) -> bool {
        self.meta_inited.get()
    }

    /// Mark the metaclass initializer as run
    pub fn set_meta_inited(&self) {
        self.meta_inited.set(true);
    }

    /// Allocate the static variable vector
    pub fn init_static_vars(&self, count: usize) {
        *self.static_vars.borrow_mut() = vec![Value::Null; count];
    }

    /// Read a static variable slot
    pub fn static_var(&self, idx: usize) -> Option<Value> {
        self.static_vars.borrow().get(idx).cloned()
    }

    /// Write a static variable slot
    pub fn set_static_var(&self, idx: usize, value: Value) -> bool {
        match self.static_vars.borrow_mut().get_mut(idx) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

/// Class instance
#[derive(Debug)]
pub struct Instance {
    /// The instance's class
    pub class: Rc<Class>,
    /// Instance variable slots (`class.nvars` entries)
    vars: RefCell<Vec<Value>>,
}

impl Instance {
    /// Allocate an instance with all slots null
    pub fn new(class: Rc<Class>) -> Self {
        let nvars = class.nvars as usize;
        Self {
            class,
            vars: RefCell::new(vec![Value::Null; nvars]),
        }
    }

    /// Read an instance variable slot
    pub fn var(&self, idx: usize) -> Option<Value> {
        self.vars.borrow().get(idx).cloned()
    }

    /// Write an instance variable slot
    pub fn set_var(&self, idx: usize, value: Value) -> bool {
        match self.vars.borrow_mut().get_mut(idx) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

/// Integer range with inferred step sign; the end is exclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    /// First value
    pub start: i32,
    /// Exclusive bound
    pub end: i32,
    /// `+1` when `end > start`, else `-1`
    pub step: i32,
}

impl Range {
    /// Create a range, inferring the step from the endpoint order
    pub fn new(start: i32, end: i32) -> Self {
        let step = if end > start { 1 } else { -1 };
        Self { start, end, step }
    }

    /// Number of values the range yields
    pub fn count(&self) -> usize {
        (self.end as i64 - self.start as i64).unsigned_abs() as usize
    }
}

/// Runtime error type
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    /// Type error
    #[error("type error: {0}")]
    TypeError(String),
    /// Unknown method on a class
    #[error("class {class} does not have method '{name}'")]
    UnknownMethod {
        /// Receiver's class name
        class: String,
        /// Looked-up method name
        name: String,
    },
    /// Call target is neither a closure nor a class
    #[error("cannot call non-class or non-closure value of type {0}")]
    NotCallable(&'static str),
    /// A class without an initializer was instantiated
    #[error("missing init function in class {0}")]
    MissingInit(String),
    /// Range endpoints were not integers
    #[error("range start and end must be integers")]
    RangeBounds,
    /// Array index out of bounds
    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds {
        /// Offending index
        index: i32,
        /// Array length
        len: usize,
    },
    /// Integer division or modulo by zero
    #[error("division by zero")]
    DivisionByZero,
    /// Value stack underflow
    #[error("stack underflow")]
    StackUnderflow,
    /// Malformed instruction stream
    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),
    /// Native function called with the wrong arguments
    #[error("{name}: {message}")]
    NativeArgs {
        /// Native function name
        name: &'static str,
        /// What was wrong
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_equality_is_structural() {
        assert_eq!(Value::Int(42), Value::Int(42));
        assert_eq!(Value::string("hi"), Value::string("hi"));
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn test_heap_equality_is_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_display_strings() {
        assert_eq!(Value::Null.to_display_string(), "null");
        assert_eq!(Value::Int(7).to_display_string(), "7");
        assert_eq!(
            Value::array(vec![Value::Int(1), Value::Int(2)]).to_display_string(),
            "[1, 2]"
        );
        assert_eq!(
            Value::Range(Rc::new(Range::new(0, 5))).to_display_string(),
            "0..5"
        );
    }

    #[test]
    fn test_range_step_inference() {
        assert_eq!(Range::new(0, 5).step, 1);
        assert_eq!(Range::new(5, 0).step, -1);
        assert_eq!(Range::new(3, 3).step, -1);
        assert_eq!(Range::new(0, 5).count(), 5);
    }

    #[test]
    fn test_class_lookup_chain() {
        let base = Rc::new(Class::new("Object", 0, None));
        base.bind("$eq", Value::Int(1));
        let class = Class::new("Point", 2, Some(base));
        assert!(class.lookup("$eq").is_none());
        assert_eq!(class.lookup_super("$eq"), Some(Value::Int(1)));
    }

    #[test]
    fn test_instance_slots() {
        let class = Rc::new(Class::new("Point", 2, None));
        let inst = Instance::new(class);
        assert_eq!(inst.var(0), Some(Value::Null));
        assert!(inst.set_var(1, Value::Int(9)));
        assert_eq!(inst.var(1), Some(Value::Int(9)));
        assert!(!inst.set_var(2, Value::Null));
    }
}
