//! Core library: native classes and global functions
//!
//! The base object class carries the field-access protocol every value
//! dispatches through (`$loadField`, `$storeField`, `$eq`); the string,
//! array and range classes chain to it and add their own methods. Native
//! globals occupy the lowest global slots, in the order of
//! [`GLOBAL_NAMES`], which the resolver pre-registers so compile-time
//! indices line up with the values the VM installs.
//!
//! Iterator protocol: `iterate(it)` returns the first iterator state when
//! `it` is null (or absent, on the first lowered call), the next state
//! otherwise, and `false` when exhausted; `iteratorValue(it)` maps a state
//! to its element.

use crate::value::{Class, Closure, Function, NativeFn, Range, RuntimeError, Value};
use std::rc::Rc;

/// Names of the native globals, in slot order
pub const GLOBAL_NAMES: &[&str] = &["print", "str", "len"];

/// The native classes every VM run dispatches through
#[derive(Debug, Clone)]
pub struct CoreLib {
    /// Base class of every lookup chain
    pub object_class: Rc<Class>,
    /// Class of string values
    pub string_class: Rc<Class>,
    /// Class of array values
    pub array_class: Rc<Class>,
    /// Class of range values
    pub range_class: Rc<Class>,
}

impl CoreLib {
    /// Build the core classes and bind their native methods
    pub fn new() -> Self {
        let object_class = Rc::new(Class::new("Object", 0, None));
        object_class.bind("$loadField", native_closure("$loadField", object_load_field));
        object_class.bind("$storeField", native_closure("$storeField", object_store_field));
        object_class.bind("$eq", native_closure("$eq", object_eq));

        let string_class = Rc::new(Class::new("String", 0, Some(object_class.clone())));
        string_class.bind("$add", native_closure("$add", string_add));

        let array_class = Rc::new(Class::new("Array", 0, Some(object_class.clone())));
        array_class.bind("$loadAt", native_closure("$loadAt", array_load_at));
        array_class.bind("$storeAt", native_closure("$storeAt", array_store_at));
        array_class.bind("iterate", native_closure("iterate", array_iterate));
        array_class.bind(
            "iteratorValue",
            native_closure("iteratorValue", array_iterator_value),
        );
        array_class.bind("push", native_closure("push", array_push));
        array_class.bind("pop", native_closure("pop", array_pop));

        let range_class = Rc::new(Class::new("Range", 0, Some(object_class.clone())));
        range_class.bind("iterate", native_closure("iterate", range_iterate));
        range_class.bind(
            "iteratorValue",
            native_closure("iteratorValue", range_iterator_value),
        );

        Self {
            object_class,
            string_class,
            array_class,
            range_class,
        }
    }

    /// Values of the native globals, in [`GLOBAL_NAMES`] order
    pub fn globals(&self) -> Vec<Value> {
        vec![
            native_closure("print", native_print),
            native_closure("str", native_str),
            native_closure("len", native_len),
        ]
    }

    /// The class a value dispatches through
    pub fn class_of(&self, value: &Value) -> Rc<Class> {
        match value {
            Value::Instance(instance) => instance.class.clone(),
            Value::Class(class) => class
                .metaclass
                .clone()
                .unwrap_or_else(|| self.object_class.clone()),
            Value::Str(_) => self.string_class.clone(),
            Value::Array(_) => self.array_class.clone(),
            Value::Range(_) => self.range_class.clone(),
            _ => self.object_class.clone(),
        }
    }
}

impl Default for CoreLib {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a native function in a closure value
fn native_closure(name: &str, callback: NativeFn) -> Value {
    Value::Closure(Rc::new(Closure::new(Rc::new(Function::native(
        name, callback,
    )))))
}

// ===== Global natives =====

fn native_print(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let text = args
        .iter()
        .map(|v| v.to_display_string())
        .collect::<Vec<_>>()
        .join(" ");
    println!("{}", text);
    Ok(Value::Null)
}

fn native_str(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let value = args.first().ok_or(RuntimeError::NativeArgs {
        name: "str",
        message: "expected one argument".to_string(),
    })?;
    Ok(Value::string(value.to_display_string()))
}

fn native_len(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let value = args.first().ok_or(RuntimeError::NativeArgs {
        name: "len",
        message: "expected one argument".to_string(),
    })?;
    let len = match value {
        Value::Str(s) => s.chars().count(),
        Value::Array(a) => a.borrow().len(),
        Value::Range(r) => r.count(),
        other => {
            return Err(RuntimeError::NativeArgs {
                name: "len",
                message: format!("cannot take the length of a {}", other.type_name()),
            })
        }
    };
    Ok(Value::Int(len as i32))
}

// ===== Object protocol =====

/// `$loadField(object, key)`
///
/// Integer keys index instance slots (static slots when the receiver is a
/// class). String keys resolve through the receiver's class table: an
/// `Int(slot)` binding indirects into the slot vector, anything else (a
/// method closure) is returned as-is.
fn object_load_field(core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let [object, key] = args else {
        return Err(RuntimeError::NativeArgs {
            name: "$loadField",
            message: format!("expected object and key, got {} arguments", args.len()),
        });
    };

    match key {
        Value::Int(idx) => read_slot(object, *idx),
        Value::Str(name) => {
            let class = core.class_of(object);
            match class.lookup_super(name) {
                Some(Value::Int(idx)) => read_slot(object, idx),
                Some(value) => Ok(value),
                None => Err(RuntimeError::UnknownMethod {
                    class: class.name.clone(),
                    name: name.as_ref().clone(),
                }),
            }
        }
        other => Err(RuntimeError::TypeError(format!(
            "field key must be an integer or string, not {}",
            other.type_name()
        ))),
    }
}

/// `$storeField(value, object, key)` — returns the stored value
fn object_store_field(core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let [value, object, key] = args else {
        return Err(RuntimeError::NativeArgs {
            name: "$storeField",
            message: format!(
                "expected value, object and key, got {} arguments",
                args.len()
            ),
        });
    };

    match key {
        Value::Int(idx) => write_slot(object, *idx, value.clone()),
        Value::Str(name) => {
            let class = core.class_of(object);
            match class.lookup_super(name) {
                Some(Value::Int(idx)) => write_slot(object, idx, value.clone()),
                _ => Err(RuntimeError::UnknownMethod {
                    class: class.name.clone(),
                    name: name.as_ref().clone(),
                }),
            }
        }
        other => Err(RuntimeError::TypeError(format!(
            "field key must be an integer or string, not {}",
            other.type_name()
        ))),
    }
}

/// `$eq(a, b)` — structural for scalars and strings, identity otherwise
fn object_eq(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let [a, b] = args else {
        return Err(RuntimeError::NativeArgs {
            name: "$eq",
            message: format!("expected two operands, got {}", args.len()),
        });
    };
    Ok(Value::Bool(a == b))
}

fn read_slot(object: &Value, idx: i32) -> Result<Value, RuntimeError> {
    match object {
        Value::Instance(instance) => instance.var(idx as usize).ok_or_else(|| {
            RuntimeError::TypeError(format!(
                "instance of {} has no member slot {}",
                instance.class.name, idx
            ))
        }),
        Value::Class(class) => class.static_var(idx as usize).ok_or_else(|| {
            RuntimeError::TypeError(format!("class {} has no static slot {}", class.name, idx))
        }),
        other => Err(RuntimeError::TypeError(format!(
            "cannot access fields of a {}",
            other.type_name()
        ))),
    }
}

fn write_slot(object: &Value, idx: i32, value: Value) -> Result<Value, RuntimeError> {
    let stored = match object {
        Value::Instance(instance) => instance.set_var(idx as usize, value.clone()),
        Value::Class(class) => class.set_static_var(idx as usize, value.clone()),
        other => {
            return Err(RuntimeError::TypeError(format!(
                "cannot access fields of a {}",
                other.type_name()
            )))
        }
    };
    if stored {
        Ok(value)
    } else {
        Err(RuntimeError::TypeError(format!(
            "no member slot {} on {}",
            idx,
            object.type_name()
        )))
    }
}

// ===== String methods =====

fn string_add(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let [a, b] = args else {
        return Err(RuntimeError::NativeArgs {
            name: "$add",
            message: format!("expected two operands, got {}", args.len()),
        });
    };
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::string(format!("{}{}", a, b))),
        (Value::Str(_), other) => Err(RuntimeError::TypeError(format!(
            "cannot concatenate string and {}",
            other.type_name()
        ))),
        _ => Err(RuntimeError::TypeError(
            "string $add requires a string receiver".to_string(),
        )),
    }
}

// ===== Array methods =====

fn array_ref(
    value: &Value,
    name: &'static str,
) -> Result<Rc<std::cell::RefCell<Vec<Value>>>, RuntimeError> {
    match value {
        Value::Array(array) => Ok(array.clone()),
        other => Err(RuntimeError::NativeArgs {
            name,
            message: format!("receiver must be an array, not {}", other.type_name()),
        }),
    }
}

fn index_of(value: &Value, len: usize, name: &'static str) -> Result<usize, RuntimeError> {
    let idx = match value {
        Value::Int(idx) => *idx,
        other => {
            return Err(RuntimeError::NativeArgs {
                name,
                message: format!("index must be an integer, not {}", other.type_name()),
            })
        }
    };
    if idx < 0 || idx as usize >= len {
        return Err(RuntimeError::IndexOutOfBounds { index: idx, len });
    }
    Ok(idx as usize)
}

/// `$loadAt(array, index)`
fn array_load_at(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let [object, key] = args else {
        return Err(RuntimeError::NativeArgs {
            name: "$loadAt",
            message: format!("expected array and index, got {} arguments", args.len()),
        });
    };
    let array = array_ref(object, "$loadAt")?;
    let items = array.borrow();
    let idx = index_of(key, items.len(), "$loadAt")?;
    Ok(items[idx].clone())
}

/// `$storeAt(value, array, index)` — returns the stored value
fn array_store_at(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let [value, object, key] = args else {
        return Err(RuntimeError::NativeArgs {
            name: "$storeAt",
            message: format!(
                "expected value, array and index, got {} arguments",
                args.len()
            ),
        });
    };
    let array = array_ref(object, "$storeAt")?;
    let mut items = array.borrow_mut();
    let idx = index_of(key, items.len(), "$storeAt")?;
    items[idx] = value.clone();
    Ok(value.clone())
}

fn array_iterate(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_ref(args.first().unwrap_or(&Value::Null), "iterate")?;
    let len = array.borrow().len();
    let state = args.get(1).cloned().unwrap_or(Value::Null);

    let next = match state {
        Value::Null => 0,
        Value::Int(i) => i as i64 + 1,
        other => {
            return Err(RuntimeError::NativeArgs {
                name: "iterate",
                message: format!("bad iterator state {}", other.type_name()),
            })
        }
    };
    if next >= 0 && (next as usize) < len {
        Ok(Value::Int(next as i32))
    } else {
        Ok(Value::Bool(false))
    }
}

fn array_iterator_value(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_ref(args.first().unwrap_or(&Value::Null), "iteratorValue")?;
    let items = array.borrow();
    let idx = index_of(
        args.get(1).unwrap_or(&Value::Null),
        items.len(),
        "iteratorValue",
    )?;
    Ok(items[idx].clone())
}

/// `push(array, value)` — appends and returns the array
fn array_push(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let [object, value] = args else {
        return Err(RuntimeError::NativeArgs {
            name: "push",
            message: format!("expected array and value, got {} arguments", args.len()),
        });
    };
    let array = array_ref(object, "push")?;
    array.borrow_mut().push(value.clone());
    Ok(object.clone())
}

/// `pop(array)` — removes and returns the last element, null when empty
fn array_pop(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_ref(args.first().unwrap_or(&Value::Null), "pop")?;
    let popped = array.borrow_mut().pop();
    Ok(popped.unwrap_or(Value::Null))
}

// ===== Range methods =====

fn range_of(value: &Value, name: &'static str) -> Result<Rc<Range>, RuntimeError> {
    match value {
        Value::Range(range) => Ok(range.clone()),
        other => Err(RuntimeError::NativeArgs {
            name,
            message: format!("receiver must be a range, not {}", other.type_name()),
        }),
    }
}

/// Range iteration is half-open: `a..b` never yields `b`
fn range_iterate(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    let range = range_of(args.first().unwrap_or(&Value::Null), "iterate")?;
    let state = args.get(1).cloned().unwrap_or(Value::Null);

    let next = match state {
        Value::Null => {
            if range.start == range.end {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Int(range.start));
        }
        Value::Int(i) => i as i64 + range.step as i64,
        other => {
            return Err(RuntimeError::NativeArgs {
                name: "iterate",
                message: format!("bad iterator state {}", other.type_name()),
            })
        }
    };

    let exhausted = if range.step > 0 {
        next >= range.end as i64
    } else {
        next <= range.end as i64
    };
    if exhausted {
        Ok(Value::Bool(false))
    } else {
        Ok(Value::Int(next as i32))
    }
}

/// A range's iterator state is the yielded value itself
fn range_iterator_value(_core: &CoreLib, args: &[Value]) -> Result<Value, RuntimeError> {
    range_of(args.first().unwrap_or(&Value::Null), "iteratorValue")?;
    match args.get(1) {
        Some(Value::Int(i)) => Ok(Value::Int(*i)),
        _ => Err(RuntimeError::NativeArgs {
            name: "iteratorValue",
            message: "bad iterator state".to_string(),
        }),
    }
}
