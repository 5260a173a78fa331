//! Stack-based virtual machine
//!
//! Executes per-function chunks with a growable value stack and a call
//! stack of frames. Dispatch is a flat match on the next byte.
//!
//! - Arithmetic has a fast path for Int/Float pairs (Int stays Int, any
//!   Float promotes); a type mismatch falls back to the matching operator
//!   method (`$add`, `$sub`, `$mul`, `$div`, `$eq`) on the left operand's
//!   class.
//! - Field and subscript access dispatch through `$loadField` /
//!   `$storeField` / `$loadAt` / `$storeAt` on the receiver's class.
//! - Upvalues hold stack-slot indices while open; the open-upvalue list is
//!   kept sorted ascending by slot, so closing a frame's upvalues is a
//!   suffix walk.
//! - `JumpIfFalse` branches only when the popped value is `false`; every
//!   other value, including null, falls through.
//! - Stores peek without popping and expression statements never pop, so
//!   statement residue accumulates on the value stack by design.

mod frame;

pub use frame::CallFrame;

use crate::bytecode::{Chunk, Opcode};
use crate::stdlib::CoreLib;
use crate::value::{Closure, Function, FunctionKind, Instance, Range, RuntimeError, Upvalue, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Why the dispatch loop stopped
enum Exit {
    /// `HALT` was executed
    Halted,
    /// A return popped past the reentry frame
    Returned(Value),
}

/// Virtual machine state
pub struct Vm {
    /// Value stack
    stack: Vec<Value>,
    /// Global slots (native globals in the lowest slots)
    globals: Vec<Value>,
    /// Call frames
    frames: Vec<CallFrame>,
    /// Open upvalues, sorted ascending by stack slot
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    /// Currently executing closure
    closure: Rc<Closure>,
    /// Instruction pointer into the current chunk
    ip: usize,
    /// Base pointer of the current frame
    bp: usize,
    /// Core library classes for protocol dispatch
    core: CoreLib,
}

impl Vm {
    /// Create a VM with `global_count` global slots, installing the core
    /// natives into their reserved slots
    pub fn new(core: CoreLib, global_count: usize) -> Self {
        let natives = core.globals();
        let mut globals = vec![Value::Null; global_count.max(natives.len())];
        for (idx, value) in natives.into_iter().enumerate() {
            globals[idx] = value;
        }

        let idle = Rc::new(Closure::new(Rc::new(Function::melon(
            "<idle>",
            Chunk::new(),
            0,
        ))));

        Self {
            stack: Vec::with_capacity(256),
            globals,
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            closure: idle,
            ip: 0,
            bp: 0,
            core,
        }
    }

    /// Run a compiled top-level function until `HALT`
    ///
    /// Returns the value left on top of the stack, if any (the value of
    /// the program's last expression statement).
    pub fn run_main(&mut self, main: Rc<Function>) -> Result<Option<Value>, RuntimeError> {
        self.closure = Rc::new(Closure::new(main));
        self.ip = 0;
        self.bp = 0;
        self.dispatch(0)?;
        Ok(self.stack.last().cloned())
    }

    /// Reenter the dispatch loop to invoke a user closure
    ///
    /// The frame is pushed with `caller_owns_slot = false`, so the host's
    /// stack window is preserved and the return value is handed back
    /// rather than written beneath the arguments.
    pub fn run_closure(
        &mut self,
        closure: &Rc<Closure>,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        if let FunctionKind::Native(callback) = &closure.function.kind {
            return callback(&self.core, args);
        }

        for arg in args {
            self.push(arg.clone());
        }
        let base = self.stack.len() - args.len();
        let exit_depth = self.frames.len() + 1;
        self.call_closure(closure.clone(), base, args.len(), false)?;

        match self.dispatch(exit_depth)? {
            Exit::Returned(value) => Ok(value),
            Exit::Halted => Ok(Value::Null),
        }
    }

    // ===== Dispatch =====

    fn dispatch(&mut self, exit_depth: usize) -> Result<Exit, RuntimeError> {
        loop {
            let opcode = self.read_opcode()?;
            match opcode {
                Opcode::Nop => {}

                // ===== Loads =====
                Opcode::LoadLocal => {
                    let idx = self.read_u8()? as usize;
                    let value = self
                        .stack
                        .get(self.bp + idx)
                        .cloned()
                        .ok_or(RuntimeError::StackUnderflow)?;
                    self.push(value);
                }
                Opcode::LoadInt => {
                    let value = self.read_u8()?;
                    self.push(Value::Int(value as i32));
                }
                Opcode::LoadConst => self.op_load_const()?,
                Opcode::LoadGlobal => {
                    let idx = self.read_u8()? as usize;
                    let value = self.globals.get(idx).cloned().ok_or_else(|| {
                        RuntimeError::InvalidBytecode(format!("global slot {} out of range", idx))
                    })?;
                    self.push(value);
                }
                Opcode::LoadUpvalue => {
                    let idx = self.read_u8()? as usize;
                    let upvalue = self.upvalue(idx)?;
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(slot) => self
                            .stack
                            .get(*slot)
                            .cloned()
                            .ok_or(RuntimeError::StackUnderflow)?,
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                Opcode::LoadField => {
                    let mode = self.read_u8()?;
                    let object = self.peek(1)?.clone();
                    self.invoke_protocol("$loadField", 2)?;
                    // a method load leaves the receiver above the method so
                    // it becomes argument 0 of the upcoming call
                    if mode != 0 {
                        self.push(object);
                    }
                }
                Opcode::LoadAt => self.invoke_protocol("$loadAt", 2)?,

                // ===== Stores (peek, never pop) =====
                Opcode::StoreLocal => {
                    let idx = self.read_u8()? as usize;
                    let value = self.peek(0)?.clone();
                    let slot = self.bp + idx;
                    if slot >= self.stack.len() {
                        self.stack.resize(slot + 1, Value::Null);
                    }
                    self.stack[slot] = value;
                }
                Opcode::StoreGlobal => {
                    let idx = self.read_u8()? as usize;
                    let value = self.peek(0)?.clone();
                    *self.globals.get_mut(idx).ok_or_else(|| {
                        RuntimeError::InvalidBytecode(format!("global slot {} out of range", idx))
                    })? = value;
                }
                Opcode::StoreUpvalue => {
                    let idx = self.read_u8()? as usize;
                    let value = self.peek(0)?.clone();
                    let upvalue = self.upvalue(idx)?;
                    let open_slot = match &mut *upvalue.borrow_mut() {
                        Upvalue::Open(slot) => Some(*slot),
                        Upvalue::Closed(cell) => {
                            *cell = value.clone();
                            None
                        }
                    };
                    if let Some(slot) = open_slot {
                        *self
                            .stack
                            .get_mut(slot)
                            .ok_or(RuntimeError::StackUnderflow)? = value;
                    }
                }
                Opcode::StoreField => self.invoke_protocol("$storeField", 3)?,
                Opcode::StoreAt => self.invoke_protocol("$storeAt", 3)?,

                // ===== Closures and calls =====
                Opcode::Closure => self.op_closure()?,
                Opcode::NewUpvalue => {
                    return Err(RuntimeError::InvalidBytecode(
                        "NEWUP outside a CLOSURE sequence".to_string(),
                    ))
                }
                Opcode::Call => self.op_call()?,

                // ===== Branches =====
                Opcode::Jump => {
                    let at = self.ip;
                    let offset = self.read_u16()? as usize;
                    self.ip = at + offset;
                }
                Opcode::Loop => {
                    let at = self.ip;
                    let offset = self.read_u16()? as usize;
                    self.ip = at.checked_sub(offset).ok_or_else(|| {
                        RuntimeError::InvalidBytecode("backward branch underflow".to_string())
                    })?;
                }
                Opcode::JumpIfFalse => {
                    let at = self.ip;
                    let offset = self.read_u16()? as usize;
                    let value = self.pop()?;
                    if value == Value::Bool(false) {
                        self.ip = at + offset;
                    }
                }

                // ===== Returns =====
                Opcode::Return => {
                    if let Some(value) = self.op_return(exit_depth)? {
                        return Ok(Exit::Returned(value));
                    }
                }
                Opcode::Return0 => {
                    if let Some(value) = self.op_return0(exit_depth)? {
                        return Ok(Exit::Returned(value));
                    }
                }

                // ===== Arithmetic and logic =====
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => self.op_arith(opcode)?,
                Opcode::Mod => self.op_mod()?,
                Opcode::And | Opcode::Or => self.op_logic(opcode)?,
                Opcode::Lt | Opcode::Gt | Opcode::Lte | Opcode::Gte => self.op_ordering(opcode)?,
                Opcode::Eq => self.op_equality(false)?,
                Opcode::Neq => self.op_equality(true)?,
                Opcode::Not => {
                    let value = self.pop()?;
                    match value {
                        Value::Bool(b) => self.push(Value::Bool(!b)),
                        other => {
                            return Err(RuntimeError::TypeError(format!(
                                "operand of '!' must be a bool, not {}",
                                other.type_name()
                            )))
                        }
                    }
                }
                Opcode::Neg => {
                    let value = self.pop()?;
                    match value {
                        Value::Int(n) => self.push(Value::Int(n.wrapping_neg())),
                        Value::Float(f) => self.push(Value::Float(-f)),
                        other => {
                            return Err(RuntimeError::TypeError(format!(
                                "operand of unary '-' must be numeric, not {}",
                                other.type_name()
                            )))
                        }
                    }
                }

                // ===== Constructors =====
                Opcode::NewArray => {
                    let count = self.read_u8()? as usize;
                    let start = self
                        .stack
                        .len()
                        .checked_sub(count)
                        .ok_or(RuntimeError::StackUnderflow)?;
                    let items = self.stack.split_off(start);
                    self.push(Value::array(items));
                }
                Opcode::NewRange => {
                    let end = self.pop()?;
                    let start = self.pop()?;
                    match (start, end) {
                        (Value::Int(start), Value::Int(end)) => {
                            self.push(Value::Range(Rc::new(Range::new(start, end))));
                        }
                        _ => return Err(RuntimeError::RangeBounds),
                    }
                }

                Opcode::Halt => return Ok(Exit::Halted),
            }
        }
    }

    // ===== Opcode implementations =====

    /// `LOADK`: push a constant; a class value is pushed twice and its
    /// metaclass initializer runs the first time the class is loaded
    fn op_load_const(&mut self) -> Result<(), RuntimeError> {
        let idx = self.read_u8()? as usize;
        let value = self.chunk_constant(idx)?;
        self.push(value.clone());

        if let Value::Class(class) = value {
            // second copy is the receiver slot for the metaclass $init
            self.push(Value::Class(class.clone()));
            if class.meta_inited() {
                return Ok(());
            }
            let Some(metaclass) = class.metaclass.clone() else {
                return Ok(());
            };
            class.init_static_vars(metaclass.nvars as usize);
            // flag is set before the call so a reentrant load of this
            // class during static initialization does not recurse
            class.set_meta_inited();
            if let Some(init) = metaclass.lookup_closure("$init") {
                let base = self.stack.len() - 1;
                self.call_closure(init, base, 0, false)?;
            }
        }
        Ok(())
    }

    /// `CLOSURE`: wrap the popped function, consuming one `NEWUP` pair per
    /// declared upvalue
    fn op_closure(&mut self) -> Result<(), RuntimeError> {
        let proto = self.pop()?;
        let Value::Closure(proto) = proto else {
            return Err(RuntimeError::InvalidBytecode(
                "CLOSURE expects a function value".to_string(),
            ));
        };
        let function = proto.function.clone();
        let count = function.upvalue_count() as usize;

        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            let byte = self.read_u8()?;
            if Opcode::try_from(byte) != Ok(Opcode::NewUpvalue) {
                return Err(RuntimeError::InvalidBytecode(
                    "expected instruction NEWUP".to_string(),
                ));
            }
            let is_direct = self.read_u8()? != 0;
            let idx = self.read_u8()? as usize;
            let upvalue = if is_direct {
                self.capture_upvalue(self.bp + idx)
            } else {
                self.upvalue(idx)?
            };
            upvalues.push(upvalue);
        }

        self.push(Value::Closure(Rc::new(Closure { function, upvalues })));
        Ok(())
    }

    /// `CALL n`: closures push a frame (natives run inline); classes
    /// allocate an instance and run `$init` with the instance in the
    /// receiver slot
    fn op_call(&mut self) -> Result<(), RuntimeError> {
        let nargs = self.read_u8()? as usize;
        let callee_idx = self
            .stack
            .len()
            .checked_sub(nargs + 1)
            .ok_or(RuntimeError::StackUnderflow)?;
        let callee = self.stack[callee_idx].clone();

        match callee {
            Value::Closure(closure) => {
                let base = self.stack.len() - nargs;
                self.call_closure(closure, base, nargs, true)
            }
            Value::Class(class) => {
                // class calls reuse the class value's slot as receiver
                // slot 0, so the construction result lands at the frame
                // base rather than beneath it
                if let Some(new_closure) = class
                    .metaclass
                    .as_ref()
                    .and_then(|meta| meta.lookup_closure("$new"))
                {
                    return self.call_closure(new_closure, callee_idx, nargs, false);
                }

                let instance = Value::Instance(Rc::new(Instance::new(class.clone())));
                let init = class
                    .lookup_closure("$init")
                    .ok_or_else(|| RuntimeError::MissingInit(class.name.clone()))?;
                let init_is_native = init.function.is_native();
                self.call_closure(init, callee_idx, nargs, false)?;
                if !init_is_native {
                    // the class value sat in the receiver slot; replace it
                    // so $init sees the instance as its receiver
                    self.stack[self.bp] = instance;
                }
                Ok(())
            }
            other => Err(RuntimeError::NotCallable(other.type_name())),
        }
    }

    fn op_return(&mut self, exit_depth: usize) -> Result<Option<Value>, RuntimeError> {
        let frame = self.frames.pop().ok_or_else(|| {
            RuntimeError::InvalidBytecode("return outside of a function".to_string())
        })?;
        self.close_upvalues(self.bp);

        let result = self.peek(0)?.clone();
        let dst = self
            .bp
            .checked_sub(frame.caller_owns_slot as usize)
            .ok_or(RuntimeError::StackUnderflow)?;
        let exiting = self.frames.len() < exit_depth;

        if exiting {
            // hand the value back to the host, leaving its window intact
            self.stack.truncate(dst);
        } else {
            *self
                .stack
                .get_mut(dst)
                .ok_or(RuntimeError::StackUnderflow)? = result.clone();
            self.stack.truncate(dst + 1);
        }

        self.ip = frame.return_ip;
        self.closure = frame.closure;
        self.bp = frame.base;
        Ok(exiting.then_some(result))
    }

    fn op_return0(&mut self, exit_depth: usize) -> Result<Option<Value>, RuntimeError> {
        let frame = self.frames.pop().ok_or_else(|| {
            RuntimeError::InvalidBytecode("return outside of a function".to_string())
        })?;
        self.close_upvalues(self.bp);

        // no value was produced: discard the frame and the caller-owned
        // callee slot beneath it
        let dst = self
            .bp
            .checked_sub(frame.caller_owns_slot as usize)
            .ok_or(RuntimeError::StackUnderflow)?;
        self.stack.truncate(dst);

        self.ip = frame.return_ip;
        self.closure = frame.closure;
        self.bp = frame.base;
        let exiting = self.frames.len() < exit_depth;
        Ok(exiting.then_some(Value::Null))
    }

    fn op_arith(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;

        let fast = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Some(int_arith(opcode, *x, *y)?),
            (Value::Int(x), Value::Float(y)) => {
                Some(Value::Float(float_arith(opcode, *x as f64, *y)))
            }
            (Value::Float(x), Value::Int(y)) => {
                Some(Value::Float(float_arith(opcode, *x, *y as f64)))
            }
            (Value::Float(x), Value::Float(y)) => {
                Some(Value::Float(float_arith(opcode, *x, *y)))
            }
            _ => None,
        };

        match fast {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => {
                // operator-overload fallback on the left operand's class
                self.push(a);
                self.push(b);
                self.invoke_protocol(overload_name(opcode), 2)
            }
        }
    }

    fn op_mod(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => {
                if *y == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                self.push(Value::Int(x.wrapping_rem(*y)));
                Ok(())
            }
            _ => Err(RuntimeError::TypeError(format!(
                "'%' requires integer operands, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn op_logic(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (&a, &b) {
            (Value::Bool(x), Value::Bool(y)) => {
                let result = if opcode == Opcode::And {
                    *x && *y
                } else {
                    *x || *y
                };
                self.push(Value::Bool(result));
                Ok(())
            }
            _ => Err(RuntimeError::TypeError(format!(
                "logical operands must be bools, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn op_ordering(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let pair = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Some((*x as f64, *y as f64)),
            (Value::Int(x), Value::Float(y)) => Some((*x as f64, *y)),
            (Value::Float(x), Value::Int(y)) => Some((*x, *y as f64)),
            (Value::Float(x), Value::Float(y)) => Some((*x, *y)),
            _ => None,
        };
        let Some((x, y)) = pair else {
            return Err(RuntimeError::TypeError(format!(
                "cannot compare {} and {}",
                a.type_name(),
                b.type_name()
            )));
        };
        let result = match opcode {
            Opcode::Lt => x < y,
            Opcode::Gt => x > y,
            Opcode::Lte => x <= y,
            _ => x >= y,
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    fn op_equality(&mut self, negate: bool) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let numeric = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Some(x == y),
            (Value::Int(x), Value::Float(y)) => Some(*x as f64 == *y),
            (Value::Float(x), Value::Int(y)) => Some(*x == *y as f64),
            (Value::Float(x), Value::Float(y)) => Some(x == y),
            _ => None,
        };

        if let Some(equal) = numeric {
            self.push(Value::Bool(equal != negate));
            return Ok(());
        }
        if negate {
            // inequality has no method fallback: structural for scalars
            // and strings, identity for heap values
            let equal = a == b;
            self.push(Value::Bool(!equal));
            return Ok(());
        }
        self.push(a);
        self.push(b);
        self.invoke_protocol("$eq", 2)
    }

    // ===== Calls =====

    /// Enter a closure with its frame base at `base`
    ///
    /// Melon closures push a frame and transfer control; natives run
    /// inline, their result replacing the caller-owned slot (direct calls)
    /// or the first argument slot (protocol calls).
    fn call_closure(
        &mut self,
        closure: Rc<Closure>,
        base: usize,
        nargs: usize,
        caller_owns: bool,
    ) -> Result<(), RuntimeError> {
        let native = match &closure.function.kind {
            FunctionKind::Native(callback) => Some(*callback),
            FunctionKind::Melon { .. } => None,
        };

        if let Some(callback) = native {
            let argstart = self
                .stack
                .len()
                .checked_sub(nargs)
                .ok_or(RuntimeError::StackUnderflow)?;
            let result = callback(&self.core, &self.stack[argstart..])?;
            let dst = if caller_owns {
                argstart.checked_sub(1).ok_or(RuntimeError::StackUnderflow)?
            } else {
                argstart
            };
            *self
                .stack
                .get_mut(dst)
                .ok_or(RuntimeError::StackUnderflow)? = result;
            self.stack.truncate(dst + 1);
            return Ok(());
        }

        let caller = std::mem::replace(&mut self.closure, closure);
        self.frames.push(CallFrame {
            return_ip: self.ip,
            closure: caller,
            base: self.bp,
            caller_owns_slot: caller_owns,
        });
        self.bp = base;
        self.ip = 0;
        Ok(())
    }

    /// Look up a protocol method on the receiver's class and invoke it
    ///
    /// The receiver sits at stack top minus one for every protocol shape
    /// (`[object, key]` and `[value, object, key]` alike).
    fn invoke_protocol(&mut self, name: &'static str, nargs: usize) -> Result<(), RuntimeError> {
        let object = self.peek(1)?.clone();
        let class = self.core.class_of(&object);
        let method = match class.lookup_super(name) {
            Some(Value::Closure(closure)) => closure,
            _ => {
                return Err(RuntimeError::UnknownMethod {
                    class: class.name.clone(),
                    name: name.to_string(),
                })
            }
        };
        let base = self
            .stack
            .len()
            .checked_sub(nargs)
            .ok_or(RuntimeError::StackUnderflow)?;
        self.call_closure(method, base, nargs, false)
    }

    // ===== Upvalues =====

    /// Find or create the open upvalue for a stack slot, keeping the list
    /// sorted ascending by slot
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        match self
            .open_upvalues
            .binary_search_by_key(&slot, open_slot_of)
        {
            Ok(pos) => self.open_upvalues[pos].clone(),
            Err(pos) => {
                let upvalue = Rc::new(RefCell::new(Upvalue::Open(slot)));
                self.open_upvalues.insert(pos, upvalue.clone());
                upvalue
            }
        }
    }

    /// Close every open upvalue at or above `threshold`
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(last) = self.open_upvalues.last() {
            let slot = open_slot_of(last);
            if slot < threshold {
                break;
            }
            let upvalue = self.open_upvalues.pop().expect("checked non-empty");
            let value = self.stack.get(slot).cloned().unwrap_or(Value::Null);
            *upvalue.borrow_mut() = Upvalue::Closed(value);
        }
    }

    fn upvalue(&self, idx: usize) -> Result<Rc<RefCell<Upvalue>>, RuntimeError> {
        self.closure.upvalues.get(idx).cloned().ok_or_else(|| {
            RuntimeError::InvalidBytecode(format!("upvalue index {} out of range", idx))
        })
    }

    /// Number of open upvalues (exposed for invariant checks in tests)
    pub fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    /// Read a global slot (used by hosts to fetch compiled closures for
    /// [`Vm::run_closure`])
    pub fn global(&self, idx: usize) -> Option<Value> {
        self.globals.get(idx).cloned()
    }

    // ===== Stack and instruction helpers =====

    #[inline(always)]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline(always)]
    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    #[inline(always)]
    fn peek(&self, distance: usize) -> Result<&Value, RuntimeError> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|idx| self.stack.get(idx))
            .ok_or(RuntimeError::StackUnderflow)
    }

    #[inline(always)]
    fn read_u8(&mut self) -> Result<u8, RuntimeError> {
        let byte = self
            .closure
            .function
            .chunk()
            .and_then(|chunk| chunk.code.get(self.ip))
            .copied()
            .ok_or_else(|| {
                RuntimeError::InvalidBytecode("instruction pointer out of bounds".to_string())
            })?;
        self.ip += 1;
        Ok(byte)
    }

    #[inline(always)]
    fn read_u16(&mut self) -> Result<u16, RuntimeError> {
        let hi = self.read_u8()? as u16;
        let lo = self.read_u8()? as u16;
        Ok((hi << 8) | lo)
    }

    #[inline(always)]
    fn read_opcode(&mut self) -> Result<Opcode, RuntimeError> {
        let byte = self.read_u8()?;
        Opcode::try_from(byte)
            .map_err(|byte| RuntimeError::InvalidBytecode(format!("unknown opcode {:#04x}", byte)))
    }

    fn chunk_constant(&self, idx: usize) -> Result<Value, RuntimeError> {
        self.closure
            .function
            .chunk()
            .and_then(|chunk| chunk.constants.get(idx))
            .cloned()
            .ok_or_else(|| {
                RuntimeError::InvalidBytecode(format!("constant index {} out of range", idx))
            })
    }
}

/// Slot of an open upvalue (closed entries never appear in the open list)
fn open_slot_of(upvalue: &Rc<RefCell<Upvalue>>) -> usize {
    match &*upvalue.borrow() {
        Upvalue::Open(slot) => *slot,
        Upvalue::Closed(_) => usize::MAX,
    }
}

fn int_arith(opcode: Opcode, x: i32, y: i32) -> Result<Value, RuntimeError> {
    let value = match opcode {
        Opcode::Add => x.wrapping_add(y),
        Opcode::Sub => x.wrapping_sub(y),
        Opcode::Mul => x.wrapping_mul(y),
        _ => {
            if y == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            x.wrapping_div(y)
        }
    };
    Ok(Value::Int(value))
}

fn float_arith(opcode: Opcode, x: f64, y: f64) -> f64 {
    match opcode {
        Opcode::Add => x + y,
        Opcode::Sub => x - y,
        Opcode::Mul => x * y,
        _ => x / y,
    }
}

fn overload_name(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Add => "$add",
        Opcode::Sub => "$sub",
        Opcode::Mul => "$mul",
        _ => "$div",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_chunk(chunk: Chunk) -> Result<Option<Value>, RuntimeError> {
        let core = CoreLib::new();
        let mut vm = Vm::new(core, 16);
        vm.run_main(Rc::new(Function::melon("<main>", chunk, 0)))
    }

    #[test]
    fn test_arithmetic_fast_path() {
        let mut chunk = Chunk::new();
        chunk.emit_with(Opcode::LoadInt, 2);
        chunk.emit_with(Opcode::LoadInt, 3);
        chunk.emit(Opcode::Mul);
        chunk.emit(Opcode::Halt);
        assert_eq!(run_chunk(chunk).unwrap(), Some(Value::Int(6)));
    }

    #[test]
    fn test_int_float_promotion() {
        let mut chunk = Chunk::new();
        chunk.emit_with(Opcode::LoadInt, 1);
        let k = chunk.add_constant(Value::Float(0.5)).unwrap();
        chunk.emit_with(Opcode::LoadConst, k);
        chunk.emit(Opcode::Add);
        chunk.emit(Opcode::Halt);
        assert_eq!(run_chunk(chunk).unwrap(), Some(Value::Float(1.5)));
    }

    #[test]
    fn test_division_by_zero() {
        let mut chunk = Chunk::new();
        chunk.emit_with(Opcode::LoadInt, 1);
        chunk.emit_with(Opcode::LoadInt, 0);
        chunk.emit(Opcode::Div);
        chunk.emit(Opcode::Halt);
        assert_eq!(run_chunk(chunk), Err(RuntimeError::DivisionByZero));
    }

    #[test]
    fn test_jif_only_false_branches() {
        // null falls through the branch
        let mut chunk = Chunk::new();
        let k = chunk.add_constant(Value::Null).unwrap();
        chunk.emit_with(Opcode::LoadConst, k);
        let jif = chunk.emit_jump(Opcode::JumpIfFalse);
        chunk.emit_with(Opcode::LoadInt, 1);
        chunk.patch_jump(jif);
        chunk.emit(Opcode::Halt);
        assert_eq!(run_chunk(chunk).unwrap(), Some(Value::Int(1)));
    }

    #[test]
    fn test_new_range_requires_ints() {
        let mut chunk = Chunk::new();
        let k = chunk.add_constant(Value::Float(1.5)).unwrap();
        chunk.emit_with(Opcode::LoadConst, k);
        chunk.emit_with(Opcode::LoadInt, 3);
        chunk.emit(Opcode::NewRange);
        chunk.emit(Opcode::Halt);
        assert_eq!(run_chunk(chunk), Err(RuntimeError::RangeBounds));
    }

    #[test]
    fn test_call_non_callable() {
        let mut chunk = Chunk::new();
        chunk.emit_with(Opcode::LoadInt, 7);
        chunk.emit_with(Opcode::Call, 0);
        chunk.emit(Opcode::Halt);
        assert_eq!(run_chunk(chunk), Err(RuntimeError::NotCallable("int")));
    }

    #[test]
    fn test_new_array_pops_items() {
        let mut chunk = Chunk::new();
        chunk.emit_with(Opcode::LoadInt, 1);
        chunk.emit_with(Opcode::LoadInt, 2);
        chunk.emit_with(Opcode::NewArray, 2);
        chunk.emit(Opcode::Halt);
        let result = run_chunk(chunk).unwrap().unwrap();
        let Value::Array(items) = result else {
            panic!("expected array");
        };
        assert_eq!(*items.borrow(), vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_capture_keeps_open_list_sorted() {
        let core = CoreLib::new();
        let mut vm = Vm::new(core, 0);
        vm.stack = vec![Value::Int(0), Value::Int(1), Value::Int(2)];
        let up2 = vm.capture_upvalue(2);
        let up0 = vm.capture_upvalue(0);
        let up1 = vm.capture_upvalue(1);
        let slots: Vec<usize> = vm.open_upvalues.iter().map(open_slot_of).collect();
        assert_eq!(slots, vec![0, 1, 2]);
        // capturing the same slot again dedups
        assert!(Rc::ptr_eq(&vm.capture_upvalue(1), &up1));

        vm.close_upvalues(1);
        assert_eq!(vm.open_upvalue_count(), 1);
        assert!(matches!(&*up1.borrow(), Upvalue::Closed(Value::Int(1))));
        assert!(matches!(&*up2.borrow(), Upvalue::Closed(Value::Int(2))));
        assert!(matches!(&*up0.borrow(), Upvalue::Open(0)));
    }
}
