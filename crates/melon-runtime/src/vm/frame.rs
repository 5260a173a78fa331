//! Call frame representation

use crate::value::Closure;
use std::rc::Rc;

/// One saved caller state on the call stack
///
/// A frame stores the caller's position so `RETURN`/`RET0` can restore it;
/// `caller_owns_slot` records the callee's calling convention: when true,
/// the slot beneath the callee's frame base belongs to the caller (it held
/// the callee or receiver value) and receives the return value.
#[derive(Debug)]
pub struct CallFrame {
    /// Caller's instruction pointer to resume at
    pub return_ip: usize,
    /// Caller's closure
    pub closure: Rc<Closure>,
    /// Caller's frame base pointer
    pub base: usize,
    /// Whether the return value replaces the caller-owned slot beneath the
    /// callee's frame base
    pub caller_owns_slot: bool,
}
