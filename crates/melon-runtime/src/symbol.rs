//! Symbol table and name binding
//!
//! Each table owns one dense slot index space shared by all of its scope
//! frames: `add_local` hands out the next index regardless of scope depth,
//! so slot numbers stay stable after inner scopes exit. The globals table
//! and every function body get their own table; class bodies get a member
//! table whose indices are rewritten to per-class member slots by the
//! resolver's second pass.

use std::collections::HashMap;

/// Maximum number of local slots per function (one-byte operands)
pub const MAX_LOCALS: usize = 255;

/// Information recorded for a declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclInfo {
    /// Dense slot index within the owning table
    pub idx: u16,
}

/// Symbol table for name resolution
#[derive(Debug, Clone)]
pub struct SymbolTable {
    /// Stack of scopes (innermost last)
    scopes: Vec<HashMap<String, DeclInfo>>,
    /// Next dense slot index
    next_idx: u16,
}

impl SymbolTable {
    /// Create a new symbol table with a single (outermost) scope
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
            next_idx: 0,
        }
    }

    /// Enter a new scope
    pub fn enter_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Exit the current scope
    ///
    /// Returns the total number of slots allocated in this table so far,
    /// which callers bound against [`MAX_LOCALS`]. Slot indices are never
    /// reused after a scope exits.
    pub fn exit_scope(&mut self) -> usize {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
        self.next_idx as usize
    }

    /// Add a declaration to the current scope, assigning the next slot
    pub fn add_local(&mut self, name: impl Into<String>) -> u16 {
        let idx = self.next_idx;
        self.next_idx += 1;
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), DeclInfo { idx });
        }
        idx
    }

    /// Look up a declaration in all scopes (innermost first)
    pub fn lookup(&self, name: &str) -> Option<DeclInfo> {
        for scope in self.scopes.iter().rev() {
            if let Some(decl) = scope.get(name) {
                return Some(*decl);
            }
        }
        None
    }

    /// Rewrite the slot index of an existing declaration
    ///
    /// Used by the resolver to replace a class member's declaration-order
    /// index with its instance or static slot number.
    pub fn set_index(&mut self, name: &str, idx: u16) {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(decl) = scope.get_mut(name) {
                decl.idx = idx;
                return;
            }
        }
    }

    /// Whether the table is currently at its outermost scope
    pub fn is_global(&self) -> bool {
        self.scopes.len() == 1
    }

    /// Total number of slots allocated so far
    pub fn local_count(&self) -> usize {
        self.next_idx as usize
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_indices() {
        let mut table = SymbolTable::new();
        assert_eq!(table.add_local("a"), 0);
        assert_eq!(table.add_local("b"), 1);
        table.enter_scope();
        assert_eq!(table.add_local("c"), 2);
        table.exit_scope();
        // indices are not reused after scope exit
        assert_eq!(table.add_local("d"), 3);
    }

    #[test]
    fn test_lookup_innermost_first() {
        let mut table = SymbolTable::new();
        table.add_local("x");
        table.enter_scope();
        let inner = table.add_local("x");
        assert_eq!(table.lookup("x").unwrap().idx, inner);
        table.exit_scope();
        assert_eq!(table.lookup("x").unwrap().idx, 0);
    }

    #[test]
    fn test_missing_lookup() {
        let table = SymbolTable::new();
        assert!(table.lookup("nope").is_none());
    }

    #[test]
    fn test_set_index() {
        let mut table = SymbolTable::new();
        table.add_local("member");
        table.set_index("member", 7);
        assert_eq!(table.lookup("member").unwrap().idx, 7);
    }

    #[test]
    fn test_is_global_tracks_scope_depth() {
        let mut table = SymbolTable::new();
        assert!(table.is_global());
        table.enter_scope();
        assert!(!table.is_global());
        table.exit_scope();
        assert!(table.is_global());
    }
}
