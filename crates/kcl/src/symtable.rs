//! Symbol table and scope resolution.
//!
//! Every scope encountered while lowering the AST — the main package, a
//! function body, a schema body — gets its own [`SymbolTable`] chained to its
//! lexically enclosing scope via `outer`. The compiler never consults a
//! `SymbolTable` at run time: `resolve` decides, once and for all at compile
//! time, which opcode family (`LOAD_LOCAL`, `LOAD_GLOBAL`, `LOAD_FREE`,
//! `LOAD_BUILT_IN`) a given identifier reference lowers to.

use ahash::AHashMap;

/// The built-in function names pre-registered into every top-level symbol
/// table, in table order (the order fixes each name's `BUILT_IN` index).
///
/// Grounded in `internal/kclvm_py/compiler/extension/builtin`'s
/// `BUILTIN_FUNCTIONS` list referenced from `symtable.py`.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "option", "print", "len", "type", "typeof", "multiplyof", "str", "int", "float", "bool", "list", "dict", "range",
    "abs", "all", "any", "max", "min", "sum", "sorted", "hasattr", "isinstance",
];

/// Where a symbol's value lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Top-level package binding, addressed by name in the package globals table.
    Global,
    /// Slot in the current frame's locals array.
    Local,
    /// Entry in the fixed, pre-registered built-in function table.
    BuiltIn,
    /// Captured from an enclosing scope into the current closure's free-slot array.
    Free,
    /// Reserved attribute-path name, invisible outside the scope that declared it.
    Internal,
}

/// A single named binding within a [`SymbolTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Index within the defining scope. Monotone: the set of indices ever
    /// emitted by a scope is exactly `0..num_definitions`.
    pub index: u32,
    pub scope: ScopeKind,
    pub define_count: u32,
}

/// A chain of lexical scopes. The root table (no `outer`) is a package's
/// global scope; schema bodies, function bodies, and comprehension bodies
/// each get a fresh nested table.
#[derive(Debug)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    store: AHashMap<String, Symbol>,
    /// Free symbols captured by this scope, in first-capture order. Mirrors
    /// the compiler's free-slot array layout for `MAKE_FUNCTION`'s closure.
    free_symbols: Vec<Symbol>,
    num_definitions: u32,
}

/// Returns `true` for identifiers KCL treats as private (never promoted to a
/// globally visible output, and never redefined in place at GLOBAL scope).
#[must_use]
pub fn is_private_field(name: &str) -> bool {
    name.starts_with('_')
}

impl SymbolTable {
    /// Creates an empty table chained to `outer`, continuing index
    /// allocation from `starting_definitions` (used when a scope reuses
    /// slots reserved before it was entered, e.g. parameter slots).
    #[must_use]
    pub fn new(outer: Option<SymbolTable>, starting_definitions: u32) -> Self {
        Self {
            outer: outer.map(Box::new),
            store: AHashMap::new(),
            free_symbols: Vec::new(),
            num_definitions: starting_definitions,
        }
    }

    /// Creates a root table with the fixed built-in function table already
    /// registered at `BUILT_IN` scope.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut table = Self::new(None, 0);
        for (index, name) in BUILTIN_FUNCTIONS.iter().enumerate() {
            table.define_builtin(name, u32::try_from(index).expect("builtin table exceeds u32"));
        }
        table
    }

    /// Enters a new nested scope owned by this one, consuming `self` as the
    /// outer scope.
    #[must_use]
    pub fn enter(self) -> Self {
        Self::new(Some(self), 0)
    }

    /// Leaves the current scope, returning its outer scope (or `None` at the
    /// root) and the number of definitions the leaving scope allocated.
    #[must_use]
    pub fn leave(self) -> (Option<Self>, u32) {
        (self.outer.map(|b| *b), self.num_definitions)
    }

    #[must_use]
    pub fn num_definitions(&self) -> u32 {
        self.num_definitions
    }

    #[must_use]
    pub fn free_symbols(&self) -> &[Symbol] {
        &self.free_symbols
    }

    /// Every name currently bound at `GLOBAL` scope in this table, with its
    /// slot index. Used once, after compiling a package, to recover
    /// human-readable names for the package's global slot array (the name
    /// pool on `Code` is not positionally aligned with it, since it also
    /// collects attribute and import names).
    #[must_use]
    pub fn global_bindings(&self) -> Vec<(String, u32)> {
        self.store.values().filter(|s| s.scope == ScopeKind::Global).map(|s| (s.name.clone(), s.index)).collect()
    }

    /// Defines `name` at the given scope (defaulting to `Local` if this table
    /// has an outer scope, `Global` otherwise), returning the resulting
    /// symbol and whether an existing global binding was reused.
    ///
    /// A pre-existing `GLOBAL` binding of a *public* name is reused (its
    /// index is stable across redefinition so `STORE_GLOBAL` always targets
    /// the same slot) but `define_count` and `num_definitions` still advance.
    /// Private names and `INTERNAL` re-declarations always get a fresh slot
    /// in `store` (but `INTERNAL` redeclaration does not consume a fresh
    /// index if the name is already internally reserved).
    pub fn define(&mut self, name: &str, scope: Option<ScopeKind>) -> (Symbol, bool) {
        let scope = scope.unwrap_or(if self.outer.is_some() { ScopeKind::Local } else { ScopeKind::Global });

        if let Some(existing) = self.store.get(name) {
            if !is_private_field(name) && existing.scope == ScopeKind::Global && scope == ScopeKind::Global {
                let mut reused = existing.clone();
                reused.define_count += 1;
                self.num_definitions += 1;
                self.store.insert(name.to_owned(), reused.clone());
                return (reused, true);
            }
        }

        let symbol = Symbol { name: name.to_owned(), index: self.num_definitions, scope, define_count: 1 };

        let already_internal = scope == ScopeKind::Internal && self.store.contains_key(name);
        if !already_internal {
            self.store.insert(name.to_owned(), symbol.clone());
        }
        self.num_definitions += 1;
        (symbol, false)
    }

    /// Registers `name` at `BUILT_IN` scope with a caller-supplied index.
    pub fn define_builtin(&mut self, name: &str, index: u32) -> Symbol {
        let symbol = Symbol { name: name.to_owned(), index, scope: ScopeKind::BuiltIn, define_count: 1 };
        self.store.insert(name.to_owned(), symbol.clone());
        symbol
    }

    /// Promotes `original` (resolved in an outer scope) into a `FREE` slot of
    /// this scope, appending it to `free_symbols` in first-capture order.
    pub fn define_free(&mut self, original: Symbol) -> Symbol {
        let free = Symbol { name: original.name.clone(), index: original.index, scope: ScopeKind::Free, define_count: 1 };
        self.free_symbols.push(original);
        self.store.insert(free.name.clone(), free.clone());
        free
    }

    /// Resolves `name`, walking outer scopes and recording `FREE` captures
    /// as it goes. `INTERNAL` bindings never escape the scope that declared
    /// them: an outer `INTERNAL` hit is treated as unresolved.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }
        let outer = self.outer.as_mut()?;
        let found = outer.resolve(name)?;
        match found.scope {
            ScopeKind::Global | ScopeKind::BuiltIn => Some(found),
            ScopeKind::Internal => None,
            ScopeKind::Local | ScopeKind::Free => Some(self.define_free(found)),
        }
    }

    /// Removes `name` from this scope's store, but only if it is currently
    /// bound at exactly `scope`. Used to undo speculative `INTERNAL`
    /// declarations made while lowering a dotted path that turned out not to
    /// need them.
    pub fn delete(&mut self, name: &str, scope: ScopeKind) {
        if self.store.get(name).is_some_and(|s| s.scope == scope) {
            self.store.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_redefinition_reuses_slot_but_advances_counter() {
        let mut table = SymbolTable::with_builtins();
        let (first, existed1) = table.define("x", None);
        let (second, existed2) = table.define("x", None);
        assert!(!existed1);
        assert!(existed2);
        assert_eq!(first.index, second.index);
        assert_eq!(table.num_definitions(), BUILTIN_FUNCTIONS.len() as u32 + 2);
    }

    #[test]
    fn private_redefinition_always_fresh() {
        let mut table = SymbolTable::new(None, 0);
        let (first, _) = table.define("_x", None);
        let (second, existed) = table.define("_x", None);
        assert!(!existed);
        assert_ne!(first.index, second.index);
    }

    #[test]
    fn nested_scope_capture_becomes_free() {
        let mut outer = SymbolTable::new(None, 0);
        outer.define("a", None);
        let mut inner = outer.enter();
        let resolved = inner.resolve("a").expect("should resolve through outer scope");
        assert_eq!(resolved.scope, ScopeKind::Free);
        assert_eq!(inner.free_symbols().len(), 1);
    }

    #[test]
    fn builtin_resolves_without_free_capture() {
        let mut table = SymbolTable::with_builtins();
        let mut inner = table.enter();
        let resolved = inner.resolve("print").expect("builtin should resolve");
        assert_eq!(resolved.scope, ScopeKind::BuiltIn);
        assert!(inner.free_symbols().is_empty());
        let _ = &mut table;
    }

    #[test]
    fn internal_symbol_is_invisible_across_scope_boundary() {
        let mut outer = SymbolTable::new(None, 0);
        outer.define("b", Some(ScopeKind::Internal));
        let mut inner = outer.enter();
        assert!(inner.resolve("b").is_none());
    }

    #[test]
    fn symbol_indices_are_dense_and_monotone() {
        let mut table = SymbolTable::new(None, 0);
        for name in ["a", "b", "c", "d"] {
            table.define(name, None);
        }
        let mut indices: Vec<u32> = (0..table.num_definitions()).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }
}
