use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;

/// Stable identity of an interned (package, name) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub package: Arc<str>,
    pub name: Arc<str>,
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package, self.name)
    }
}

/// The symbol/package registry the bridge resolves names through.
pub trait SymbolTable: Send + Sync {
    fn intern(&self, package: &str, name: &str) -> Symbol;
    fn lookup(&self, package: &str, name: &str) -> Option<Symbol>;
    fn qualified_name(&self, symbol: Symbol) -> Option<QualifiedName>;
}

/// Splits `pkg:name` / `pkg::name`; names without a package fall back to `default`.
pub fn split_qualified<'a>(text: &'a str, default: &'a str) -> (&'a str, &'a str) {
    match text.find(':') {
        Some(at) => {
            let package = &text[..at];
            let name = text[at..].trim_start_matches(':');
            if package.is_empty() {
                ("KEYWORD", name)
            } else {
                (package, name)
            }
        }
        None => (default, text),
    }
}

struct InternerImpl {
    names: Vec<QualifiedName>,
    mappings: HashMap<(Arc<str>, Arc<str>), Symbol, ahash::RandomState>,
}

impl InternerImpl {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            mappings: HashMap::default(),
        }
    }

    fn get_or_add(&mut self, package: &str, name: &str) -> Symbol {
        if let Some(&sym) = self.mappings.get(&(Arc::from(package), Arc::from(name))) {
            return sym;
        }
        let package: Arc<str> = Arc::from(package);
        let name: Arc<str> = Arc::from(name);
        let sym = next_symbol(self.names.len());
        self.names.push(QualifiedName {
            package: package.clone(),
            name: name.clone(),
        });
        self.mappings.insert((package, name), sym);
        sym
    }
}

/// Symbol for the `count`th interned name.
///
/// # Panics
/// once the table holds more names than a symbol index can address
fn next_symbol(count: usize) -> Symbol {
    match u32::try_from(count) {
        Ok(index) => Symbol(index),
        Err(_) => {
            log::error!("symbol table exhausted at {count} names");
            panic!("symbol table exhausted at {count} names");
        }
    }
}

/// In-process symbol table used when no external registry is supplied.
#[derive(Clone)]
pub struct Interner(Arc<RwLock<InternerImpl>>);

impl Interner {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(InternerImpl::new())))
    }

    pub fn len(&self) -> usize {
        self.0.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Interner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interner").field("symbols", &self.len()).finish()
    }
}

impl SymbolTable for Interner {
    fn intern(&self, package: &str, name: &str) -> Symbol {
        if let Some(sym) = self.lookup(package, name) {
            return sym;
        }
        self.0.write().get_or_add(package, name)
    }

    fn lookup(&self, package: &str, name: &str) -> Option<Symbol> {
        let inner = self.0.read();
        inner
            .mappings
            .get(&(Arc::from(package), Arc::from(name)))
            .copied()
    }

    fn qualified_name(&self, symbol: Symbol) -> Option<QualifiedName> {
        self.0.read().names.get(symbol.0 as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let table = Interner::new();
        let a = table.intern("CORE", "add");
        let b = table.intern("CORE", "add");
        let c = table.intern("USER", "add");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("USER", "add"), Some(c));
        assert_eq!(table.lookup("USER", "sub"), None);
    }

    #[test]
    fn qualified_name_roundtrip() {
        let table = Interner::new();
        let sym = table.intern("CORE", "car");
        let qn = table.qualified_name(sym).expect("name");
        assert_eq!(&*qn.package, "CORE");
        assert_eq!(&*qn.name, "car");
        assert_eq!(qn.to_string(), "CORE:car");
    }

    #[test]
    fn split_handles_packages_and_keywords() {
        assert_eq!(split_qualified("ext:getenv", "CORE"), ("ext", "getenv"));
        assert_eq!(split_qualified("ext::getenv", "CORE"), ("ext", "getenv"));
        assert_eq!(split_qualified(":test", "CORE"), ("KEYWORD", "test"));
        assert_eq!(split_qualified("car", "CORE"), ("CORE", "car"));
    }

    #[test]
    fn symbol_indices_follow_insertion_order() {
        assert_eq!(next_symbol(0), Symbol(0));
        assert_eq!(next_symbol(u32::MAX as usize), Symbol(u32::MAX));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[should_panic(expected = "symbol table exhausted")]
    fn symbol_index_overflow_is_fatal() {
        next_symbol(u32::MAX as usize + 1);
    }
}
