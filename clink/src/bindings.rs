//! Dynamic (special) variable bindings.
//!
//! [`DynamicBindingStack`] is the per-thread LIFO of saved values. Rebinding
//! only happens through a [`DynamicScope`], which records the depth it was
//! entered at and restores exactly that depth when dropped, on every exit path.
//!
//! Native code reaches the bindings of the call it runs in through
//! [`symbol_value`] and [`with_active_bindings`].
use std::{cell::Cell, collections::HashMap, marker::PhantomData, process, ptr};

use crate::{BindingImbalance, RootProvider, Symbol, Value};

#[derive(Debug, Clone, Copy)]
struct SavedBinding {
    symbol: Symbol,
    previous: Option<Value>,
}

#[derive(Debug, Default)]
pub struct DynamicBindingStack {
    saved: Vec<SavedBinding>,
    current: HashMap<Symbol, Value, ahash::RandomState>,
}

impl DynamicBindingStack {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            saved: Vec::with_capacity(capacity),
            current: HashMap::with_capacity_and_hasher(capacity, ahash::RandomState::new()),
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.saved.len()
    }

    /// Thread-local value of `symbol`, `None` if it is not dynamically bound here.
    #[inline]
    pub fn value(&self, symbol: Symbol) -> Option<Value> {
        self.current.get(&symbol).copied()
    }

    /// Assigns the innermost binding; returns false if `symbol` is not bound on this thread.
    pub fn set_value(&mut self, symbol: Symbol, value: Value) -> bool {
        match self.current.get_mut(&symbol) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn push(&mut self, symbol: Symbol, value: Value) {
        let previous = self.current.insert(symbol, value);
        self.saved.push(SavedBinding { symbol, previous });
    }

    fn pop(&mut self) -> Option<Symbol> {
        let SavedBinding { symbol, previous } = self.saved.pop()?;
        match previous {
            Some(value) => self.current.insert(symbol, value),
            None => self.current.remove(&symbol),
        };
        Some(symbol)
    }

    /// Pops every binding above `destination`, newest first.
    pub fn unwind_to(&mut self, destination: usize) -> Result<usize, BindingImbalance> {
        let depth = self.depth();
        if destination > depth {
            return Err(BindingImbalance { destination, depth });
        }
        for _ in destination..depth {
            self.pop();
        }
        Ok(depth - destination)
    }
}

impl RootProvider for DynamicBindingStack {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.current.values_mut().for_each(&mut *visitor);
        self.saved
            .iter_mut()
            .filter_map(|saved| saved.previous.as_mut())
            .for_each(visitor);
    }
}

/// A region of dynamic extent. Scopes nest strictly: an inner scope borrows
/// its parent, so it must be gone before the parent can bind or exit.
#[derive(Debug)]
pub struct DynamicScope<'a> {
    stack: &'a mut DynamicBindingStack,
    destination: usize,
}

impl<'a> DynamicScope<'a> {
    pub fn enter(stack: &'a mut DynamicBindingStack) -> Self {
        let destination = stack.depth();
        Self { stack, destination }
    }

    pub fn nested(&mut self) -> DynamicScope<'_> {
        DynamicScope::enter(self.stack)
    }

    /// Rebinds `symbol` until this scope exits.
    pub fn bind(&mut self, symbol: Symbol, value: Value) {
        log::trace!("bind {symbol} at depth {}", self.stack.depth());
        self.stack.push(symbol, value);
    }

    #[inline]
    pub fn destination(&self) -> usize {
        self.destination
    }

    /// Bindings introduced by this scope and not yet restored.
    #[inline]
    pub fn introduced(&self) -> usize {
        self.stack.depth().saturating_sub(self.destination)
    }

    #[inline]
    pub fn value(&self, symbol: Symbol) -> Option<Value> {
        self.stack.value(symbol)
    }

    #[inline]
    pub fn stack(&self) -> &DynamicBindingStack {
        self.stack
    }

    pub fn set_value(&mut self, symbol: Symbol, value: Value) -> bool {
        self.stack.set_value(symbol, value)
    }

    /// Normal exit; identical to dropping the scope.
    pub fn exit(self) {}
}

impl Drop for DynamicScope<'_> {
    fn drop(&mut self) {
        if let Err(imbalance) = self.stack.unwind_to(self.destination) {
            log::error!("{imbalance}, aborting");
            process::abort();
        }
    }
}

thread_local! {
    static ACTIVE: Cell<*const DynamicBindingStack> = const { Cell::new(ptr::null()) };
}

/// Publishes a binding stack to native code on this thread until dropped.
///
/// The shared borrow keeps the stack frozen while it is published.
pub(crate) struct ActiveBindings<'a> {
    previous: *const DynamicBindingStack,
    _stack: PhantomData<&'a DynamicBindingStack>,
}

impl<'a> ActiveBindings<'a> {
    pub(crate) fn install(stack: &'a DynamicBindingStack) -> Self {
        let previous = ACTIVE.with(|active| active.replace(stack));
        Self {
            previous,
            _stack: PhantomData,
        }
    }
}

impl Drop for ActiveBindings<'_> {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.previous));
    }
}

/// Runs `f` on the binding stack of the native call executing on this thread.
/// `None` outside of a native call.
pub fn with_active_bindings<R>(f: impl FnOnce(&DynamicBindingStack) -> R) -> Option<R> {
    let stack = ACTIVE.with(Cell::get);
    // SAFETY: non-null only while an ActiveBindings guard holds a shared borrow
    // of the stack, and `f` cannot keep the reference past this call
    unsafe { stack.as_ref() }.map(f)
}

/// Dynamic value of `symbol` in the native call executing on this thread.
pub fn symbol_value(symbol: Symbol) -> Option<Value> {
    with_active_bindings(|stack| stack.value(symbol)).flatten()
}
