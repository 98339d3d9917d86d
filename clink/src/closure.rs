use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

#[cfg(feature = "call-counters")]
use std::sync::atomic::AtomicU64;

use crate::{
    Arity, CallError, CallFrame, CodePointerCell, DispatchStrategy, DynamicScope, EntryPointTable,
    Invoker, LambdaListBinder, ReturnValues, Shape, Symbol, ThreadLocalState, Value,
    bindings::ActiveBindings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosureKind {
    Function,
    ConstMethod,
    MutMethod,
    /// `fn(Value) -> Value`, converts one object into another.
    Translator,
    /// `fn(form, environment) -> ReturnValues`.
    Macro,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

/// Documentation attached to a registered native.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionDescription {
    pub lambda_list: String,
    pub docstring: Option<String>,
    pub declares: Vec<String>,
    pub source: Option<SourceLocation>,
}

impl FunctionDescription {
    pub fn new(lambda_list: impl Into<String>) -> Self {
        Self {
            lambda_list: lambda_list.into(),
            ..Default::default()
        }
    }

    pub fn docstring(mut self, doc: impl Into<String>) -> Self {
        self.docstring = Some(doc.into());
        self
    }

    pub fn declare(mut self, declaration: impl Into<String>) -> Self {
        self.declares.push(declaration.into());
        self
    }

    pub fn source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source = Some(SourceLocation {
            file: file.into(),
            line,
        });
        self
    }
}

/// Everything needed to construct a [`Closure`] besides its code cell.
pub(crate) struct ClosureParts {
    pub name: String,
    pub symbol: Symbol,
    pub description: FunctionDescription,
    pub kind: ClosureKind,
    pub native_arity: usize,
    pub invoker: Invoker,
    pub binder: Option<Arc<dyn LambdaListBinder>>,
}

/// A native function or method made callable from the interpreter.
///
/// Shared between threads. Only the code cell ever changes after
/// construction, and only during a quiesced relocation pass.
pub struct Closure {
    name: String,
    symbol: Symbol,
    description: FunctionDescription,
    kind: ClosureKind,
    arity: Arity,
    native_arity: usize,
    code: CodePointerCell,
    entry: &'static EntryPointTable,
    invoker: Invoker,
    binder: Option<Arc<dyn LambdaListBinder>>,
    #[cfg(feature = "call-counters")]
    calls: AtomicU64,
    in_flight: AtomicUsize,
}

// decrements on every exit path, including unwinding out of native code
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Closure {
    pub(crate) fn new(parts: ClosureParts, code: CodePointerCell) -> Self {
        let (strategy, arity) = match &parts.binder {
            Some(binder) => (DispatchStrategy::LambdaList, binder.arity()),
            None => (DispatchStrategy::Direct, Arity::Exactly(parts.native_arity)),
        };
        let shape = Shape {
            arity: parts.native_arity,
            strategy,
        };
        // native signatures top out at MAX_NATIVE_ARITY, so a table always exists
        let entry = match EntryPointTable::for_shape(shape) {
            Some(table) => table,
            None => unreachable!("no entry table for {shape:?}"),
        };
        Self {
            name: parts.name,
            symbol: parts.symbol,
            description: parts.description,
            kind: parts.kind,
            arity,
            native_arity: parts.native_arity,
            code,
            entry,
            invoker: parts.invoker,
            binder: parts.binder,
            #[cfg(feature = "call-counters")]
            calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    pub fn description(&self) -> &FunctionDescription {
        &self.description
    }

    #[inline]
    pub fn kind(&self) -> ClosureKind {
        self.kind
    }

    #[inline]
    pub fn arity(&self) -> Arity {
        self.arity
    }

    #[inline]
    pub fn strategy(&self) -> DispatchStrategy {
        self.entry.shape().strategy
    }

    pub fn code(&self) -> &CodePointerCell {
        &self.code
    }

    pub fn entry_table(&self) -> &'static EntryPointTable {
        self.entry
    }

    /// Number of times this closure was entered. Always 0 without `call-counters`.
    pub fn call_count(&self) -> u64 {
        #[cfg(feature = "call-counters")]
        {
            self.calls.load(Ordering::Relaxed)
        }
        #[cfg(not(feature = "call-counters"))]
        {
            0
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Calls the closure with `args` on the current thread.
    #[inline]
    pub fn call(
        &self,
        tls: &mut ThreadLocalState,
        args: &[Value],
    ) -> Result<ReturnValues, CallError> {
        self.entry.dispatch(self, tls, args)
    }

    pub(crate) fn arity_error(&self, supplied: usize) -> CallError {
        CallError::arity(&self.name, self.arity, supplied)
    }

    /// Counts every entry, including calls later rejected for their arity.
    #[inline]
    pub(crate) fn count_call(&self) {
        #[cfg(feature = "call-counters")]
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn call_direct(
        &self,
        tls: &mut ThreadLocalState,
        args: &[Value],
    ) -> Result<ReturnValues, CallError> {
        let _flight = InFlight::enter(&self.in_flight);
        let ThreadLocalState { vm, bindings, .. } = tls;
        let mut frame = CallFrame::enter(vm, Value::from_symbol(self.symbol), args.len())?;
        let scope = DynamicScope::enter(bindings);
        let _active = ActiveBindings::install(scope.stack());
        frame.fill(args);
        // SAFETY: invoker and address were produced together from one native signature,
        // and the entry table only gets here with exactly `native_arity` arguments
        unsafe { (self.invoker)(&self.name, self.code.address(), frame.slots()) }
    }

    pub(crate) fn call_lambda_list(
        &self,
        tls: &mut ThreadLocalState,
        args: &[Value],
    ) -> Result<ReturnValues, CallError> {
        let Some(binder) = self.binder.as_deref() else {
            return Err(CallError::Native {
                function: self.name.clone(),
                message: "lambda-list entry without a binder".to_string(),
            });
        };
        let _flight = InFlight::enter(&self.in_flight);
        let ThreadLocalState { vm, bindings, .. } = tls;
        let mut frame = CallFrame::enter(vm, Value::from_symbol(self.symbol), binder.frame_size())?;
        let mut scope = DynamicScope::enter(bindings);
        let specials = binder.bind(&self.name, args, frame.slots_mut(), &mut scope)?;
        debug_assert_eq!(scope.introduced(), specials);
        log::trace!("{}: bound {} specials", self.name, specials);
        let _active = ActiveBindings::install(scope.stack());
        // SAFETY: the binder's frame size equals the native arity, checked at registration
        unsafe {
            (self.invoker)(
                &self.name,
                self.code.address(),
                &frame.slots()[..self.native_arity],
            )
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("arity", &self.arity)
            .field("strategy", &self.strategy())
            .field("address", &format_args!("0x{:x}", self.code.address()))
            .finish()
    }
}
