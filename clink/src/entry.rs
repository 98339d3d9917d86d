//! Arity-indexed dispatch tables.
//!
//! One immutable [`EntryPointTable`] exists per shape (declared arity and
//! strategy) and is shared by every closure of that shape. A call picks
//! `entries[n]` for `n <= 5` supplied arguments and the general entry above
//! that; the table itself never inspects the declared arity.
use crate::{CallError, Closure, ReturnValues, ThreadLocalState, Value};

/// Highest supplied-argument count with a dedicated entry.
pub const MAX_FIXED_ENTRY: usize = 5;

/// Highest declared arity a native signature can have.
pub const MAX_NATIVE_ARITY: usize = 8;

pub type EntryFn =
    fn(&Closure, &mut ThreadLocalState, &[Value]) -> Result<ReturnValues, CallError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchStrategy {
    /// Arguments are read straight from the caller's buffer.
    Direct,
    /// Arguments go through the closure's lambda-list binder first.
    LambdaList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub arity: usize,
    pub strategy: DispatchStrategy,
}

pub struct EntryPointTable {
    shape: Shape,
    entries: [EntryFn; MAX_FIXED_ENTRY + 1],
    general: EntryFn,
}

impl std::fmt::Debug for EntryPointTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPointTable")
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

fn direct_entry<const N: usize, const K: usize>(
    closure: &Closure,
    tls: &mut ThreadLocalState,
    args: &[Value],
) -> Result<ReturnValues, CallError> {
    debug_assert_eq!(args.len(), K);
    if N != K {
        return Err(closure.arity_error(K));
    }
    closure.call_direct(tls, args)
}

fn direct_general<const N: usize>(
    closure: &Closure,
    tls: &mut ThreadLocalState,
    args: &[Value],
) -> Result<ReturnValues, CallError> {
    if args.len() != N {
        return Err(closure.arity_error(args.len()));
    }
    closure.call_direct(tls, args)
}

fn lambda_list_entry(
    closure: &Closure,
    tls: &mut ThreadLocalState,
    args: &[Value],
) -> Result<ReturnValues, CallError> {
    closure.call_lambda_list(tls, args)
}

const fn direct_table<const N: usize>() -> EntryPointTable {
    EntryPointTable {
        shape: Shape {
            arity: N,
            strategy: DispatchStrategy::Direct,
        },
        entries: [
            direct_entry::<N, 0>,
            direct_entry::<N, 1>,
            direct_entry::<N, 2>,
            direct_entry::<N, 3>,
            direct_entry::<N, 4>,
            direct_entry::<N, 5>,
        ],
        general: direct_general::<N>,
    }
}

const fn lambda_list_table<const N: usize>() -> EntryPointTable {
    EntryPointTable {
        shape: Shape {
            arity: N,
            strategy: DispatchStrategy::LambdaList,
        },
        entries: [lambda_list_entry as EntryFn; MAX_FIXED_ENTRY + 1],
        general: lambda_list_entry,
    }
}

static DIRECT: [EntryPointTable; MAX_NATIVE_ARITY + 1] = [
    direct_table::<0>(),
    direct_table::<1>(),
    direct_table::<2>(),
    direct_table::<3>(),
    direct_table::<4>(),
    direct_table::<5>(),
    direct_table::<6>(),
    direct_table::<7>(),
    direct_table::<8>(),
];

static LAMBDA_LIST: [EntryPointTable; MAX_NATIVE_ARITY + 1] = [
    lambda_list_table::<0>(),
    lambda_list_table::<1>(),
    lambda_list_table::<2>(),
    lambda_list_table::<3>(),
    lambda_list_table::<4>(),
    lambda_list_table::<5>(),
    lambda_list_table::<6>(),
    lambda_list_table::<7>(),
    lambda_list_table::<8>(),
];

impl EntryPointTable {
    /// The shared table for `shape`, `None` above [`MAX_NATIVE_ARITY`].
    pub fn for_shape(shape: Shape) -> Option<&'static EntryPointTable> {
        let tables = match shape.strategy {
            DispatchStrategy::Direct => &DIRECT,
            DispatchStrategy::LambdaList => &LAMBDA_LIST,
        };
        tables.get(shape.arity)
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn entry(&self, supplied: usize) -> EntryFn {
        match self.entries.get(supplied) {
            Some(&entry) => entry,
            None => self.general,
        }
    }

    #[inline]
    pub fn dispatch(
        &self,
        closure: &Closure,
        tls: &mut ThreadLocalState,
        args: &[Value],
    ) -> Result<ReturnValues, CallError> {
        log::trace!("dispatch {} with {} args", closure.name(), args.len());
        closure.count_call();
        (self.entry(args.len()))(closure, tls, args)
    }
}
