//! Typed trampolines for native signatures.
//!
//! Each supported fn pointer shape implements [`NativeFunction`] or
//! [`NativeMethod`]. The trait erases the signature to a raw code address plus
//! one monomorphized [`Invoker`] that rebuilds the pointer, converts the slots
//! and encodes the result.
use std::{marker::PhantomData, mem};

use crate::{CallError, FromValue, IntoReturn, NativeObject, Ref, ReturnValues, Value};

/// Signature-erased call path of one native callable.
///
/// # Safety
/// `address` must have been produced by the same implementation's `address()`,
/// and `args.len()` must equal its arity.
pub type Invoker =
    unsafe fn(name: &str, address: usize, args: &[Value]) -> Result<ReturnValues, CallError>;

/// A free native function `fn(A1, .., An) -> R`.
pub trait NativeFunction<Args>: Copy + 'static {
    const ARITY: usize;

    fn address(self) -> usize;

    /// # Safety
    /// see [`Invoker`]
    unsafe fn invoke(name: &str, address: usize, args: &[Value])
    -> Result<ReturnValues, CallError>;
}

/// Receiver marker for methods taking `&T`.
pub struct Const<T>(PhantomData<T>);
/// Receiver marker for methods taking `&mut T`.
pub struct Mut<T>(PhantomData<T>);

/// A native method; the receiver occupies slot 0 and counts towards the arity.
pub trait NativeMethod<Receiver, Args>: Copy + 'static {
    const ARITY: usize;
    const MUTABLE: bool;

    fn address(self) -> usize;

    /// # Safety
    /// see [`Invoker`]
    unsafe fn invoke(name: &str, address: usize, args: &[Value])
    -> Result<ReturnValues, CallError>;
}

#[inline(always)]
fn arg<A: FromValue>(name: &str, args: &[Value], position: usize) -> Result<A, CallError> {
    A::from_slot(args[position], position).map_err(|e| CallError::from_conversion(name, e))
}

#[inline(always)]
fn receiver<T: NativeObject>(name: &str, args: &[Value]) -> Result<Ref<T>, CallError> {
    arg::<Ref<T>>(name, args, 0)
}

/// Receiver of a `&mut T` method. No other slot may reference the same object.
fn exclusive_receiver<T: NativeObject>(name: &str, args: &[Value]) -> Result<Ref<T>, CallError> {
    let this = receiver::<T>(name, args)?;
    let object = this.as_value();
    match args.iter().skip(1).position(|&slot| slot == object) {
        Some(i) => Err(CallError::AliasedReceiver {
            function: name.to_string(),
            position: i + 1,
        }),
        None => Ok(this),
    }
}

macro_rules! native_function {
    ($n:expr; $($a:ident : $i:tt),*) => {
        impl<R, $($a),*> NativeFunction<($($a,)*)> for fn($($a),*) -> R
        where
            R: IntoReturn + 'static,
            $($a: FromValue + 'static,)*
        {
            const ARITY: usize = $n;

            #[inline]
            fn address(self) -> usize {
                self as usize
            }

            unsafe fn invoke(
                name: &str,
                address: usize,
                args: &[Value],
            ) -> Result<ReturnValues, CallError> {
                debug_assert_eq!(args.len(), $n);
                // SAFETY: address came from `address()` on this exact fn pointer type
                let f: Self = unsafe { mem::transmute_copy::<usize, Self>(&address) };
                f($(arg::<$a>(name, args, $i)?),*)
                    .into_return()
                    .map_err(|e| e.in_function(name))
            }
        }
    };
}

native_function!(0;);
native_function!(1; A1: 0);
native_function!(2; A1: 0, A2: 1);
native_function!(3; A1: 0, A2: 1, A3: 2);
native_function!(4; A1: 0, A2: 1, A3: 2, A4: 3);
native_function!(5; A1: 0, A2: 1, A3: 2, A4: 3, A5: 4);
native_function!(6; A1: 0, A2: 1, A3: 2, A4: 3, A5: 4, A6: 5);
native_function!(7; A1: 0, A2: 1, A3: 2, A4: 3, A5: 4, A6: 5, A7: 6);
native_function!(8; A1: 0, A2: 1, A3: 2, A4: 3, A5: 4, A6: 5, A7: 6, A8: 7);

macro_rules! native_method {
    ($n:expr; $($a:ident : $i:tt),*) => {
        impl<T, R, $($a),*> NativeMethod<Const<T>, ($($a,)*)> for fn(&T, $($a),*) -> R
        where
            T: NativeObject,
            R: IntoReturn + 'static,
            $($a: FromValue + 'static,)*
        {
            const ARITY: usize = $n + 1;
            const MUTABLE: bool = false;

            #[inline]
            fn address(self) -> usize {
                self as usize
            }

            unsafe fn invoke(
                name: &str,
                address: usize,
                args: &[Value],
            ) -> Result<ReturnValues, CallError> {
                debug_assert_eq!(args.len(), $n + 1);
                // SAFETY: address came from `address()` on this exact fn pointer type
                let f: Self = unsafe { mem::transmute_copy::<usize, Self>(&address) };
                let this = receiver::<T>(name, args)?;
                f(&*this, $(arg::<$a>(name, args, $i)?),*)
                    .into_return()
                    .map_err(|e| e.in_function(name))
            }
        }

        impl<T, R, $($a),*> NativeMethod<Mut<T>, ($($a,)*)> for fn(&mut T, $($a),*) -> R
        where
            T: NativeObject,
            R: IntoReturn + 'static,
            $($a: FromValue + 'static,)*
        {
            const ARITY: usize = $n + 1;
            const MUTABLE: bool = true;

            #[inline]
            fn address(self) -> usize {
                self as usize
            }

            unsafe fn invoke(
                name: &str,
                address: usize,
                args: &[Value],
            ) -> Result<ReturnValues, CallError> {
                debug_assert_eq!(args.len(), $n + 1);
                // SAFETY: address came from `address()` on this exact fn pointer type
                let f: Self = unsafe { mem::transmute_copy::<usize, Self>(&address) };
                let mut this = exclusive_receiver::<T>(name, args)?;
                // SAFETY: no other slot refers to the receiver, so the only live
                // reference to it is this one
                f(unsafe { this.as_mut() }, $(arg::<$a>(name, args, $i)?),*)
                    .into_return()
                    .map_err(|e| e.in_function(name))
            }
        }
    };
}

native_method!(0;);
native_method!(1; A1: 1);
native_method!(2; A1: 1, A2: 2);
native_method!(3; A1: 1, A2: 2, A3: 3);
native_method!(4; A1: 1, A2: 2, A3: 3, A4: 4);
native_method!(5; A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);
native_method!(6; A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6);
native_method!(7; A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6, A7: 7);
