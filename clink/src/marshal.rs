//! Slot <-> native value conversion and the multiple-value return protocol.
use std::fmt;

use crate::{
    CallError, ConversionError, NativeObject, Ref, Symbol, Value,
    tagged::{FIXNUM_MAX, FIXNUM_MIN},
};

/// Capacity of the return buffer, primary value included.
pub const MULTIPLE_VALUES_LIMIT: usize = 20;

/// Decodes one argument slot into a native parameter.
pub trait FromValue: Sized {
    /// Representation name reported when conversion fails.
    const EXPECTED: &'static str;

    fn try_from_value(value: Value) -> Option<Self>;

    fn from_slot(value: Value, position: usize) -> Result<Self, ConversionError> {
        if !value.is_unbound() {
            if let Some(native) = Self::try_from_value(value) {
                return Ok(native);
            }
        }
        Err(ConversionError {
            position,
            expected: Self::EXPECTED,
            actual: value.describe(),
            actual_type: value.type_name(),
        })
    }
}

impl FromValue for Value {
    const EXPECTED: &'static str = "object";

    fn try_from_value(value: Value) -> Option<Self> {
        Some(value)
    }
}

impl FromValue for i64 {
    const EXPECTED: &'static str = "fixnum";

    fn try_from_value(value: Value) -> Option<Self> {
        value.as_i64()
    }
}

macro_rules! narrow_integer {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl FromValue for $ty {
                const EXPECTED: &'static str = $name;

                fn try_from_value(value: Value) -> Option<Self> {
                    value.as_i64().and_then(|n| <$ty>::try_from(n).ok())
                }
            }
        )*
    };
}

narrow_integer! {
    i32 => "(signed-byte 32)",
    u32 => "(unsigned-byte 32)",
    u8 => "(unsigned-byte 8)",
    usize => "(integer 0 *)",
    isize => "fixnum",
}

impl FromValue for bool {
    const EXPECTED: &'static str = "generalized boolean";

    fn try_from_value(value: Value) -> Option<Self> {
        Some(!value.is_nil())
    }
}

impl FromValue for char {
    const EXPECTED: &'static str = "character";

    fn try_from_value(value: Value) -> Option<Self> {
        value.as_char()
    }
}

impl FromValue for Symbol {
    const EXPECTED: &'static str = "symbol";

    fn try_from_value(value: Value) -> Option<Self> {
        value.as_symbol()
    }
}

impl<T: NativeObject> FromValue for Ref<T> {
    const EXPECTED: &'static str = T::NAME;

    fn try_from_value(value: Value) -> Option<Self> {
        // SAFETY: a reference-tagged value can only be built through the unsafe
        // `Value::from_raw` and `Value::from_object`, whose contracts keep the
        // referent alive with its header
        unsafe { value.as_ref_of::<T>() }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn try_from_value(value: Value) -> Option<Self> {
        if value.is_nil() {
            Some(None)
        } else {
            T::try_from_value(value).map(Some)
        }
    }
}

/// Encodes one native value into a slot.
pub trait IntoValue {
    fn into_value(self) -> Result<Value, CallError>;
}

impl IntoValue for Value {
    fn into_value(self) -> Result<Value, CallError> {
        Ok(self)
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Result<Value, CallError> {
        Value::from_i64(self).ok_or_else(|| {
            CallError::native(format!(
                "integer {self} outside fixnum range {FIXNUM_MIN}..={FIXNUM_MAX}"
            ))
        })
    }
}

macro_rules! widen_integer {
    ($($ty:ty),*) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Result<Value, CallError> {
                    match i64::try_from(self) {
                        Ok(n) => n.into_value(),
                        Err(_) => Err(CallError::native(format!("integer {self} outside fixnum range"))),
                    }
                }
            }
        )*
    };
}

widen_integer!(i32, u32, u8, usize, isize, u64);

impl IntoValue for bool {
    fn into_value(self) -> Result<Value, CallError> {
        Ok(Value::from_bool(self))
    }
}

impl IntoValue for char {
    fn into_value(self) -> Result<Value, CallError> {
        Ok(Value::from_char(self))
    }
}

impl IntoValue for Symbol {
    fn into_value(self) -> Result<Value, CallError> {
        Ok(Value::from_symbol(self))
    }
}

impl<T: NativeObject> IntoValue for Ref<T> {
    fn into_value(self) -> Result<Value, CallError> {
        Ok(self.as_value())
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Result<Value, CallError> {
        match self {
            Some(v) => v.into_value(),
            None => Ok(Value::NIL),
        }
    }
}

/// Result of one call: a value count plus a fixed buffer.
///
/// Callers must consult [`ReturnValues::count`]; a function returning no values
/// has count 0 and a primary value of `nil`.
#[derive(Clone, Copy)]
pub struct ReturnValues {
    count: usize,
    values: [Value; MULTIPLE_VALUES_LIMIT],
}

impl ReturnValues {
    pub const fn none() -> Self {
        Self {
            count: 0,
            values: [Value::NIL; MULTIPLE_VALUES_LIMIT],
        }
    }

    pub const fn single(value: Value) -> Self {
        let mut values = [Value::NIL; MULTIPLE_VALUES_LIMIT];
        values[0] = value;
        Self { count: 1, values }
    }

    pub fn from_slice(values: &[Value]) -> Result<Self, CallError> {
        if values.len() > MULTIPLE_VALUES_LIMIT {
            return Err(CallError::native(format!(
                "{} values exceed the multiple value limit of {MULTIPLE_VALUES_LIMIT}",
                values.len()
            )));
        }
        let mut out = Self::none();
        out.values[..values.len()].copy_from_slice(values);
        out.count = values.len();
        Ok(out)
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn primary(&self) -> Value {
        if self.count == 0 {
            Value::NIL
        } else {
            self.values[0]
        }
    }

    /// Value `index`, `nil` past the count.
    #[inline]
    pub fn get(&self, index: usize) -> Value {
        if index < self.count {
            self.values[index]
        } else {
            Value::NIL
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[Value] {
        &self.values[..self.count]
    }
}

impl Default for ReturnValues {
    fn default() -> Self {
        Self::none()
    }
}

impl PartialEq for ReturnValues {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ReturnValues {}

impl fmt::Debug for ReturnValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// Any number of values up to [`MULTIPLE_VALUES_LIMIT`], decided at run time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipleValues(pub Vec<Value>);

/// Adapts a native return into the return protocol.
pub trait IntoReturn {
    fn into_return(self) -> Result<ReturnValues, CallError>;
}

impl IntoReturn for () {
    fn into_return(self) -> Result<ReturnValues, CallError> {
        Ok(ReturnValues::none())
    }
}

impl IntoReturn for ReturnValues {
    fn into_return(self) -> Result<ReturnValues, CallError> {
        Ok(self)
    }
}

impl IntoReturn for MultipleValues {
    fn into_return(self) -> Result<ReturnValues, CallError> {
        ReturnValues::from_slice(&self.0)
    }
}

macro_rules! single_return {
    ($($ty:ty),*) => {
        $(
            impl IntoReturn for $ty {
                fn into_return(self) -> Result<ReturnValues, CallError> {
                    self.into_value().map(ReturnValues::single)
                }
            }
        )*
    };
}

single_return!(Value, i64, i32, u32, u8, usize, isize, u64, bool, char, Symbol);

impl<T: NativeObject> IntoReturn for Ref<T> {
    fn into_return(self) -> Result<ReturnValues, CallError> {
        Ok(ReturnValues::single(self.as_value()))
    }
}

impl<T: IntoValue> IntoReturn for Option<T> {
    fn into_return(self) -> Result<ReturnValues, CallError> {
        self.into_value().map(ReturnValues::single)
    }
}

impl<T: IntoReturn, E: Into<CallError>> IntoReturn for Result<T, E> {
    fn into_return(self) -> Result<ReturnValues, CallError> {
        self.map_err(Into::into)?.into_return()
    }
}

/// Decodes a return back into native values. Missing values read as `nil`.
pub trait FromReturn: Sized {
    fn from_return(values: &ReturnValues) -> Result<Self, ConversionError>;
}

impl FromReturn for () {
    fn from_return(_values: &ReturnValues) -> Result<Self, ConversionError> {
        Ok(())
    }
}

impl FromReturn for MultipleValues {
    fn from_return(values: &ReturnValues) -> Result<Self, ConversionError> {
        Ok(MultipleValues(values.as_slice().to_vec()))
    }
}

macro_rules! single_from_return {
    ($($ty:ty),*) => {
        $(
            impl FromReturn for $ty {
                fn from_return(values: &ReturnValues) -> Result<Self, ConversionError> {
                    <$ty>::from_slot(values.primary(), 0)
                }
            }
        )*
    };
}

single_from_return!(Value, i64, i32, u32, u8, usize, isize, bool, char, Symbol);

impl<T: FromValue> FromReturn for Option<T> {
    fn from_return(values: &ReturnValues) -> Result<Self, ConversionError> {
        Option::<T>::from_slot(values.primary(), 0)
    }
}

macro_rules! tuple_return {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: IntoValue),+> IntoReturn for ($($name,)+) {
            fn into_return(self) -> Result<ReturnValues, CallError> {
                ReturnValues::from_slice(&[$(self.$idx.into_value()?),+])
            }
        }

        impl<$($name: FromValue),+> FromReturn for ($($name,)+) {
            fn from_return(values: &ReturnValues) -> Result<Self, ConversionError> {
                Ok(($($name::from_slot(values.get($idx), $idx)?,)+))
            }
        }
    };
}

tuple_return!(A: 0, B: 1);
tuple_return!(A: 0, B: 1, C: 2);
tuple_return!(A: 0, B: 1, C: 2, D: 3);
tuple_return!(A: 0, B: 1, C: 2, D: 3, E: 4);
