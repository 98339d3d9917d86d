//! Value: any raw slot, small integer/reference/header/immediate
//!
//! Ref<T>: untagged, typed reference to a native object. Produced only after the
//! object's header was checked against `T::CLASS`.
use std::{
    fmt,
    marker::PhantomData,
    ops::Deref,
    ptr::NonNull,
};

use crate::Symbol;

#[allow(unused)]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueTag {
    Fixnum = 0b0,
    Reference = 0b01,
    Header = 0b011,
    Immediate = 0b111,
}

const FIXNUM_MASK: u64 = 0b1;
const REF_MASK: u64 = 0b11;
const IMMEDIATE_MASK: u64 = 0b111;

// immediates: low 3 bits tag, next 3 bits kind, payload above
const IMMEDIATE_KIND_SHIFT: u64 = 3;
const IMMEDIATE_KIND_MASK: u64 = 0b111 << IMMEDIATE_KIND_SHIFT;
const IMMEDIATE_PAYLOAD_SHIFT: u64 = 6;

pub const FIXNUM_MIN: i64 = -(1i64 << 62);
pub const FIXNUM_MAX: i64 = (1i64 << 62) - 1;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImmediateKind {
    Nil = 0,
    True = 1,
    Unbound = 2,
    Character = 3,
    Symbol = 4,
}

const fn immediate(kind: ImmediateKind, payload: u64) -> u64 {
    (payload << IMMEDIATE_PAYLOAD_SHIFT)
        | ((kind as u64) << IMMEDIATE_KIND_SHIFT)
        | ValueTag::Immediate as u64
}

/// A tagged 64-bit slot.
///
/// Encoding:
/// - **Fixnum**:    `...XXXX0` 63-bit signed integer
/// - **Reference**: `...XXX01` pointer to an object starting with a [`Header`]
/// - **Header**:    `...XX011` only valid as the first word of a heap object
/// - **Immediate**: `...XX111` nil, t, unbound, characters and symbols
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(u64);

// SAFETY: a Value is a plain word, liveness of referents is the collector's business
unsafe impl Send for Value {}
// SAFETY: see above
unsafe impl Sync for Value {}

impl Value {
    pub const NIL: Value = Value(immediate(ImmediateKind::Nil, 0));
    pub const T: Value = Value(immediate(ImmediateKind::True, 0));
    /// Marker stored in frame slots that have not been bound yet.
    pub const UNBOUND: Value = Value(immediate(ImmediateKind::Unbound, 0));

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Reinterprets a raw word as a slot.
    ///
    /// # Safety
    /// if `raw` is reference-tagged it must point at a live object that starts
    /// with a [`Header`] and stays put for as long as the value is used
    #[inline(always)]
    pub const unsafe fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_MASK == ValueTag::Fixnum as u64
    }

    /// Tags `value` as a fixnum, `None` if it does not fit in 63 bits.
    #[inline]
    pub fn from_i64(value: i64) -> Option<Self> {
        if (FIXNUM_MIN..=FIXNUM_MAX).contains(&value) {
            Some(Self((value as u64) << 1))
        } else {
            None
        }
    }

    /// # Panics
    /// if `value` does not fit in a fixnum
    #[inline]
    pub fn fixnum(value: i64) -> Self {
        match Self::from_i64(value) {
            Some(v) => v,
            None => panic!("fixnum overflow: {value}"),
        }
    }

    #[inline]
    pub fn as_i64(self) -> Option<i64> {
        self.is_fixnum().then(|| (self.0 as i64) >> 1)
    }

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & REF_MASK == ValueTag::Reference as u64
    }

    #[inline(always)]
    pub const fn is_header(self) -> bool {
        self.0 & IMMEDIATE_MASK == ValueTag::Header as u64
    }

    #[inline(always)]
    pub const fn is_immediate(self) -> bool {
        self.0 & IMMEDIATE_MASK == ValueTag::Immediate as u64
    }

    #[inline]
    pub fn immediate_kind(self) -> Option<ImmediateKind> {
        if !self.is_immediate() {
            return None;
        }
        let kind = (self.0 & IMMEDIATE_KIND_MASK) >> IMMEDIATE_KIND_SHIFT;
        match kind {
            0 => Some(ImmediateKind::Nil),
            1 => Some(ImmediateKind::True),
            2 => Some(ImmediateKind::Unbound),
            3 => Some(ImmediateKind::Character),
            4 => Some(ImmediateKind::Symbol),
            _ => None,
        }
    }

    #[inline(always)]
    pub const fn is_nil(self) -> bool {
        self.0 == Self::NIL.0
    }

    #[inline(always)]
    pub const fn is_unbound(self) -> bool {
        self.0 == Self::UNBOUND.0
    }

    #[inline]
    pub fn from_bool(value: bool) -> Self {
        if value { Self::T } else { Self::NIL }
    }

    #[inline]
    pub fn from_char(value: char) -> Self {
        Self(immediate(ImmediateKind::Character, value as u64))
    }

    #[inline]
    pub fn as_char(self) -> Option<char> {
        if self.immediate_kind() != Some(ImmediateKind::Character) {
            return None;
        }
        char::from_u32((self.0 >> IMMEDIATE_PAYLOAD_SHIFT) as u32)
    }

    #[inline]
    pub fn from_symbol(symbol: Symbol) -> Self {
        Self(immediate(ImmediateKind::Symbol, symbol.index() as u64))
    }

    #[inline]
    pub fn as_symbol(self) -> Option<Symbol> {
        if self.immediate_kind() != Some(ImmediateKind::Symbol) {
            return None;
        }
        Some(Symbol::from_index((self.0 >> IMMEDIATE_PAYLOAD_SHIFT) as u32))
    }

    /// Tags a reference to `object`.
    ///
    /// # Safety
    /// `object` must neither move nor be dropped while the value, or any copy
    /// of it, can still reach native code
    #[inline]
    pub unsafe fn from_object<T: NativeObject>(object: &T) -> Self {
        let addr = object as *const T as u64;
        debug_assert_eq!(addr & REF_MASK, 0, "pointer not aligned");
        Self(addr | ValueTag::Reference as u64)
    }

    #[inline(always)]
    pub const fn ref_bits(self) -> u64 {
        self.0 & !REF_MASK
    }

    /// The header of the referenced object.
    /// # Safety
    /// the value must reference a live object that starts with a [`Header`]
    #[inline]
    pub unsafe fn header<'a>(self) -> &'a Header {
        debug_assert!(self.is_ref());
        // SAFETY: caller guarantees a live object with a header
        unsafe { &*(self.ref_bits() as *const Header) }
    }

    /// Untag into a typed reference if the object is of class `T`.
    /// # Safety
    /// if this is a reference, it must point to a live object starting with a [`Header`]
    #[inline]
    pub unsafe fn as_ref_of<T: NativeObject>(self) -> Option<Ref<T>> {
        if !self.is_ref() {
            return None;
        }
        // SAFETY: by contract references point at objects with headers
        let header = unsafe { self.header() };
        if header.class != T::CLASS {
            return None;
        }
        let ptr = NonNull::new(self.ref_bits() as *mut T)?;
        Some(Ref {
            ptr,
            _marker: PhantomData,
        })
    }

    /// Short printed form used in diagnostics.
    pub fn describe(self) -> String {
        if let Some(n) = self.as_i64() {
            return n.to_string();
        }
        if self.is_ref() {
            return format!("#<object 0x{:x}>", self.ref_bits());
        }
        match self.immediate_kind() {
            Some(ImmediateKind::Nil) => "nil".to_string(),
            Some(ImmediateKind::True) => "t".to_string(),
            Some(ImmediateKind::Unbound) => "#<unbound>".to_string(),
            Some(ImmediateKind::Character) => match self.as_char() {
                Some(c) => format!("#\\{c}"),
                None => "#<bad character>".to_string(),
            },
            Some(ImmediateKind::Symbol) => match self.as_symbol() {
                Some(s) => format!("#<symbol {}>", s.index()),
                None => "#<bad symbol>".to_string(),
            },
            None => format!("#<header 0x{:016x}>", self.0),
        }
    }

    /// Representation name, as reported by wrong-type errors.
    pub fn type_name(self) -> &'static str {
        if self.is_fixnum() {
            return "fixnum";
        }
        if self.is_ref() {
            return "object";
        }
        match self.immediate_kind() {
            Some(ImmediateKind::Nil) => "null",
            Some(ImmediateKind::True) => "boolean",
            Some(ImmediateKind::Unbound) => "unbound",
            Some(ImmediateKind::Character) => "character",
            Some(ImmediateKind::Symbol) => "symbol",
            None => "header",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(n) = self.as_i64() {
            write!(f, "Fixnum({n})")
        } else if self.is_ref() {
            write!(f, "Ref(0x{:x})", self.ref_bits())
        } else {
            write!(f, "Immediate({})", self.describe())
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::NIL
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::from_bool(value)
    }
}

impl From<char> for Value {
    fn from(value: char) -> Self {
        Value::from_char(value)
    }
}

impl From<Symbol> for Value {
    fn from(value: Symbol) -> Self {
        Value::from_symbol(value)
    }
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// First word of every object a reference slot may point to.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    word: u64,
    pub class: ClassId,
}

impl Header {
    pub const fn new(class: ClassId) -> Self {
        Self {
            word: ValueTag::Header as u64,
            class,
        }
    }

    pub fn of<T: NativeObject>() -> Self {
        Self::new(T::CLASS)
    }

    pub fn as_value(&self) -> Value {
        Value(self.word)
    }
}

/// A native type instances of which may be passed through slots.
///
/// Implementors must be `#[repr(C)]` with a [`Header`] as first field.
pub trait NativeObject: 'static {
    const CLASS: ClassId;
    const NAME: &'static str;
}

/// Typed reference to a native object, obtained by untagging a slot.
pub struct Ref<T: NativeObject> {
    ptr: NonNull<T>,
    _marker: PhantomData<*mut T>,
}

// we need custom clone implementation as default considers "owning" T
impl<T: NativeObject> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: NativeObject> Copy for Ref<T> {}

impl<T: NativeObject> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref<{}>({:p})", T::NAME, self.ptr)
    }
}

impl<T: NativeObject> Ref<T> {
    #[inline]
    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_value(self) -> Value {
        Value(self.ptr.as_ptr() as u64 | ValueTag::Reference as u64)
    }

    /// Exclusive access to the object.
    ///
    /// # Safety
    /// no other reference to the object, through this or any other `Ref`,
    /// may be live while the returned borrow is
    #[inline]
    pub unsafe fn as_mut(&mut self) -> &mut T {
        // SAFETY: class checked on construction, exclusivity by contract
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: NativeObject> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: NativeObject> Deref for Ref<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // SAFETY: class was checked on construction, the collector keeps it alive
        unsafe { self.ptr.as_ref() }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Point {
        header: Header,
        x: i64,
        y: i64,
    }

    impl NativeObject for Point {
        const CLASS: ClassId = ClassId(100);
        const NAME: &'static str = "point";
    }

    #[repr(C)]
    struct Other {
        header: Header,
    }

    impl NativeObject for Other {
        const CLASS: ClassId = ClassId(101);
        const NAME: &'static str = "other";
    }

    #[test]
    fn fixnum_roundtrip_and_tag() {
        let v = Value::fixnum(-7);
        assert_eq!(v.raw() & 0b1, 0);
        assert!(v.is_fixnum());
        assert!(!v.is_ref());
        assert!(!v.is_immediate());
        assert_eq!(v.as_i64(), Some(-7));
    }

    #[test]
    fn fixnum_range_is_enforced() {
        assert!(Value::from_i64(FIXNUM_MAX).is_some());
        assert!(Value::from_i64(FIXNUM_MIN).is_some());
        assert!(Value::from_i64(FIXNUM_MAX + 1).is_none());
        assert!(Value::from_i64(i64::MIN).is_none());
    }

    #[test]
    fn immediates_are_distinct() {
        let all = [Value::NIL, Value::T, Value::UNBOUND, Value::from_char('a')];
        for (i, a) in all.iter().enumerate() {
            assert!(a.is_immediate());
            assert!(!a.is_fixnum());
            assert!(!a.is_ref());
            assert!(!a.is_header());
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn char_and_symbol_roundtrip() {
        assert_eq!(Value::from_char('λ').as_char(), Some('λ'));
        let sym = Symbol::from_index(12345);
        let v = Value::from_symbol(sym);
        assert_eq!(v.as_symbol(), Some(sym));
        assert_eq!(v.as_char(), None);
        assert_eq!(Value::NIL.as_symbol(), None);
    }

    #[test]
    fn object_untag_checks_class() {
        let mut p = Box::new(Point {
            header: Header::of::<Point>(),
            x: 1,
            y: 2,
        });
        let v = unsafe { Value::from_object(&*p) };
        assert!(v.is_ref());
        assert!(!v.is_fixnum());

        let r = unsafe { v.as_ref_of::<Point>() }.expect("point");
        assert_eq!(r.x, 1);
        assert_eq!(r.y, 2);
        assert_eq!(r.as_value(), v);
        assert!(unsafe { v.as_ref_of::<Other>() }.is_none());

        let mut r2 = r;
        unsafe { r2.as_mut() }.x = 40;
        assert_eq!(p.x, 40);
        p.y = 9;
        assert_eq!(r.y, 9);
    }

    #[test]
    fn header_word_is_header_tagged() {
        let h = Header::new(ClassId(3));
        assert!(h.as_value().is_header());
        assert!(!h.as_value().is_immediate());
    }

    #[test]
    fn describe_names_representation() {
        assert_eq!(Value::fixnum(3).describe(), "3");
        assert_eq!(Value::NIL.describe(), "nil");
        assert_eq!(Value::T.type_name(), "boolean");
        assert_eq!(Value::from_char('x').describe(), "#\\x");
    }
}
