//! Error types for the call bridge.
//!
//! Arity and conversion failures are recoverable and travel back to the
//! interpreter as [`CallError`]. Code pointer and binding-stack failures are
//! invariant violations; their types exist so the fatal paths can log a precise
//! diagnostic before giving up.

use std::fmt;

use thiserror::Error;

/// Number of arguments a callable accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    Range { min: usize, max: Option<usize> },
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exactly(n) => n == count,
            Arity::Range { min, max } => count >= min && max.is_none_or(|max| count <= max),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "{n}"),
            Arity::Range { min, max: Some(max) } if min == max => write!(f, "{min}"),
            Arity::Range { min, max: Some(max) } => write!(f, "{min} to {max}"),
            Arity::Range { min, max: None } => write!(f, "at least {min}"),
        }
    }
}

/// A single slot failed to convert into the native parameter type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("argument {position}: expected {expected}, got {actual} ({actual_type})")]
pub struct ConversionError {
    pub position: usize,
    pub expected: &'static str,
    pub actual: String,
    pub actual_type: &'static str,
}

/// Recoverable failures surfaced to the calling interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("{function}: wrong number of arguments: expected {expected}, got {actual}")]
    ArityMismatch {
        function: String,
        expected: Arity,
        actual: usize,
    },

    #[error("{function}: wrong type for argument {position}: expected {expected}, got {actual} ({actual_type})")]
    WrongType {
        function: String,
        position: usize,
        expected: &'static str,
        actual: String,
        actual_type: &'static str,
    },

    #[error("{function}: odd number of keyword arguments")]
    OddKeywordArguments { function: String },

    #[error("{function}: unknown keyword argument {keyword}")]
    UnknownKeyword { function: String, keyword: String },

    #[error("{function}: argument {position} aliases the mutable receiver")]
    AliasedReceiver { function: String, position: usize },

    #[error("undefined function {name}")]
    UndefinedFunction { name: String },

    #[error("stack overflow: needed {requested} words, {available} available")]
    StackOverflow { requested: usize, available: usize },

    #[error("{function}: {message}")]
    Native { function: String, message: String },
}

impl CallError {
    pub fn arity(function: impl Into<String>, expected: Arity, actual: usize) -> Self {
        Self::ArityMismatch {
            function: function.into(),
            expected,
            actual,
        }
    }

    pub fn from_conversion(function: impl Into<String>, err: ConversionError) -> Self {
        Self::WrongType {
            function: function.into(),
            position: err.position,
            expected: err.expected,
            actual: err.actual,
            actual_type: err.actual_type,
        }
    }

    /// Error signalled by native code itself; the name is filled in by the trampoline.
    pub fn native(message: impl Into<String>) -> Self {
        Self::Native {
            function: String::new(),
            message: message.into(),
        }
    }

    /// Attach the callee name to errors raised below the trampoline.
    pub(crate) fn in_function(self, name: &str) -> Self {
        match self {
            Self::Native { function, message } if function.is_empty() => Self::Native {
                function: name.to_string(),
                message,
            },
            other => other,
        }
    }
}

/// A code address failed validation or could not be relocated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("{function}: null code pointer")]
    Null { function: String },

    #[error("{function}: code pointer 0x{address:x}+{len} is outside every instrumented code region")]
    NotInstrumented {
        function: String,
        address: usize,
        len: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelocationError {
    #[error("{function}: code pointer 0x{address:x} from image {image} has no relocation entry")]
    UnknownImage {
        function: String,
        image: String,
        address: usize,
    },

    #[error("{function}: offset 0x{offset:x}+{len} no longer fits image {image} ({image_len} bytes)")]
    OutOfRange {
        function: String,
        image: String,
        offset: usize,
        len: usize,
        image_len: usize,
    },

    #[error("cannot relocate while {0} calls are in flight")]
    CallsInFlight(usize),
}

impl RelocationError {
    pub fn function(&self) -> Option<&str> {
        match self {
            Self::UnknownImage { function, .. } | Self::OutOfRange { function, .. } => {
                Some(function.as_str())
            }
            Self::CallsInFlight(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InterruptError {
    #[error("interrupt queue is full")]
    QueueFull,
    #[error("interrupt queue is locked by its owner")]
    Busy,
    #[error("no live thread with id {0}")]
    NoSuchThread(u64),
}

/// A dynamic scope tried to restore the binding stack to a depth it cannot reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dynamic binding stack imbalance: destination {destination}, depth {depth}")]
pub struct BindingImbalance {
    pub destination: usize,
    pub depth: usize,
}
