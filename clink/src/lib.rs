mod bindings;
mod closure;
mod code;
mod entry;
mod errors;
mod interning;
mod interrupts;
mod lambda_list;
mod marshal;
mod native;
mod runtime;
mod tagged;
mod threads;
mod vm;

pub use bindings::*;
pub use closure::{Closure, ClosureKind, FunctionDescription, SourceLocation};
pub use code::*;
pub use entry::*;
pub use errors::*;
pub use interning::*;
pub use interrupts::*;
pub use lambda_list::*;
pub use marshal::*;
pub use native::*;
pub use runtime::*;
pub use tagged::*;
pub use threads::*;
pub use vm::*;
