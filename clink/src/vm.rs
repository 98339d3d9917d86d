use std::ptr::NonNull;

use crate::{CallError, Value};

/// Operand stack size of every thread unless configured otherwise.
pub const MAX_STACK_WORDS: usize = 16384;

/// Anything holding slots the collector must trace and may update.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Address range of a thread's operand stack, as handed to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub bottom: usize,
    pub top: usize,
}

impl StackBounds {
    pub fn contains(&self, address: usize) -> bool {
        (self.bottom..self.top).contains(&address)
    }
}

/// Interpreter registers of one thread.
///
/// The operand stack grows upward from index 0; `sp` is the number of live
/// words and never exceeds the capacity. Only the owning thread mutates these.
#[derive(Debug)]
pub struct VirtualMachine {
    stack: Box<[Value]>,
    sp: usize,
    fp: usize,
    pub current_function: Value,
    pub literals: Option<NonNull<Value>>,
    pub pc: usize,
}

impl VirtualMachine {
    pub fn new(words: usize) -> Self {
        Self {
            stack: vec![Value::UNBOUND; words].into_boxed_slice(),
            sp: 0,
            fp: 0,
            current_function: Value::NIL,
            literals: None,
            pc: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.sp
    }

    #[inline]
    pub fn frame_pointer(&self) -> usize {
        self.fp
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.stack.len() - self.sp
    }

    pub fn bounds(&self) -> StackBounds {
        let range = self.stack.as_ptr_range();
        StackBounds {
            bottom: range.start as usize,
            top: range.end as usize,
        }
    }

    #[inline]
    pub fn push(&mut self, value: Value) -> Result<(), CallError> {
        if self.sp == self.stack.len() {
            return Err(CallError::StackOverflow {
                requested: 1,
                available: 0,
            });
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    /// Pops one word; never pops below the current frame.
    #[inline]
    pub fn pop(&mut self) -> Option<Value> {
        if self.sp == self.fp {
            return None;
        }
        self.sp -= 1;
        Some(self.stack[self.sp])
    }

    #[inline]
    pub fn peek(&self) -> Option<Value> {
        (self.sp > self.fp).then(|| self.stack[self.sp - 1])
    }

    #[inline]
    pub fn live(&self) -> &[Value] {
        &self.stack[..self.sp]
    }

    fn reserve(&mut self, words: usize) -> Result<usize, CallError> {
        let available = self.available();
        if words > available {
            return Err(CallError::StackOverflow {
                requested: words,
                available,
            });
        }
        let base = self.sp;
        self.stack[base..base + words].fill(Value::UNBOUND);
        self.sp += words;
        Ok(base)
    }
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new(MAX_STACK_WORDS)
    }
}

impl RootProvider for VirtualMachine {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.current_function);
        self.stack[..self.sp].iter_mut().for_each(visitor);
    }
}

/// One call's argument region on the operand stack.
///
/// Slots start out unbound. Dropping the frame restores the stack pointer,
/// frame pointer, pc and current function to what they were on entry.
#[derive(Debug)]
pub struct CallFrame<'vm> {
    vm: &'vm mut VirtualMachine,
    base: usize,
    len: usize,
    saved_sp: usize,
    saved_fp: usize,
    saved_pc: usize,
    saved_function: Value,
}

impl<'vm> CallFrame<'vm> {
    pub fn enter(
        vm: &'vm mut VirtualMachine,
        function: Value,
        slots: usize,
    ) -> Result<Self, CallError> {
        let saved_sp = vm.sp;
        let saved_fp = vm.fp;
        let saved_pc = vm.pc;
        let saved_function = vm.current_function;
        let base = vm.reserve(slots)?;
        vm.fp = base;
        vm.pc = 0;
        vm.current_function = function;
        Ok(Self {
            vm,
            base,
            len: slots,
            saved_sp,
            saved_fp,
            saved_pc,
            saved_function,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn slots(&self) -> &[Value] {
        &self.vm.stack[self.base..self.base + self.len]
    }

    #[inline]
    pub fn slots_mut(&mut self) -> &mut [Value] {
        &mut self.vm.stack[self.base..self.base + self.len]
    }

    /// Copies `args` into the leading slots.
    pub fn fill(&mut self, args: &[Value]) {
        self.slots_mut()[..args.len()].copy_from_slice(args);
    }

    pub fn vm(&mut self) -> &mut VirtualMachine {
        self.vm
    }
}

impl Drop for CallFrame<'_> {
    fn drop(&mut self) {
        self.vm.sp = self.saved_sp;
        self.vm.fp = self.saved_fp;
        self.vm.pc = self.saved_pc;
        self.vm.current_function = self.saved_function;
    }
}
