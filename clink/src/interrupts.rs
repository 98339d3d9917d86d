//! Pending-interrupt queue.
//!
//! Records come from a pool allocated when the thread starts. Appending takes
//! a record off the spare list and links it behind the pending ones, all under
//! a spin lock, so delivery never allocates and never blocks in the kernel.
use std::{
    cell::UnsafeCell,
    fmt, hint,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering::{Acquire, Relaxed, Release},
        },
    },
    thread::Thread,
};

use crate::InterruptError;

pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to value is serialized by `locked`
unsafe impl<T: Send> Send for SpinLock<T> {}
// SAFETY: see above
unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Acquire, Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// An OS signal forwarded to the thread.
    Signal(i32),
    /// Stop at the next safe point.
    Stop,
    /// Re-check whatever the thread was waiting for.
    Wake,
    /// Run the runtime-defined action identified by the token.
    Action(u64),
}

const NIL: usize = usize::MAX;

#[derive(Clone, Copy)]
struct Record {
    interrupt: Interrupt,
    next: usize,
}

struct Queue {
    records: Box<[Record]>,
    head: usize,
    tail: usize,
    spare: usize,
    len: usize,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        let records = (0..capacity)
            .map(|i| Record {
                interrupt: Interrupt::Wake,
                next: if i + 1 < capacity { i + 1 } else { NIL },
            })
            .collect();
        Self {
            records,
            head: NIL,
            tail: NIL,
            spare: if capacity > 0 { 0 } else { NIL },
            len: 0,
        }
    }

    fn push(&mut self, interrupt: Interrupt) -> Result<(), InterruptError> {
        let index = self.spare;
        if index == NIL {
            return Err(InterruptError::QueueFull);
        }
        self.spare = self.records[index].next;
        self.records[index] = Record {
            interrupt,
            next: NIL,
        };
        if self.tail == NIL {
            self.head = index;
        } else {
            self.records[self.tail].next = index;
        }
        self.tail = index;
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<Interrupt> {
        let index = self.head;
        if index == NIL {
            return None;
        }
        let Record { interrupt, next } = self.records[index];
        self.head = next;
        if next == NIL {
            self.tail = NIL;
        }
        self.records[index].next = self.spare;
        self.spare = index;
        self.len -= 1;
        Some(interrupt)
    }
}

/// Fixed-capacity FIFO of interrupts for one thread.
pub struct InterruptQueue {
    queue: SpinLock<Queue>,
    capacity: usize,
}

impl InterruptQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: SpinLock::new(Queue::new(capacity)),
            capacity,
        }
    }

    /// Appends without allocating; fails when every record is pending.
    #[inline]
    pub fn push(&self, interrupt: Interrupt) -> Result<(), InterruptError> {
        self.queue.lock().push(interrupt)
    }

    /// Like [`InterruptQueue::push`], but fails with `Busy` instead of spinning
    /// when the lock is held.
    #[inline]
    pub fn try_push(&self, interrupt: Interrupt) -> Result<(), InterruptError> {
        let Some(mut queue) = self.queue.try_lock() else {
            return Err(InterruptError::Busy);
        };
        queue.push(interrupt)
    }

    #[inline]
    pub fn pop(&self) -> Option<Interrupt> {
        self.queue.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for InterruptQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptQueue")
            .field("pending", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[derive(Debug)]
struct Mailbox {
    thread_id: u64,
    queue: InterruptQueue,
    thread: Thread,
    open: AtomicBool,
}

/// Delivers interrupts to one thread.
///
/// Neither delivery path allocates. [`InterruptHandle::interrupt`] spins on the
/// queue lock the owning thread takes while polling, so it must not run on the
/// owning thread while that thread is inside a poll, as a signal handler would.
/// Such contexts use [`InterruptHandle::try_interrupt`], which never waits.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    mailbox: Arc<Mailbox>,
}

impl InterruptHandle {
    pub(crate) fn new(thread_id: u64, capacity: usize, thread: Thread) -> Self {
        Self {
            mailbox: Arc::new(Mailbox {
                thread_id,
                queue: InterruptQueue::with_capacity(capacity),
                thread,
                open: AtomicBool::new(true),
            }),
        }
    }

    #[inline]
    pub fn thread_id(&self) -> u64 {
        self.mailbox.thread_id
    }

    pub fn interrupt(&self, interrupt: Interrupt) -> Result<(), InterruptError> {
        if !self.mailbox.open.load(Acquire) {
            return Err(InterruptError::NoSuchThread(self.mailbox.thread_id));
        }
        self.mailbox.queue.push(interrupt)?;
        self.mailbox.thread.unpark();
        Ok(())
    }

    /// Delivery that gives up with [`InterruptError::Busy`] instead of waiting
    /// for the queue lock.
    pub fn try_interrupt(&self, interrupt: Interrupt) -> Result<(), InterruptError> {
        if !self.mailbox.open.load(Acquire) {
            return Err(InterruptError::NoSuchThread(self.mailbox.thread_id));
        }
        self.mailbox.queue.try_push(interrupt)?;
        self.mailbox.thread.unpark();
        Ok(())
    }

    pub(crate) fn queue(&self) -> &InterruptQueue {
        &self.mailbox.queue
    }

    pub(crate) fn close(&self) {
        self.mailbox.open.store(false, Release);
    }
}
