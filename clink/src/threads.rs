use std::{
    cell::Cell,
    collections::HashMap,
    fmt,
    ops::{Deref, DerefMut},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Once,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use crate::{
    DynamicBindingStack, Interrupt, InterruptError, InterruptHandle, MAX_STACK_WORDS,
    RootProvider, StackBounds, Value, VirtualMachine,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSettings {
    pub stack_words: usize,
    pub interrupt_capacity: usize,
    pub binding_capacity: usize,
    /// Seed of the per-thread generator; 0 derives one from the thread id.
    pub random_seed: u64,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            stack_words: MAX_STACK_WORDS,
            interrupt_capacity: 64,
            binding_capacity: 64,
            random_seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadCreateInfo {
    pub stack_words: Option<usize>,
    pub interrupt_capacity: Option<usize>,
    pub binding_capacity: Option<usize>,
    pub random_seed: Option<u64>,
}

impl ThreadCreateInfo {
    pub fn settings(&self) -> ThreadSettings {
        let mut settings = ThreadSettings::default();
        self.stack_words.inspect(|&v| settings.stack_words = v);
        self.interrupt_capacity
            .inspect(|&v| settings.interrupt_capacity = v);
        self.binding_capacity
            .inspect(|&v| settings.binding_capacity = v);
        self.random_seed.inspect(|&v| settings.random_seed = v);
        settings
    }
}

/// Collector hooks for scanning thread stacks.
pub trait StackRegistry: Send + Sync {
    fn register_stack(&self, thread_id: u64, bounds: StackBounds);
    fn deregister_stack(&self, thread_id: u64);
}

/// A [`StackRegistry`] that only records the bounds it is given.
#[derive(Debug, Default)]
pub struct StackTable {
    stacks: Mutex<HashMap<u64, StackBounds, ahash::RandomState>>,
}

impl StackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, thread_id: u64) -> Option<StackBounds> {
        self.stacks.lock().get(&thread_id).copied()
    }

    pub fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StackRegistry for StackTable {
    fn register_stack(&self, thread_id: u64, bounds: StackBounds) {
        self.stacks.lock().insert(thread_id, bounds);
    }

    fn deregister_stack(&self, thread_id: u64) {
        self.stacks.lock().remove(&thread_id);
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Marsaglia's xorshf96.
#[derive(Debug, Clone, Copy)]
struct XorShift96 {
    x: u64,
    y: u64,
    z: u64,
}

impl XorShift96 {
    fn new(seed: u64) -> Self {
        Self {
            x: 123_456_789 ^ seed,
            y: 362_436_069,
            z: 521_288_629,
        }
    }

    fn next(&mut self) -> u64 {
        self.x ^= self.x << 16;
        self.x ^= self.x >> 5;
        self.x ^= self.x << 1;
        let t = self.x;
        self.x = self.y;
        self.y = self.z;
        self.z = t ^ self.x ^ self.y;
        self.z
    }
}

/// Everything one thread executes calls against.
///
/// Only the owning thread touches this; other threads reach it exclusively
/// through its [`InterruptHandle`].
pub struct ThreadLocalState {
    id: u64,
    pub vm: VirtualMachine,
    pub bindings: DynamicBindingStack,
    interrupts: InterruptHandle,
    cleanups: Vec<Cleanup>,
    random: XorShift96,
    bytes_allocated: usize,
}

impl ThreadLocalState {
    pub fn new(id: u64, info: &ThreadCreateInfo) -> Self {
        let settings = info.settings();
        let seed = match settings.random_seed {
            0 => id.wrapping_mul(0x9e37_79b9_7f4a_7c15),
            seed => seed,
        };
        Self {
            id,
            vm: VirtualMachine::new(settings.stack_words),
            bindings: DynamicBindingStack::with_capacity(settings.binding_capacity),
            interrupts: InterruptHandle::new(id, settings.interrupt_capacity, thread::current()),
            cleanups: Vec::new(),
            random: XorShift96::new(seed),
            bytes_allocated: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupts.clone()
    }

    pub fn pending_interrupts(&self) -> usize {
        self.interrupts.queue().len()
    }

    /// Takes the oldest pending interrupt. Call at safe points only.
    pub fn poll_interrupt(&mut self) -> Option<Interrupt> {
        self.interrupts.queue().pop()
    }

    /// Drains the queue into `handler`, returning how many were handled.
    pub fn handle_interrupts(&mut self, mut handler: impl FnMut(&mut Self, Interrupt)) -> usize {
        let mut handled = 0;
        while let Some(interrupt) = self.poll_interrupt() {
            log::debug!("thread {} handles {interrupt:?}", self.id);
            handler(self, interrupt);
            handled += 1;
        }
        handled
    }

    /// Registers `f` to run when the thread exits, after every later registration.
    pub fn add_cleanup(&mut self, f: impl FnOnce() + Send + 'static) {
        self.cleanups.push(Box::new(f));
    }

    /// Runs and clears the cleanup chain, newest first. A panicking cleanup is
    /// logged and does not stop the remaining ones.
    pub fn run_cleanups(&mut self) -> usize {
        let mut ran = 0;
        while let Some(cleanup) = self.cleanups.pop() {
            if panic::catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
                log::error!("thread {}: cleanup function panicked", self.id);
            }
            ran += 1;
        }
        ran
    }

    #[inline]
    pub fn random(&mut self) -> u64 {
        self.random.next()
    }

    #[inline]
    pub fn register_bytes_allocated(&mut self, bytes: usize) {
        self.bytes_allocated = self.bytes_allocated.saturating_add(bytes);
    }

    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn stack_bounds(&self) -> StackBounds {
        self.vm.bounds()
    }
}

impl RootProvider for ThreadLocalState {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.vm.visit_roots(visitor);
        self.bindings.visit_roots(visitor);
    }
}

impl Drop for ThreadLocalState {
    fn drop(&mut self) {
        self.interrupts.close();
        self.run_cleanups();
    }
}

impl fmt::Debug for ThreadLocalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalState")
            .field("id", &self.id)
            .field("sp", &self.vm.stack_pointer())
            .field("bindings", &self.bindings.depth())
            .field("interrupts", &self.pending_interrupts())
            .field("cleanups", &self.cleanups.len())
            .finish()
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Id of the worker attached to the calling thread, if any.
pub fn current_worker_id() -> Option<u64> {
    CURRENT_WORKER.with(Cell::get)
}

struct ManagerShared {
    next_id: AtomicU64,
    threads: Mutex<HashMap<u64, InterruptHandle, ahash::RandomState>>,
    collector: Arc<dyn StackRegistry>,
    defaults: ThreadCreateInfo,
    main_init: Once,
}

/// Creates and destroys the per-thread state of every worker.
#[derive(Clone)]
pub struct ThreadManager {
    shared: Arc<ManagerShared>,
}

impl ThreadManager {
    pub fn new(collector: Arc<dyn StackRegistry>, defaults: ThreadCreateInfo) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                next_id: AtomicU64::new(1),
                threads: Mutex::new(HashMap::default()),
                collector,
                defaults,
                main_init: Once::new(),
            }),
        }
    }

    pub fn defaults(&self) -> ThreadCreateInfo {
        self.shared.defaults
    }

    /// Attaches the calling thread. Fails if it already has a worker.
    pub fn attach(&self, info: &ThreadCreateInfo) -> Option<Worker> {
        if current_worker_id().is_some() {
            return None;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let state = ThreadLocalState::new(id, info);
        self.shared
            .collector
            .register_stack(id, state.stack_bounds());
        self.shared
            .threads
            .lock()
            .insert(id, state.interrupt_handle());
        CURRENT_WORKER.with(|c| c.set(Some(id)));
        log::info!(
            "thread {id} attached ({} stack words)",
            state.vm.capacity()
        );
        Some(Worker {
            state,
            manager: self.shared.clone(),
        })
    }

    /// Attaches the main thread, running `init` the first time only.
    pub fn attach_main(&self, info: &ThreadCreateInfo, init: impl FnOnce()) -> Option<Worker> {
        let worker = self.attach(info)?;
        self.shared.main_init.call_once(|| {
            log::debug!("process initialization on thread {}", worker.id());
            init();
        });
        Some(worker)
    }

    /// Spawns an OS thread running `f` against a freshly attached worker.
    pub fn spawn<F, T>(&self, info: ThreadCreateInfo, f: F) -> JoinHandle<T>
    where
        F: FnOnce(&mut Worker) -> T + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.clone();
        thread::spawn(move || {
            // a new OS thread never has a worker yet
            let Some(mut worker) = manager.attach(&info) else {
                unreachable!("fresh thread already attached")
            };
            f(&mut worker)
        })
    }

    /// Queues `interrupt` for thread `id` and wakes it.
    pub fn interrupt(&self, id: u64, interrupt: Interrupt) -> Result<(), InterruptError> {
        let handle = self.shared.threads.lock().get(&id).cloned();
        let Some(handle) = handle else {
            return Err(InterruptError::NoSuchThread(id));
        };
        handle.interrupt(interrupt).inspect_err(|e| {
            log::warn!("interrupt {interrupt:?} for thread {id} dropped: {e}");
        })
    }

    pub fn handle(&self, id: u64) -> Option<InterruptHandle> {
        self.shared.threads.lock().get(&id).cloned()
    }

    pub fn live_threads(&self) -> Vec<u64> {
        let mut ids: Vec<_> = self.shared.threads.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for ThreadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadManager")
            .field("live", &self.shared.threads.lock().len())
            .finish()
    }
}

/// RAII attachment of one thread; detaches on drop, including during unwinding.
pub struct Worker {
    state: ThreadLocalState,
    manager: Arc<ManagerShared>,
}

impl Deref for Worker {
    type Target = ThreadLocalState;
    fn deref(&self) -> &ThreadLocalState {
        &self.state
    }
}

impl DerefMut for Worker {
    fn deref_mut(&mut self) -> &mut ThreadLocalState {
        &mut self.state
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state.fmt(f)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let id = self.state.id;
        self.state.interrupts.close();
        self.manager.threads.lock().remove(&id);
        let ran = self.state.run_cleanups();
        self.manager.collector.deregister_stack(id);
        CURRENT_WORKER.with(|c| c.set(None));
        log::info!("thread {id} detached, {ran} cleanups run");
    }
}
