//! *tern* — a small, portable, fixed-priority preemptive real-time kernel.
//!
//! The kernel owns scheduling, synchronization, and timekeeping, and nothing
//! else. Applications statically allocate every kernel object (task control
//! blocks, stacks, semaphores, mutexes, wait queues, message boxes and
//! queues, timers) and hand them to the kernel, which borrows them for the
//! object's lifetime.
//!
//! # Traits
//!
//! The kernel is generic over a system type implementing [`KernelTraits`],
//! which bundles two concerns:
//!
//!  - **The port interface** — context switching, CPU Lock (interrupts
//!    disabled on the current CPU), the idle relaxation, and the halt
//!    primitive. On bare metal this is a thin wrapper around a few
//!    instructions; the hosted simulator implements it with OS threads.
//!  - **Static configuration** — the number of priority levels and the
//!    storage types derived from it, plus the location of the kernel's
//!    [`State`] singleton.
//!
//! A port crate is expected to provide a `use_port!`-style macro that
//! implements `KernelTraits` on an application-defined system type.
//!
//! # Contexts
//!
//! Kernel APIs are callable from a *task context* (`isr_nesting == 0`) unless
//! documented as ISR-safe. API misuse does not return an error; the kernel
//! has no recoverable failure modes and halts the system instead.
#![cfg_attr(not(test), no_std)]

use core::{
    fmt,
    marker::PhantomData,
    mem, ops,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

#[macro_use]
mod macros;

pub mod error;
pub mod klock;
mod mbox;
mod mqueue;
mod mutex;
mod ring;
mod semaphore;
mod state;
mod task;
mod taskqueue;
mod timeout;
pub mod utils;
mod waitqueue;

pub use self::{
    error::{DownError, LockError, PopError, PostError, ResultCode, WaitError},
    mbox::MboxCb,
    mqueue::{Discipline, MqueueCb},
    mutex::MutexCb,
    ring::{Msg, Ring, RingStorage},
    semaphore::SemaphoreCb,
    task::{TaskCb, TaskSt},
    taskqueue::TaskQueue,
    timeout::{Timer, TimerFn, WaitObj, TICKS_REM_MAX, UNSYNCH_MAX},
    waitqueue::{WaitQueueCb, WAKE_ALL},
};

use self::{
    klock::CpuLockCell,
    utils::{Init, PrioBitmap},
};

/// A task priority. `0` is the lowest priority and is reserved for the idle
/// task.
pub type Priority = u8;

/// A point of time or a time span, measured in ticks.
pub type Ticks = u32;

/// The wrap-around limit of the monotonic tick counter.
pub const TICKS_MAX: Ticks = Ticks::MAX;

/// The trait a system type must implement to host the kernel.
///
/// # Safety
///
/// The contract between the kernel and the port is largely unenforceable by
/// the type system: the port promises that the CPU Lock methods actually
/// establish mutual exclusion against interrupt entry, that
/// [`context_switch`](Self::context_switch) suspends the calling context and
/// resumes `next` exactly once, and that `state()` always returns the same
/// instance. This trait is only meant to be implemented by a port's
/// configuration macro.
pub unsafe trait KernelTraits: Sized + 'static {
    // ----------------------------------------------------------------
    // Port interface

    /// Port-specific per-task state, e.g. the saved context. Placed at the
    /// very beginning of [`TaskCb`].
    type PortTaskState: Send + Sync + fmt::Debug + 'static;

    #[allow(clippy::declare_interior_mutable_const)]
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// The minimum stack size accepted by [`System::task_create`].
    const STACK_MIN_SIZE: usize;

    /// `true` if stacks grow toward lower addresses.
    const STACK_DESCENDING: bool;

    /// Try to enter a CPU Lock state. Returns `false` if it was already
    /// active.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock state.
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Prepare the task for its first execution, so that the next context
    /// switch to it enters the task's entry point.
    ///
    /// Called with CPU Lock active. The entry point and stack are published
    /// in `task` beforehand.
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>);

    /// Save the calling context into the current task and resume `next`.
    /// Returns when some other context switches back to the caller.
    ///
    /// Called with CPU Lock active; the lock state is carried over to the
    /// resumed context.
    unsafe fn context_switch(next: &'static TaskCb<Self>);

    /// Discard the calling context and resume `next`. `exiting` (the
    /// caller's task) has already been removed from scheduling.
    unsafe fn context_switch_exit(
        exiting: &'static TaskCb<Self>,
        next: &'static TaskCb<Self>,
    ) -> !;

    /// Relax the CPU inside the idle loop until something interesting
    /// happens.
    unsafe fn idle();

    /// Stop the system. Never returns.
    fn halt() -> !;

    // ----------------------------------------------------------------
    // Static configuration

    /// The number of priority levels, in range `2..=usize::BITS`.
    const NUM_PRIORITY_LEVELS: usize;

    /// The priority bitmap type, `FixedPrioBitmap<NUM_PRIORITY_LEVELS>`.
    type PrioBitmap: PrioBitmap;

    /// The priority-bucket array type of a task queue,
    /// `[_; NUM_PRIORITY_LEVELS]`.
    type BucketArray: Buckets<Self>;

    /// Get the kernel's state singleton.
    fn state() -> &'static State<Self>;
}

/// The priority-bucket array of a [`TaskQueue`]. Implemented by
/// `[_; LEN]` for every `LEN`; the kernel indexes it with priorities below
/// [`KernelTraits::NUM_PRIORITY_LEVELS`].
pub trait Buckets<Traits: KernelTraits>:
    ops::Index<usize, Output = CpuLockCell<Traits, utils::intrusive_list::StaticListHead<TaskCb<Traits>>>>
    + Init
    + Send
    + Sync
    + 'static
{
    const LEN: usize;
}

impl<Traits: KernelTraits, const LEN: usize> Buckets<Traits>
    for [CpuLockCell<Traits, utils::intrusive_list::StaticListHead<TaskCb<Traits>>>; LEN]
{
    const LEN: usize = LEN;
}

/// The kernel's state singleton. A port's configuration macro places one
/// instance of this in a `static` and hands it out through
/// [`KernelTraits::state`].
pub struct State<Traits: KernelTraits> {
    /// The currently running task. `None` only before [`System::boot`].
    pub(crate) running_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// Task queue for `Ready` tasks; the scheduler picks the next running
    /// task from here.
    pub(crate) ready_queue: TaskQueue<Traits>,

    /// The nesting level of interrupt service routines. `0` means the CPU is
    /// executing task code. Read without CPU Lock by context assertions.
    pub(crate) isr_nesting: AtomicUsize,

    /// Counting flag suppressing task switching while leaving interrupts
    /// enabled.
    pub(crate) sched_lock: AtomicUsize,

    /// The task control block of the idle task. The bootstrap context
    /// becomes this task.
    pub(crate) idle_task: TaskCb<Traits>,

    /// Timer module state.
    pub(crate) timeout: timeout::TimeoutGlobals<Traits>,
}

// Safety: every field is individually thread-safe; the non-`Sync` parts are
// guarded by CPU Lock
unsafe impl<Traits: KernelTraits> Sync for State<Traits> {}

impl<Traits: KernelTraits> State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Self = Self {
        running_task: CpuLockCell::new(None),
        ready_queue: TaskQueue::INIT,
        isr_nesting: AtomicUsize::new(0),
        sched_lock: AtomicUsize::new(0),
        idle_task: TaskCb::INIT,
        timeout: timeout::TimeoutGlobals::INIT,
    };

    pub const fn new() -> Self {
        Self::INIT
    }

    /// Get the idle task's control block. Used by ports to bind the
    /// bootstrap context to the idle task.
    pub fn idle_task(&'static self) -> &'static TaskCb<Traits> {
        &self.idle_task
    }
}

impl<Traits: KernelTraits> Default for State<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("isr_nesting", &self.isr_nesting)
            .field("sched_lock", &self.sched_lock)
            .finish_non_exhaustive()
    }
}

/// The interface to the kernel for both applications and ports,
/// parametrized by the system type.
pub struct System<Traits>(PhantomData<Traits>);

/// Stop the system. Used on every fatal condition.
pub(crate) fn halt<Traits: KernelTraits>() -> ! {
    Traits::state().sched_lock.fetch_add(1, Ordering::SeqCst);
    Traits::halt()
}

/// A borrowed region of memory to be used as a task stack.
#[derive(Debug, Clone, Copy)]
pub struct StackHunk {
    ptr: *mut u8,
    len: usize,
}

// Safety: `StackHunk` is just a (pointer, length) pair; the kernel only ever
// touches the pointee under CPU Lock
unsafe impl Send for StackHunk {}
unsafe impl Sync for StackHunk {}

impl StackHunk {
    /// Construct a `StackHunk` from raw parts.
    ///
    /// # Safety
    ///
    /// The region must be valid, writable and unaliased for as long as a task
    /// is using it.
    pub const unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Statically allocated storage for a task stack.
///
/// On the hosted port the stack is not actually executed on, but it still
/// backs the stack tripwire check.
pub struct TaskStack<const LEN: usize> {
    storage: core::cell::UnsafeCell<[u8; LEN]>,
}

// Safety: accessed only through `StackHunk`, whose users uphold exclusivity
unsafe impl<const LEN: usize> Sync for TaskStack<LEN> {}

impl<const LEN: usize> TaskStack<LEN> {
    pub const fn new() -> Self {
        Self {
            storage: core::cell::UnsafeCell::new([0; LEN]),
        }
    }

    pub fn hunk(&'static self) -> StackHunk {
        // Safety: `self` is a static, so the region outlives every task
        unsafe { StackHunk::from_raw_parts(self.storage.get() as *mut u8, LEN) }
    }
}

impl<const LEN: usize> Default for TaskStack<LEN> {
    fn default() -> Self {
        Self::new()
    }
}

/// A task entry point and its parameter.
#[derive(Debug, Clone, Copy)]
pub struct TaskEntry {
    pub entry: fn(usize) -> usize,
    pub param: usize,
}

pub(crate) struct EntryCell {
    entry: AtomicPtr<()>,
    param: AtomicUsize,
}

impl Init for EntryCell {
    const INIT: Self = Self {
        entry: AtomicPtr::INIT,
        param: AtomicUsize::new(0),
    };
}

impl EntryCell {
    pub(crate) fn store(&self, e: TaskEntry) {
        self.param.store(e.param, Ordering::SeqCst);
        self.entry.store(e.entry as *mut (), Ordering::SeqCst);
    }

    pub(crate) fn load(&self) -> Option<TaskEntry> {
        let p = self.entry.load(Ordering::SeqCst);
        if p.is_null() {
            None
        } else {
            Some(TaskEntry {
                // Safety: the pointer was produced from `fn(usize) -> usize`
                // in `store`
                entry: unsafe { mem::transmute::<*mut (), fn(usize) -> usize>(p) },
                param: self.param.load(Ordering::SeqCst),
            })
        }
    }
}

/// Read-only access to the monotonic tick counter.
impl<Traits: KernelTraits> System<Traits> {
    /// Get the current value of the monotonic tick counter.
    ///
    /// Callable from any context.
    pub fn ticks_now() -> Ticks {
        Traits::state().timeout.ticks_cnt.load(Ordering::SeqCst)
    }

    /// Compute the number of ticks between `start` and `now`, accounting for
    /// wrap-around.
    pub fn ticks_diff(start: Ticks, now: Ticks) -> Ticks {
        if start > now {
            TICKS_MAX - start + 1 + now
        } else {
            now - start
        }
    }
}

