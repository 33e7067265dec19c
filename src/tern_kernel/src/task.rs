//! Tasks and the scheduler core.
use core::{fmt, ptr::NonNull, sync::atomic::Ordering};

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    mutex::MutexCb,
    semaphore::{self, SemaphoreCb},
    state,
    taskqueue::{TaskQueue, TaskQueueRef},
    timeout,
    utils::{
        intrusive_list::{ListHead, StaticLink, StaticListHead},
        Init,
    },
    waitqueue::WaitQueueCb,
    EntryCell, KernelTraits, Priority, ResultCode, StackHunk, System, TaskEntry,
};

/// Fill pattern for the stack tripwire check. Will be truncated to the
/// register size on exotic targets.
#[cfg(feature = "check_stack")]
const STACK_FILL_PATTERN: u8 = 0xAB;

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskSt {
    /// Not yet created.
    Dormant,
    /// Linked in the ready queue, waiting for the processor.
    Ready,
    /// Executing. Exactly one task per CPU is in this state.
    Running,
    /// Blocked on a primitive's wait list.
    Waiting,
    /// Exited; waiting to be reaped by `task_join`.
    Destroyed,
    /// Reaped. The control block may be reused by `task_create`.
    Invalid,
}

impl Init for TaskSt {
    const INIT: Self = Self::Dormant;
}

/// Identifies which primitive blocked a task. Carried while the task is in
/// the `Waiting` state and used by the priority-inheritance chain walk.
pub(crate) enum BlockReason<Traits: KernelTraits> {
    None,
    Sem,
    Mutex(&'static MutexCb<Traits>),
    WaitQueue,
}

impl<Traits: KernelTraits> Clone for BlockReason<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for BlockReason<Traits> {}

impl<Traits: KernelTraits> Init for BlockReason<Traits> {
    const INIT: Self = Self::None;
}

impl<Traits: KernelTraits> fmt::Debug for BlockReason<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Sem => f.write_str("Sem"),
            Self::Mutex(mutex) => write!(f, "Mutex({:p})", *mutex),
            Self::WaitQueue => f.write_str("WaitQueue"),
        }
    }
}

/// A pointer to a join semaphore living on the joining task's stack.
///
/// Valid from the moment `task_join` publishes it until `task_exit` signals
/// it; the joining task cannot leave `task_join` before that happens.
pub(crate) struct SemRef<Traits: KernelTraits>(NonNull<SemaphoreCb<Traits>>);

// Safety: plain pointer, dereferenced only under CPU Lock while valid
unsafe impl<Traits: KernelTraits> Send for SemRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for SemRef<Traits> {}

impl<Traits: KernelTraits> Clone for SemRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<Traits: KernelTraits> Copy for SemRef<Traits> {}

impl<Traits: KernelTraits> SemRef<Traits> {
    fn new(sem: &SemaphoreCb<Traits>) -> Self {
        Self(NonNull::from(sem))
    }

    /// # Safety
    ///
    /// See the type-level comment.
    unsafe fn as_ref<'a>(&self) -> &'a SemaphoreCb<Traits> {
        unsafe { &*self.0.as_ptr() }
    }
}

/// *Task control block* — the state data of a task.
///
/// Statically allocated by the application and borrowed by the kernel from
/// `task_create` until `task_join`.
#[repr(C)]
pub struct TaskCb<Traits: KernelTraits> {
    /// Port-specific task state, e.g. the saved context.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so that
    /// low-level context-switching code can refer to it without an offset
    /// computation.
    pub port_task_state: Traits::PortTaskState,

    /// Link for whichever task queue bucket the task currently inhabits.
    pub(crate) link: CpuLockCell<Traits, Option<StaticLink<TaskCb<Traits>>>>,

    /// The queue the task is linked into, if any. A borrowed back-reference,
    /// valid only while the task is linked.
    pub(crate) task_queue: CpuLockCell<Traits, Option<TaskQueueRef<Traits>>>,

    /// The priority assigned at creation. Fixed for the task's lifetime.
    pub(crate) prio_base: CpuLockCell<Traits, Priority>,

    /// The effective priority. May be temporarily raised above `prio_base`
    /// by priority inheritance.
    pub(crate) prio_current: CpuLockCell<Traits, Priority>,

    pub(crate) st: CpuLockCell<Traits, TaskSt>,

    pub(crate) block_reason: CpuLockCell<Traits, BlockReason<Traits>>,

    /// The result of the last wait operation, set by whoever ended it.
    pub(crate) block_code: CpuLockCell<Traits, ResultCode>,

    /// The timeout timer guarding the current wait operation, if any.
    /// Readable without CPU Lock (`os_atomicptr` discipline).
    pub(crate) block_timer: core::sync::atomic::AtomicPtr<timeout::Timer<Traits>>,

    /// The wait queue this task prepared to suspend on. Non-null means the
    /// task is in the *prepared* state. Written atomically so that the
    /// prepare fast path needs no critical section.
    pub(crate) wait_queue: core::sync::atomic::AtomicPtr<WaitQueueCb<Traits>>,

    /// Head of the list of all mutexes currently owned by this task, used
    /// for the effective-priority recomputation on unlock.
    pub(crate) mtx_list: CpuLockCell<Traits, StaticListHead<MutexCb<Traits>>>,

    /// Published by a task waiting in `task_join` for this task to exit.
    pub(crate) join_sem: CpuLockCell<Traits, Option<SemRef<Traits>>>,

    /// The value returned by the task body, consumed by `task_join`.
    pub(crate) ret_value: CpuLockCell<Traits, usize>,

    pub(crate) entry: EntryCell,

    pub(crate) stack: CpuLockCell<Traits, Option<StackHunk>>,
}

// Safety: every field is either atomic or guarded by CPU Lock
unsafe impl<Traits: KernelTraits> Sync for TaskCb<Traits> {}

impl<Traits: KernelTraits> TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Self = Self {
        port_task_state: Traits::PORT_TASK_STATE_INIT,
        link: CpuLockCell::new(None),
        task_queue: CpuLockCell::new(None),
        prio_base: CpuLockCell::new(0),
        prio_current: CpuLockCell::new(0),
        st: CpuLockCell::new(TaskSt::Dormant),
        block_reason: CpuLockCell::new(BlockReason::None),
        block_code: CpuLockCell::new(ResultCode::Success),
        block_timer: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
        wait_queue: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
        mtx_list: CpuLockCell::new(ListHead::new()),
        join_sem: CpuLockCell::new(None),
        ret_value: CpuLockCell::new(0),
        entry: EntryCell::INIT,
        stack: CpuLockCell::new(None),
    };

    pub const fn new() -> Self {
        Self::INIT
    }

    /// Get the task's entry point, published by `task_create`. Used by ports
    /// that execute tasks on their own execution resources.
    pub fn entry_point(&self) -> Option<TaskEntry> {
        self.entry.load()
    }

    /// Get the task's base priority.
    pub fn priority(&self) -> Priority {
        let lock = klock::lock_cpu::<Traits>();
        self.prio_base.get(&*lock)
    }

    /// Get the task's effective priority, which may be temporarily raised
    /// above the base priority by priority inheritance.
    pub fn effective_priority(&self) -> Priority {
        let lock = klock::lock_cpu::<Traits>();
        self.prio_current.get(&*lock)
    }

    /// Get the task's current state.
    pub fn state(&self) -> TaskSt {
        let lock = klock::lock_cpu::<Traits>();
        self.st.get(&*lock)
    }
}

impl<Traits: KernelTraits> Default for TaskCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::INIT;
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("port_task_state", &self.port_task_state)
            .field("prio_base", &self.prio_base)
            .field("prio_current", &self.prio_current)
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

/// Get the currently running task.
pub(crate) fn current<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> &'static TaskCb<Traits> {
    Traits::state()
        .running_task
        .get(&*lock)
        .expect("no running task before boot")
}

/// Transition `task` into the `Ready` state and enqueue it.
///
/// A task in the prepared state (non-null `wait_queue`) is routed into the
/// wait queue's task queue instead of the ready queue, so that a notifier
/// always finds it there. See the wait-queue module for the full protocol.
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    task.st.replace(&mut *lock, TaskSt::Ready);

    let wait_queue = task.wait_queue.load(Ordering::SeqCst);
    if let Some(wait_queue) = unsafe { wait_queue.as_ref() } {
        wait_queue.task_queue().enqueue(lock, task);
    } else {
        Traits::state().ready_queue.enqueue(lock, task);
    }
}

/// Transition the current task into the `Waiting` state on the given task
/// queue.
pub(crate) fn make_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_queue: &TaskQueue<Traits>,
    reason: BlockReason<Traits>,
) {
    let task = current(lock.borrow_mut());
    task.st.replace(&mut *lock, TaskSt::Waiting);
    task.block_reason.replace(&mut *lock, reason);
    task_queue.enqueue(lock, task);
}

/// Switch to another `Ready` task of equal or higher priority, if any.
///
/// - Called from task code (`isr_nesting == 0`), this performs the context
///   switch immediately.
/// - Called from the outermost interrupt handler (`isr_nesting == 1`), this
///   only updates the running-task pointer; the port restores the new task's
///   context when the interrupt nesting unwinds to zero.
/// - In a nested interrupt, or while the scheduler lock is held, this does
///   nothing.
///
/// Must be called with CPU Lock active.
pub(crate) fn schedule<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    higher_only: bool,
) {
    schedule_inner(lock, higher_only, true)
}

fn schedule_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    higher_only: bool,
    route_prepared: bool,
) {
    let state = Traits::state();
    let isr_nesting = state.isr_nesting.load(Ordering::SeqCst);

    if isr_nesting > 1 || state.sched_lock.load(Ordering::SeqCst) != 0 {
        return;
    }

    let cur = current(lock.borrow_mut());
    let min_prio = cur.prio_current.get(&*lock) as usize + higher_only as usize;

    let Some(new_task) = state
        .ready_queue
        .dequeue_above(lock.borrow_mut(), min_prio)
    else {
        return;
    };

    if route_prepared {
        make_ready(lock.borrow_mut(), cur);
    } else {
        // Stay in the ready queue even in the prepared state; see
        // `yield_to_peer`.
        cur.st.replace(&mut *lock, TaskSt::Ready);
        state.ready_queue.enqueue(lock.borrow_mut(), cur);
    }
    state.running_task.replace(&mut *lock, Some(new_task));
    new_task.st.replace(&mut *lock, TaskSt::Running);

    if isr_nesting == 0 {
        // Safety: CPU Lock active, `new_task` is ready to run
        unsafe { Traits::context_switch(new_task) };
    }
    // In an interrupt handler the context switch is deferred to the
    // interrupt epilogue, which restores `running_task`'s context.
}

/// Unconditionally block the current task on `task_queue` and switch to the
/// next `Ready` task. Returns when the task is woken up again.
///
/// Must not be called from an interrupt handler. The idle task is always
/// ready, so a next task always exists.
pub(crate) fn block_and_switch<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_queue: &TaskQueue<Traits>,
    reason: BlockReason<Traits>,
) {
    let state = Traits::state();
    self_check_assert!(Traits, state.isr_nesting.load(Ordering::SeqCst) == 0);

    make_wait(lock.borrow_mut(), task_queue, reason);

    let new_task = state.ready_queue.dequeue(lock.borrow_mut());
    self_check_assert!(Traits, new_task.is_some());
    let Some(new_task) = new_task else { return };

    state.running_task.replace(&mut *lock, Some(new_task));
    new_task.st.replace(&mut *lock, TaskSt::Running);

    // Safety: CPU Lock active, `new_task` is ready to run
    unsafe { Traits::context_switch(new_task) };

    // We return here when some other context switches back to us; our state
    // has already been set to `Running` by the switcher.
}

/// Reset a task control block for (re)creation.
fn task_init<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    prio: Priority,
) {
    self_check_assert!(Traits, task.link.get(&*lock).is_none());

    task.task_queue.replace(&mut *lock, None);
    task.prio_base.replace(&mut *lock, prio);
    task.prio_current.replace(&mut *lock, prio);
    task.st.replace(&mut *lock, TaskSt::Ready);
    task.block_reason.replace(&mut *lock, BlockReason::None);
    task.block_code.replace(&mut *lock, ResultCode::Success);
    task.block_timer
        .store(core::ptr::null_mut(), Ordering::SeqCst);
    task.wait_queue
        .store(core::ptr::null_mut(), Ordering::SeqCst);
    task.mtx_list.replace(&mut *lock, ListHead::new());
    task.join_sem.replace(&mut *lock, None);
    task.ret_value.replace(&mut *lock, 0);
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a task and make it eligible for scheduling.
    ///
    /// The kernel borrows `task` and the stack region until the task is
    /// reaped by [`task_join`](Self::task_join). If the new task has a higher
    /// priority than the caller, the switch happens before this function
    /// returns.
    ///
    /// Forbidden from an interrupt handler and from the prepared state.
    pub fn task_create(
        task: &'static TaskCb<Traits>,
        stack: StackHunk,
        prio: Priority,
        entry: fn(usize) -> usize,
        param: usize,
    ) {
        api_assert!(Traits, state::in_task_context::<Traits>());
        api_assert!(Traits, (prio as usize) < Traits::NUM_PRIORITY_LEVELS);
        // only the idle task may have priority 0
        api_assert!(Traits, prio > 0);
        api_assert!(Traits, stack.len() >= Traits::STACK_MIN_SIZE);

        let mut lock = klock::lock_cpu::<Traits>();
        api_assert!(Traits, !prepared(lock.borrow_mut()));
        {
            let st = task.st.get(&*lock);
            api_assert!(Traits, st == TaskSt::Dormant || st == TaskSt::Invalid);
        }

        task_init(lock.borrow_mut(), task, prio);
        task.entry.store(TaskEntry { entry, param });

        #[cfg(feature = "check_stack")]
        {
            // Safety: the application gave us this region for exclusive use
            unsafe { core::ptr::write_bytes(stack.as_ptr(), STACK_FILL_PATTERN, stack.len()) };
        }
        task.stack.replace(&mut *lock, Some(stack));

        // Safety: CPU Lock active, the task's entry point and stack are set
        unsafe { Traits::initialize_task_state(task) };

        Traits::state().ready_queue.enqueue(lock.borrow_mut(), task);
        schedule(lock.borrow_mut(), true);
    }

    /// Wait for `task` to exit and reap it, returning the value its body
    /// returned. Exactly one task may join a given task, exactly once.
    pub fn task_join(task: &'static TaskCb<Traits>) -> usize {
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>();
        api_assert!(
            Traits,
            !core::ptr::eq(current(lock.borrow_mut()), &Traits::state().idle_task)
        );
        api_assert!(Traits, !prepared(lock.borrow_mut()));
        // only one task is allowed to wait for a particular task
        api_assert!(Traits, task.join_sem.get(&*lock).is_none());
        {
            let st = task.st.get(&*lock);
            // a task can be joined only once and must have been created
            api_assert!(Traits, st != TaskSt::Invalid && st != TaskSt::Dormant);
        }

        if task.st.get(&*lock) < TaskSt::Destroyed {
            // The task has not finished yet; wait for it on a semaphore that
            // lives on our stack. `task_exit` will signal it.
            let join_sem = SemaphoreCb::<Traits>::new(0);
            task.join_sem
                .replace(&mut *lock, Some(SemRef::new(&join_sem)));

            let code = semaphore::wait_inner(lock.borrow_mut(), &join_sem, None);
            self_check_assert!(Traits, code == ResultCode::Success);
        }

        self_check_assert!(Traits, task.st.get(&*lock) == TaskSt::Destroyed);
        task.st.replace(&mut *lock, TaskSt::Invalid);
        task.join_sem.replace(&mut *lock, None);
        task.ret_value.get(&*lock)
    }

    /// Terminate the calling task, storing `ret_value` for a later
    /// [`task_join`](Self::task_join). Never returns.
    pub fn task_exit(ret_value: usize) -> ! {
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>();
        let cur = current(lock.borrow_mut());
        // exiting while owning mutexes would strand their waiters
        self_check_assert!(Traits, cur.mtx_list.get(&*lock).is_empty());

        cur.ret_value.replace(&mut *lock, ret_value);
        cur.st.replace(&mut *lock, TaskSt::Destroyed);

        if let Some(join_sem) = cur.join_sem.get(&*lock) {
            // Signal the joiner without rescheduling: the scheduler lock
            // makes sure the joiner cannot reap us before our context switch
            // completes.
            let state = Traits::state();
            state.sched_lock.fetch_add(1, Ordering::SeqCst);
            // Safety: the joiner is still blocked, so the semaphore is valid
            let join_sem = unsafe { join_sem.as_ref() };
            join_sem.signal_locked(lock.borrow_mut(), true);
            state.sched_lock.fetch_sub(1, Ordering::SeqCst);
        }

        // Choose any ready task; at least the idle task is ready. Since the
        // current task is not pushed anywhere, it disappears from scheduling.
        let Some(next) = Traits::state().ready_queue.dequeue(lock.borrow_mut()) else {
            crate::halt::<Traits>()
        };
        Traits::state()
            .running_task
            .replace(&mut *lock, Some(next));
        next.st.replace(&mut *lock, TaskSt::Running);

        // The CPU Lock state is inherited by `next`'s context, which will
        // release it through its own guard.
        core::mem::forget(lock);

        // Safety: CPU Lock active, `next` is ready to run
        unsafe { Traits::context_switch_exit(cur, next) }
    }

    /// Offer the processor to other `Ready` tasks of the same or higher
    /// priority.
    pub fn yield_now() {
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>();
        api_assert!(
            Traits,
            !core::ptr::eq(current(lock.borrow_mut()), &Traits::state().idle_task)
        );
        api_assert!(Traits, !prepared(lock.borrow_mut()));

        schedule(lock.borrow_mut(), false);
    }

    /// Verify the stack tripwire of `task`, halting the system if the fill
    /// pattern at the far end of the stack has been disturbed.
    #[cfg(feature = "check_stack")]
    pub fn task_check(task: &'static TaskCb<Traits>) {
        let lock = klock::lock_cpu::<Traits>();
        let Some(stack) = task.stack.get(&*lock) else {
            crate::halt::<Traits>()
        };
        let sentinel = if Traits::STACK_DESCENDING {
            stack.as_ptr()
        } else {
            // Safety: in-bounds offset computation
            unsafe { stack.as_ptr().add(stack.len() - 1) }
        };
        // Safety: the stack region is valid while the task exists
        if unsafe { sentinel.read_volatile() } != STACK_FILL_PATTERN {
            crate::halt::<Traits>();
        }
    }

    /// Bootstrap the kernel and turn the calling context into the idle task.
    /// Never returns.
    ///
    /// `app_init` runs with the scheduler locked and must create the
    /// application's initial tasks and start the tick source. `app_idle` is
    /// invoked repeatedly from the idle loop.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, by the port, from the context that is to
    /// become the idle task, with CPU Lock inactive.
    pub unsafe fn boot(app_init: fn(), app_idle: fn()) -> ! {
        let state = Traits::state();

        {
            let mut lock = klock::lock_cpu::<Traits>();
            task_init(lock.borrow_mut(), &state.idle_task, 0);
            state.idle_task.st.replace(&mut *lock, TaskSt::Running);
            state
                .running_task
                .replace(&mut *lock, Some(&state.idle_task));

            // Prevent context switches to the tasks created by `app_init`
            // until initialization is complete.
            state.sched_lock.fetch_add(1, Ordering::SeqCst);
        }

        app_init();

        state.sched_lock.fetch_sub(1, Ordering::SeqCst);

        {
            // Force the first context switch: any user task outranks the
            // idle task.
            let mut lock = klock::lock_cpu::<Traits>();
            make_ready(lock.borrow_mut(), &state.idle_task);
            let next = state
                .ready_queue
                .dequeue(lock.borrow_mut())
                .expect("ready queue empty at boot");
            state.running_task.replace(&mut *lock, Some(next));
            next.st.replace(&mut *lock, TaskSt::Running);
            if !core::ptr::eq(next, &state.idle_task) {
                // Safety: CPU Lock active, `next` is ready to run
                unsafe { Traits::context_switch(next) };
            }
        }

        // The idle task spins here for the rest of the system's life.
        loop {
            app_idle();
            // Safety: called from the idle loop with CPU Lock inactive
            unsafe { Traits::idle() };
        }
    }

    /// Account for an interrupt entry. Called by the port from every
    /// interrupt prologue.
    ///
    /// # Safety
    ///
    /// Must be balanced with [`isr_exit`](Self::isr_exit).
    pub unsafe fn isr_enter() {
        Traits::state().isr_nesting.fetch_add(1, Ordering::SeqCst);
    }

    /// Account for an interrupt exit and return the task whose context must
    /// be restored, which may differ from the interrupted one if the handler
    /// requested a reschedule.
    ///
    /// # Safety
    ///
    /// Must be balanced with [`isr_enter`](Self::isr_enter); CPU Lock must be
    /// inactive.
    pub unsafe fn isr_exit() -> &'static TaskCb<Traits> {
        let prev = Traits::state().isr_nesting.fetch_sub(1, Ordering::SeqCst);
        self_check_assert!(Traits, prev > 0);

        let mut lock = klock::lock_cpu::<Traits>();
        current(lock.borrow_mut())
    }

    /// The tick handler. Advances the timer wheel and then offers the
    /// processor to another task of equal or higher priority (round-robin
    /// within a priority).
    ///
    /// # Safety
    ///
    /// Must be called from an interrupt handler (between `isr_enter` and
    /// `isr_exit`), with CPU Lock inactive.
    pub unsafe fn tick() {
        api_assert!(
            Traits,
            Traits::state().isr_nesting.load(Ordering::SeqCst) > 0
        );

        let mut lock = klock::lock_cpu::<Traits>();
        lock = timeout::handle_tick(lock);
        schedule(lock.borrow_mut(), false);
    }
}

/// Check whether the current task is in the prepared state (associated with
/// a wait queue by `prepare` but not yet waiting).
pub(crate) fn prepared<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
    !current(lock).wait_queue.load(Ordering::SeqCst).is_null()
}

/// `yield_now` without the usage checks, for the ring buffer's commit wait,
/// which may run in the prepared state (a message-queue receiver spins here
/// between `prepare` and `wait`). Unlike a preemption, this yield must leave
/// the task in the *ready* queue: it already holds a reserved span of the
/// ring, so it must run again as soon as the peer commits, not wait for a
/// notifier.
pub(crate) fn yield_to_peer<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>();
    schedule_inner(lock.borrow_mut(), false, false);
}
