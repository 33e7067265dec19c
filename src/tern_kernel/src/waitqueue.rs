//! Wait queues: a condition-variable-like primitive with a race-free
//! prepare/check/wait protocol.
//!
//! The receiver side goes through three steps:
//!
//! ```text
//! loop {
//!     queue.prepare();                       // or prepare_timeout
//!     if condition() { queue.finish(); break; }
//!     match queue.wait() {
//!         Ok(()) => continue,                // woken up; re-check
//!         Err(_) => break,                   // timed out or destroyed
//!     }
//! }
//! ```
//!
//! and a notifier does `set_condition(); queue.wake_up(n, false);`.
//!
//! `prepare` merely associates the running task with the queue (the
//! *prepared* state); the task keeps running and checks the condition. The
//! lost-wakeup race between the check and `wait` is closed in two ways:
//!
//!  - If the notifier runs in an interrupt handler that preempted the
//!    prepared task itself, `wake_up` simply clears the association; `wait`
//!    then returns immediately.
//!  - If the prepared task is preempted by another task, the scheduler
//!    routes it into the wait queue's task queue instead of the ready queue
//!    (see `task::make_ready`), so the notifier finds it there like any
//!    blocked waiter.
use core::{pin::Pin, sync::atomic::Ordering};

use crate::{
    error::WaitError,
    klock::{self, CpuLockGuard, CpuLockTokenRefMut},
    state, task,
    task::{BlockReason, TaskCb, TaskSt},
    taskqueue,
    taskqueue::TaskQueue,
    timeout::{self, WaitObj},
    KernelTraits, ResultCode, Ticks,
};

/// Pass to [`WaitQueueCb::wake_up`] to wake every waiter.
pub const WAKE_ALL: usize = usize::MAX;

/// *Wait-queue control block*.
pub struct WaitQueueCb<Traits: KernelTraits> {
    task_queue: TaskQueue<Traits>,
}

impl<Traits: KernelTraits> WaitQueueCb<Traits> {
    pub const fn new() -> Self {
        Self {
            task_queue: TaskQueue::INIT,
        }
    }

    pub(crate) fn task_queue(&self) -> &TaskQueue<Traits> {
        &self.task_queue
    }

    /// Enter the prepared state: associate the running task with this queue.
    ///
    /// From this point until [`finish`](Self::finish) or
    /// [`wait`](Self::wait), a preemption parks the task in this queue
    /// rather than the ready queue, and a wakeup can target it.
    pub fn prepare(&self) {
        let mut lock = self.prepare_inner();
        task::current(lock.borrow_mut())
            .wait_queue
            .store(self as *const _ as *mut _, Ordering::SeqCst);
    }

    /// Like [`prepare`](Self::prepare), with a timeout covering both the
    /// condition check and the subsequent [`wait`](Self::wait). The timer
    /// lives in `wait_obj`, which must stay untouched until `finish` or
    /// `wait` returns.
    pub fn prepare_timeout(&self, wait_obj: Pin<&WaitObj<Traits>>, timeout_ticks: Ticks) {
        let mut lock = self.prepare_inner();
        let current_task = task::current(lock.borrow_mut());
        current_task
            .wait_queue
            .store(self as *const _ as *mut _, Ordering::SeqCst);
        timeout::blocktimer_create(
            lock.borrow_mut(),
            wait_obj.timer(),
            timeout_callback::<Traits>,
            current_task,
            timeout_ticks,
        );
    }

    fn prepare_inner(&self) -> klock::CpuLockGuard<Traits> {
        api_assert!(Traits, state::in_task_context::<Traits>());
        let mut lock = klock::lock_cpu::<Traits>();
        // the idle task cannot use blocking primitives
        api_assert!(
            Traits,
            task::current(lock.borrow_mut()).prio_current.get(&*lock) > 0
        );
        // waiting on multiple wait queues at once is not supported
        api_assert!(Traits, !task::prepared(lock.borrow_mut()));
        lock
    }

    /// Leave the prepared state without waiting; the fast-path exit taken
    /// when the condition turned out to be already satisfied.
    ///
    /// The association may already be gone by the time this runs: a notifier
    /// can wake the task while it is preempted in the middle of its
    /// condition check. There is nothing left to undo then except the
    /// timeout timer.
    pub fn finish(&self) {
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>();
        let current_task = task::current(lock.borrow_mut());
        {
            let wait_queue = current_task.wait_queue.load(Ordering::SeqCst);
            // being associated with an unrelated queue is a protocol violation
            api_assert!(Traits, wait_queue.is_null() || core::ptr::eq(wait_queue, self));
        }

        current_task
            .wait_queue
            .store(core::ptr::null_mut(), Ordering::SeqCst);
        timeout::blocktimer_destroy(lock.borrow_mut(), current_task);
    }

    /// Suspend until a wakeup, unless one already arrived since
    /// [`prepare`](Self::prepare).
    ///
    /// `Ok(())` means a wakeup was received and the caller should re-check
    /// its condition.
    pub fn wait(&self) -> Result<(), WaitError> {
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>();
        let current_task = task::current(lock.borrow_mut());
        // the idle task cannot block
        api_assert!(Traits, current_task.prio_current.get(&*lock) > 0);

        let wait_queue = current_task.wait_queue.load(Ordering::SeqCst);
        if wait_queue.is_null() {
            // A wakeup (or the timeout) beat us to it; the association is
            // already gone and `block_code` holds the verdict.
            timeout::blocktimer_destroy(lock.borrow_mut(), current_task);
        } else {
            // association with an unrelated queue is a protocol violation
            api_assert!(Traits, core::ptr::eq(wait_queue, self));

            // Safety: the queue is alive; we are about to be linked into it
            let wait_queue = unsafe { &*wait_queue };
            task::block_and_switch(
                lock.borrow_mut(),
                &wait_queue.task_queue,
                BlockReason::WaitQueue,
            );
            timeout::blocktimer_destroy(lock.borrow_mut(), current_task);
        }

        match current_task.block_code.get(&*lock) {
            ResultCode::Success => Ok(()),
            ResultCode::Timeout => Err(WaitError::Timeout),
            ResultCode::Destroyed => Err(WaitError::Destroyed),
            _ => crate::halt::<Traits>(),
        }
    }

    /// Wake up to `count` waiters ([`WAKE_ALL`] for all of them), most
    /// urgent first. Callable from an interrupt handler; `sync` suppresses
    /// the immediate scheduling point.
    pub fn wake_up(&self, count: usize, sync: bool) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.wake_up_locked(lock.borrow_mut(), count, sync);
    }

    /// [`wake_up`](Self::wake_up) for callers that already hold CPU Lock
    /// (e.g. timer callbacks).
    pub fn wake_up_locked(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        count: usize,
        sync: bool,
    ) {
        if count == 0 {
            return;
        }

        let state = Traits::state();
        let in_isr = state.isr_nesting.load(Ordering::SeqCst) != 0;
        let current_task = task::current(lock.borrow_mut());
        let current_prepared_here =
            core::ptr::eq(current_task.wait_queue.load(Ordering::SeqCst), self);

        // a task cannot wake itself up
        api_assert!(Traits, in_isr || !current_prepared_here);

        let mut remaining = count;

        if in_isr && current_prepared_here {
            // The interrupt preempted the very task that is spinning on this
            // queue's condition. It is not in the task queue (it's still
            // `Running`), so waking it is a matter of clearing the
            // association. This closes the lost-wakeup race for the
            // ISR-notifier case, and saves a context switch to boot.
            current_task
                .wait_queue
                .store(core::ptr::null_mut(), Ordering::SeqCst);
            current_task
                .block_code
                .replace(&mut *lock, ResultCode::Success);
            // otherwise the timer could fire right after the handler returns
            timeout::blocktimer_destroy(lock.borrow_mut(), current_task);

            if remaining != WAKE_ALL {
                remaining -= 1;
            }
        }

        while remaining == WAKE_ALL || remaining > 0 {
            let Some(waiting_task) = self.task_queue.dequeue(lock.borrow_mut()) else {
                break;
            };

            timeout::blocktimer_destroy(lock.borrow_mut(), waiting_task);
            waiting_task
                .wait_queue
                .store(core::ptr::null_mut(), Ordering::SeqCst);
            waiting_task
                .block_code
                .replace(&mut *lock, ResultCode::Success);
            task::make_ready(lock.borrow_mut(), waiting_task);

            if !sync {
                task::schedule(lock.borrow_mut(), true);
            }

            if remaining != WAKE_ALL {
                remaining -= 1;
            }
        }
    }

    /// Destroy the wait queue, waking every waiter with
    /// [`WaitError::Destroyed`].
    ///
    /// Destroying a queue while some task is between `prepare` and `wait` is
    /// a race the application must exclude.
    pub fn destroy(&self) {
        let mut lock = klock::lock_cpu::<Traits>();

        while let Some(waiting_task) = self.task_queue.dequeue(lock.borrow_mut()) {
            timeout::blocktimer_destroy(lock.borrow_mut(), waiting_task);
            waiting_task
                .wait_queue
                .store(core::ptr::null_mut(), Ordering::SeqCst);
            waiting_task
                .block_code
                .replace(&mut *lock, ResultCode::Destroyed);
            task::make_ready(lock.borrow_mut(), waiting_task);
        }

        task::schedule(lock.borrow_mut(), true);
    }
}

impl<Traits: KernelTraits> Default for WaitQueueCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeout callback armed by `prepare_timeout`.
///
/// The timer may fire at any point of the prepare/check/wait sequence, so
/// the task can be `Running` (still checking the condition), `Ready` (the
/// scheduler parked it in the wait queue's task queue), or `Waiting`. A
/// still-`Running` task only has its association cleared; it must not be
/// moved anywhere.
fn timeout_callback<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: the parameter was derived from a task control block reference
    // in `prepare_timeout`
    let waiting_task = unsafe { &*(param as *const TaskCb<Traits>) };

    waiting_task
        .wait_queue
        .store(core::ptr::null_mut(), Ordering::SeqCst);
    waiting_task
        .block_code
        .replace(&mut *lock, ResultCode::Timeout);

    if waiting_task.st.get(&*lock) != TaskSt::Running {
        taskqueue::unlink(lock.borrow_mut(), waiting_task);
        task::make_ready(lock.borrow_mut(), waiting_task);
    }

    lock
}
