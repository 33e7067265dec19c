//! Counting semaphores.
use core::pin::pin;

use crate::{
    error::DownError,
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, task,
    task::{BlockReason, TaskCb, TaskSt},
    taskqueue::TaskQueue,
    timeout::{self, Timer},
    KernelTraits, ResultCode, Ticks,
};

/// The semaphore counter saturates one below the counter type's maximum.
const VALUE_MAX: usize = usize::MAX - 1;

/// *Semaphore control block* — a counting semaphore.
///
/// The classic signaling primitive: `wait` consumes one permit, possibly
/// blocking; `signal` deposits one, waking the most urgent waiter if any.
/// `signal` is ISR-safe, which makes the semaphore the usual channel between
/// interrupt handlers and tasks.
pub struct SemaphoreCb<Traits: KernelTraits> {
    task_queue: TaskQueue<Traits>,
    value: CpuLockCell<Traits, usize>,
}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    pub const fn new(initial_value: usize) -> Self {
        Self {
            task_queue: TaskQueue::INIT,
            value: CpuLockCell::new(initial_value),
        }
    }

    /// Get the current counter value. Only useful for diagnostics; the value
    /// may be stale by the time the caller looks at it.
    pub fn value(&self) -> usize {
        let lock = klock::lock_cpu::<Traits>();
        self.value.get(&*lock)
    }

    /// Consume one permit, blocking until one is available.
    pub fn wait(&self) -> Result<(), DownError> {
        self.down(None)
    }

    /// Consume one permit, blocking for at most `timeout_ticks` ticks.
    pub fn wait_timeout(&self, timeout_ticks: Ticks) -> Result<(), DownError> {
        self.down(Some(timeout_ticks))
    }

    fn down(&self, timeout: Option<Ticks>) -> Result<(), DownError> {
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>();
        // the idle task cannot block
        api_assert!(
            Traits,
            task::current(lock.borrow_mut()).prio_current.get(&*lock) > 0
        );
        api_assert!(Traits, !task::prepared(lock.borrow_mut()));

        match wait_inner(lock.borrow_mut(), self, timeout) {
            ResultCode::Success => Ok(()),
            ResultCode::Timeout => Err(DownError::Timeout),
            ResultCode::Destroyed => Err(DownError::Destroyed),
            _ => crate::halt::<Traits>(),
        }
    }

    /// Consume one permit only if that requires no blocking.
    pub fn poll(&self) -> Result<(), DownError> {
        let mut lock = klock::lock_cpu::<Traits>();
        let value = self.value.get(&*lock);
        if value > 0 {
            self.value.replace(&mut *lock, value - 1);
            Ok(())
        } else {
            Err(DownError::WouldBlock)
        }
    }

    /// Deposit one permit, waking the most urgent waiter if there is one.
    /// Callable from an interrupt handler.
    pub fn signal(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.signal_locked(lock.borrow_mut(), false);
    }

    /// Like [`signal`](Self::signal), but without an immediate scheduling
    /// point: the caller promises to reach one soon (the woken task stays
    /// `Ready` until then).
    pub fn signal_sync(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.signal_locked(lock.borrow_mut(), true);
    }

    /// [`signal`](Self::signal) for callers that already hold CPU Lock
    /// (e.g. timer callbacks).
    pub fn signal_locked(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, sync: bool) {
        // the counter must not overflow
        api_assert!(Traits, self.value.get(&*lock) < VALUE_MAX);

        if let Some(waiting_task) = self.task_queue.dequeue(lock.borrow_mut()) {
            // Destroy the guard timer first; otherwise it could fire right
            // after the critical section ends.
            timeout::blocktimer_destroy(lock.borrow_mut(), waiting_task);

            waiting_task
                .block_code
                .replace(&mut *lock, ResultCode::Success);
            task::make_ready(lock.borrow_mut(), waiting_task);

            if !sync {
                task::schedule(lock.borrow_mut(), true);
            }
        } else {
            let value = self.value.get(&*lock);
            self.value.replace(&mut *lock, value + 1);
        }
    }

    /// Destroy the semaphore, waking every waiter with
    /// [`DownError::Destroyed`] and scrubbing the counter. The semaphore must
    /// be re-created before reuse.
    pub fn destroy(&self) {
        let mut lock = klock::lock_cpu::<Traits>();

        while let Some(waiting_task) = self.task_queue.dequeue(lock.borrow_mut()) {
            timeout::blocktimer_destroy(lock.borrow_mut(), waiting_task);
            waiting_task
                .block_code
                .replace(&mut *lock, ResultCode::Destroyed);
            task::make_ready(lock.borrow_mut(), waiting_task);
        }

        self.value.replace(&mut *lock, 0);

        // the destroyer may be outranked by a task it just woke
        task::schedule(lock.borrow_mut(), true);
    }
}

/// The core of the wait operation, shared with `task_join` (which blocks on
/// a stack-allocated semaphore while already holding CPU Lock).
///
/// Returns the reason the wait ended.
pub(crate) fn wait_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &SemaphoreCb<Traits>,
    timeout: Option<Ticks>,
) -> ResultCode {
    let value = sem.value.get(&*lock);
    if value > 0 {
        sem.value.replace(&mut *lock, value - 1);
        return ResultCode::Success;
    }

    let current_task = task::current(lock.borrow_mut());

    let timer = pin!(Timer::new());
    if let Some(timeout_ticks) = timeout {
        timeout::blocktimer_create(
            lock.borrow_mut(),
            timer.as_ref(),
            timeout_callback::<Traits>,
            current_task,
            timeout_ticks,
        );
    }

    task::block_and_switch(lock.borrow_mut(), &sem.task_queue, BlockReason::Sem);

    // We return here when `signal`, the timeout or `destroy` wakes us up.
    timeout::blocktimer_destroy(lock.borrow_mut(), current_task);

    current_task.block_code.get(&*lock)
}

/// Timeout callback for `wait_timeout`. Runs in tick-interrupt context; the
/// context switch to the woken task is left to the tick epilogue.
fn timeout_callback<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: the parameter was derived from a task control block reference
    // in `wait_inner`
    let waiting_task = unsafe { &*(param as *const TaskCb<Traits>) };

    self_check_assert!(Traits, waiting_task.st.get(&*lock) == TaskSt::Waiting);

    crate::taskqueue::unlink(lock.borrow_mut(), waiting_task);
    waiting_task
        .block_code
        .replace(&mut *lock, ResultCode::Timeout);
    task::make_ready(lock.borrow_mut(), waiting_task);

    lock
}
