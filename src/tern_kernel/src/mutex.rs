//! Mutexes with recursive locking and priority inheritance.
use core::fmt;

use crate::{
    error::LockError,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state, task,
    task::{BlockReason, TaskCb, TaskSt},
    taskqueue,
    taskqueue::TaskQueue,
    utils::intrusive_list::{Ident, ListAccessorCell, Static, StaticLink},
    KernelTraits, Priority, ResultCode,
};

/// *Mutex control block* — an owner-tracked recursive lock.
///
/// While a task owns the mutex, the mutex is linked into the task's
/// owned-mutex list, which the unlock path scans to recompute the owner's
/// effective priority. Contended locking boosts the owner (and, transitively,
/// whatever task the owner is blocked on) to the waiter's effective priority.
pub struct MutexCb<Traits: KernelTraits> {
    /// Link for the owning task's owned-mutex list.
    pub(crate) link: CpuLockCell<Traits, Option<StaticLink<MutexCb<Traits>>>>,

    owner: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    task_queue: TaskQueue<Traits>,

    /// Recursion level. `0` means unlocked.
    recur: CpuLockCell<Traits, usize>,
}

// Safety: all fields are CPU Lock-guarded
unsafe impl<Traits: KernelTraits> Sync for MutexCb<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

/// Get a `ListAccessorCell` for a task's owned-mutex list.
macro_rules! owned_list_accessor {
    ($task:expr, $key:expr) => {
        ListAccessorCell::new(
            &$task.mtx_list,
            &Static,
            |mutex: &MutexCb<Traits>| &mutex.link,
            $key,
        )
    };
}

impl<Traits: KernelTraits> MutexCb<Traits> {
    pub const fn new() -> Self {
        Self {
            link: CpuLockCell::new(None),
            owner: CpuLockCell::new(None),
            task_queue: TaskQueue::INIT,
            recur: CpuLockCell::new(0),
        }
    }

    fn set_owner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
    ) {
        self.owner.replace(&mut *lock, Some(task));
        // needed for the priority recomputation during unlock
        owned_list_accessor!(task, lock.borrow_mut()).push_back(Ident(self));
        self.recur.replace(&mut *lock, 1);
    }

    fn clear_owner(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let owner = self.owner.replace(&mut *lock, None).unwrap();
        #[cfg(feature = "rev_unlock_order")]
        {
            // unlock order must be the reverse of the locking order
            let last = owned_list_accessor!(owner, lock.borrow_mut()).back();
            api_assert!(Traits, last == Some(Ident(self)));
        }
        owned_list_accessor!(owner, lock.borrow_mut()).remove(Ident(self));
    }

    /// Acquire the mutex, blocking while another task owns it. Acquiring a
    /// mutex the caller already owns increments the recursion level instead.
    pub fn lock(&'static self) -> Result<(), LockError> {
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>();
        let current_task = task::current(lock.borrow_mut());
        // the idle task cannot block
        api_assert!(Traits, current_task.prio_current.get(&*lock) > 0);
        api_assert!(Traits, !task::prepared(lock.borrow_mut()));

        let owner = match self.owner.get(&*lock) {
            None => {
                // unlocked; take ownership
                self.set_owner(lock.borrow_mut(), current_task);
                return Ok(());
            }
            Some(owner) if core::ptr::eq(owner, current_task) => {
                let recur = self.recur.get(&*lock);
                self.recur.replace(&mut *lock, recur + 1);
                return Ok(());
            }
            Some(owner) => owner,
        };

        #[cfg(feature = "priority_inheritance")]
        if owner.prio_current.get(&*lock) < current_task.prio_current.get(&*lock) {
            // Walk the blocking chain, boosting every owner along the way:
            // boosting only this mutex's owner is not enough when that owner
            // is itself blocked on another mutex.
            let mut boosted = owner;
            loop {
                let new_prio = current_task
                    .prio_current
                    .get(&*lock)
                    .max(boosted.prio_current.get(&*lock));
                taskqueue::reprio(lock.borrow_mut(), boosted, new_prio);

                if boosted.st.get(&*lock) == TaskSt::Waiting {
                    if let BlockReason::Mutex(blocking_mutex) = boosted.block_reason.get(&*lock) {
                        if let Some(next_owner) = blocking_mutex.owner.get(&*lock) {
                            boosted = next_owner;
                            continue;
                        }
                    }
                }
                break;
            }
        }
        #[cfg(not(feature = "priority_inheritance"))]
        let _ = owner;

        task::block_and_switch(
            lock.borrow_mut(),
            &self.task_queue,
            BlockReason::Mutex(self),
        );

        // When we come back, the unlocking task has already transferred the
        // ownership to us (or `destroy` has scrapped the mutex).
        match task::current(lock.borrow_mut()).block_code.get(&*lock) {
            ResultCode::Success => Ok(()),
            ResultCode::Destroyed => Err(LockError::Destroyed),
            _ => crate::halt::<Traits>(),
        }
    }

    /// Release the mutex (or leave one recursion level). Ownership is handed
    /// directly to the most urgent waiter, preserving FIFO order within a
    /// priority.
    pub fn unlock(&'static self) {
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>();
        let current_task = task::current(lock.borrow_mut());
        // only the owner can unlock
        api_assert!(
            Traits,
            self.owner
                .get(&*lock)
                .is_some_and(|owner| core::ptr::eq(owner, current_task))
        );

        let recur = self.recur.get(&*lock);
        self_check_assert!(Traits, recur > 0);
        self.recur.replace(&mut *lock, recur - 1);
        if recur > 1 {
            return;
        }

        self.clear_owner(lock.borrow_mut());

        #[cfg(feature = "priority_inheritance")]
        unlock_prio_reset(lock.borrow_mut(), current_task);

        if let Some(waiting_task) = self.task_queue.dequeue(lock.borrow_mut()) {
            self.set_owner(lock.borrow_mut(), waiting_task);
            waiting_task
                .block_code
                .replace(&mut *lock, ResultCode::Success);
            task::make_ready(lock.borrow_mut(), waiting_task);
            task::schedule(lock.borrow_mut(), true);
        }
    }

    /// Destroy the mutex, waking every waiter with [`LockError::Destroyed`].
    /// A locked mutex may only be destroyed by its owner.
    pub fn destroy(&'static self) {
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut lock = klock::lock_cpu::<Traits>();

        if self.owner.get(&*lock).is_some() {
            api_assert!(
                Traits,
                self.owner
                    .get(&*lock)
                    .is_some_and(|owner| core::ptr::eq(owner, task::current(lock.borrow_mut())))
            );

            self.clear_owner(lock.borrow_mut());
            #[cfg(feature = "priority_inheritance")]
            let current_task = task::current(lock.borrow_mut());
            unlock_prio_reset(lock.borrow_mut(), current_task);

            while let Some(waiting_task) = self.task_queue.dequeue(lock.borrow_mut()) {
                waiting_task
                    .block_code
                    .replace(&mut *lock, ResultCode::Destroyed);
                task::make_ready(lock.borrow_mut(), waiting_task);
            }
        }

        self.recur.replace(&mut *lock, 0);
        task::schedule(lock.borrow_mut(), true);
    }
}

impl<Traits: KernelTraits> Default for MutexCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// Recompute the unlocking task's effective priority from its remaining
/// obligations.
///
/// Resetting straight to the base priority would be wrong: the task may
/// still own other mutexes with urgent waiters, whose inherited (not base)
/// priorities must keep counting. The new priority is the supremum of the
/// base priority and the effective priorities of the most urgent waiter of
/// every still-owned mutex.
#[cfg(feature = "priority_inheritance")]
fn unlock_prio_reset<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    current_task: &'static TaskCb<Traits>,
) {
    if current_task.prio_current.get(&*lock) == current_task.prio_base.get(&*lock) {
        return;
    }

    #[cfg(feature = "rev_unlock_order")]
    {
        // With reverse-order unlocking the boost computed at lock time stays
        // valid until the last owned mutex goes away, so the reset can be
        // deferred to that point.
        if current_task.mtx_list.get(&*lock).is_empty() {
            let prio_base = current_task.prio_base.get(&*lock);
            // the current task is `Running`, so no queue needs fixing up
            current_task.prio_current.replace(&mut *lock, prio_base);
        }
    }

    #[cfg(not(feature = "rev_unlock_order"))]
    {
        let mut new_prio: Priority = current_task.prio_base.get(&*lock);

        let mut cursor = {
            let accessor = owned_list_accessor!(current_task, lock.borrow_mut());
            accessor.front()
        };
        while let Some(Ident(owned_mutex)) = cursor {
            if let Some(waiting_task) = owned_mutex.task_queue.peek(lock.borrow_mut()) {
                // The waiter's *effective* priority counts: if it was itself
                // boosted through a nested chain, that boost must propagate.
                new_prio = new_prio.max(waiting_task.prio_current.get(&*lock));
            }
            cursor = {
                let accessor = owned_list_accessor!(current_task, lock.borrow_mut());
                accessor.next(Ident(owned_mutex))
            };
        }

        // the current task is `Running`, so no queue needs fixing up
        current_task.prio_current.replace(&mut *lock, new_prio);
    }
}
