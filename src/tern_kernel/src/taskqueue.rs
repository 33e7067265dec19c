//! Priority-ordered task queues.
//!
//! A [`TaskQueue`] is used both as the global ready queue and as the wait
//! list of every synchronization primitive: an array of FIFO buckets, one per
//! priority, and a bitmap with bit *i* set iff bucket *i* is non-empty.
//! Selecting the most urgent task is a single find-last-set on the bitmap.
use core::{fmt, ptr::NonNull};

use crate::{
    klock::CpuLockTokenRefMut,
    task::TaskCb,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static},
        Init, PrioBitmap,
    },
    Buckets, KernelTraits,
};

/// An ordered collection of tasks, segregated by priority.
///
/// Invariant: `buckets[i]` is non-empty ⇔ bit `i` of `bitmap` is set.
pub struct TaskQueue<Traits: KernelTraits> {
    buckets: Traits::BucketArray,
    bitmap: crate::klock::CpuLockCell<Traits, Traits::PrioBitmap>,
}

impl<Traits: KernelTraits> TaskQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const INIT: Self = Self {
        buckets: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<Traits: KernelTraits> Init for TaskQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::INIT;
}

impl<Traits: KernelTraits> fmt::Debug for TaskQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskQueue").finish_non_exhaustive()
    }
}

/// An unchecked reference to the [`TaskQueue`] a task is currently linked
/// into.
///
/// The pointee is only valid while the task is linked; [`unlink`] and the
/// dequeue operations clear the task's copy, which upholds the borrow
/// discipline without tying every wait list to a `'static` primitive (a join
/// semaphore, for example, lives on the joining task's stack).
pub(crate) struct TaskQueueRef<Traits: KernelTraits>(NonNull<TaskQueue<Traits>>);

// Safety: `TaskQueueRef` is a plain pointer; the kernel only dereferences it
// under CPU Lock while the pointee is live
unsafe impl<Traits: KernelTraits> Send for TaskQueueRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for TaskQueueRef<Traits> {}

impl<Traits: KernelTraits> Clone for TaskQueueRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<Traits: KernelTraits> Copy for TaskQueueRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for TaskQueueRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for TaskQueueRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for TaskQueueRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskQueueRef").field(&self.0).finish()
    }
}

impl<Traits: KernelTraits> TaskQueueRef<Traits> {
    pub(crate) fn new(queue: &TaskQueue<Traits>) -> Self {
        Self(NonNull::from(queue))
    }

    /// Dereference the queue reference.
    ///
    /// # Safety
    ///
    /// The pointee must still be live. This holds while any task is linked
    /// into the queue.
    pub(crate) unsafe fn as_ref<'a>(&self) -> &'a TaskQueue<Traits> {
        unsafe { &*self.0.as_ptr() }
    }
}

/// Get a `ListAccessorCell` used to access one priority bucket.
macro_rules! bucket_accessor {
    ($queue:expr, $prio:expr, $key:expr) => {
        ListAccessorCell::new(
            &$queue.buckets[$prio],
            &Static,
            |task: &TaskCb<Traits>| &task.link,
            $key,
        )
    };
}

impl<Traits: KernelTraits> TaskQueue<Traits> {
    /// Append `task` to the bucket of its effective priority and remember
    /// the containing queue in the task.
    ///
    /// The caller must update the task state separately.
    pub(crate) fn enqueue(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
    ) {
        let prio = task.prio_current.get(&*lock) as usize;

        bucket_accessor!(self, prio, lock.borrow_mut()).push_back(Ident(task));
        self.bitmap.write(&mut *lock).set(prio);
        task.task_queue
            .replace(&mut *lock, Some(TaskQueueRef::new(self)));
    }

    fn dequeue_bucket(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prio: usize,
    ) -> &'static TaskCb<Traits> {
        let mut accessor = bucket_accessor!(self, prio, lock.borrow_mut());
        // The bitmap said so, so there must be at least one task
        let Ident(task) = accessor.pop_front().unwrap();
        if accessor.is_empty() {
            self.bitmap.write(&mut *lock).clear(prio);
        }

        task.task_queue.replace(&mut *lock, None);
        task
    }

    /// Remove and return the most urgent task, or `None` if the queue is
    /// empty.
    pub(crate) fn dequeue(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let prio = self.bitmap.read(&*lock).find_last_set()?;
        Some(self.dequeue_bucket(lock, prio))
    }

    /// Like [`Self::dequeue`], but only dequeues when the most urgent task's
    /// priority is `min_prio` or higher.
    pub(crate) fn dequeue_above(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        min_prio: usize,
    ) -> Option<&'static TaskCb<Traits>> {
        let prio = self.bitmap.read(&*lock).find_last_set()?;
        if prio < min_prio {
            return None;
        }
        Some(self.dequeue_bucket(lock, prio))
    }

    /// Get the most urgent task without removing it.
    pub(crate) fn peek(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let prio = self.bitmap.read(&*lock).find_last_set()?;
        let accessor = bucket_accessor!(self, prio, lock.borrow_mut());
        accessor.front().map(|Ident(task)| task)
    }
}

/// Remove `task` from the queue it is currently linked into.
pub(crate) fn unlink<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let queue_ref = task.task_queue.replace(&mut *lock, None);
    self_check_assert!(Traits, queue_ref.is_some());
    let Some(queue_ref) = queue_ref else { return };

    // Safety: `task` is linked into the queue, so it's live
    let queue = unsafe { queue_ref.as_ref() };
    let prio = task.prio_current.get(&*lock) as usize;

    let mut accessor = bucket_accessor!(queue, prio, lock.borrow_mut());
    accessor.remove(Ident(task));
    if accessor.is_empty() {
        queue.bitmap.write(&mut *lock).clear(prio);
    }
}

/// Change the effective priority of `task`, moving it to the new priority
/// bucket if it is linked in a queue. FIFO order within the new bucket is
/// re-established by insertion at the back.
pub(crate) fn reprio<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    new_prio: crate::Priority,
) {
    if task.prio_current.get(&*lock) == new_prio {
        return;
    }

    let queue_ref = task.task_queue.get(&*lock);
    if let Some(queue_ref) = queue_ref {
        unlink(lock.borrow_mut(), task);
        task.prio_current.replace(&mut *lock, new_prio);
        // Safety: the queue was live a moment ago and nothing in between
        // could have invalidated it
        let queue = unsafe { queue_ref.as_ref() };
        queue.enqueue(lock, task);
    } else {
        task.prio_current.replace(&mut *lock, new_prio);
    }
}
