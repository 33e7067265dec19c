//! Context queries and the scheduler lock.
use core::sync::atomic::Ordering;

use crate::{klock, task, KernelTraits, System};

/// `true` when the CPU is executing task code (as opposed to an interrupt
/// handler).
pub(crate) fn in_task_context<Traits: KernelTraits>() -> bool {
    Traits::state().isr_nesting.load(Ordering::SeqCst) == 0
}

impl<Traits: KernelTraits> System<Traits> {
    /// Suppress task switching until the matching
    /// [`scheduler_unlock`](Self::scheduler_unlock). Interrupts stay enabled;
    /// the tick keeps advancing timers.
    ///
    /// Forbidden from an interrupt handler and from the prepared state.
    pub fn scheduler_lock() {
        api_assert!(Traits, in_task_context::<Traits>());
        {
            let mut lock = klock::lock_cpu::<Traits>();
            api_assert!(Traits, !task::prepared(lock.borrow_mut()));
        }

        Traits::state().sched_lock.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo one level of [`scheduler_lock`](Self::scheduler_lock). Unless
    /// `sync` is `true` (the caller promises an imminent scheduling point),
    /// this immediately offers the processor to any higher-priority task
    /// made ready in the meantime.
    pub fn scheduler_unlock(sync: bool) {
        api_assert!(Traits, in_task_context::<Traits>());

        Traits::state().sched_lock.fetch_sub(1, Ordering::SeqCst);

        if !sync {
            let mut lock = klock::lock_cpu::<Traits>();
            api_assert!(Traits, !task::prepared(lock.borrow_mut()));
            task::schedule(lock.borrow_mut(), true);
        }
    }
}
