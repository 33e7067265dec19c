//! Scheduler behavior: boot, task lifecycle, yield fairness, preemption.
#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tern_kernel::{System, TaskCb, TaskStack};

mod boot_and_join {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static TASK: TaskCb<SystemTraits> = TaskCb::new();
    static STACK: TaskStack<4096> = TaskStack::new();
    static SUPERVISOR: TaskCb<SystemTraits> = TaskCb::new();
    static SUPERVISOR_STACK: TaskStack<4096> = TaskStack::new();

    static BODY_RAN: AtomicUsize = AtomicUsize::new(0);

    fn body(param: usize) -> usize {
        BODY_RAN.store(1, Ordering::SeqCst);
        param.wrapping_mul(3)
    }

    fn supervisor(_: usize) -> usize {
        let ret = Sys::task_join(&TASK);
        assert_eq!(ret, 42);
        assert_eq!(BODY_RAN.load(Ordering::SeqCst), 1);

        // The stack tripwire must be intact (the simulator never executes on
        // the stack region, so this exercises the bookkeeping).
        Sys::task_check(&TASK);

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&TASK, STACK.hunk(), 1, body, 14);
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 2, supervisor, 0);
    }

    #[test]
    fn boot_and_join() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
        assert_eq!(BODY_RAN.load(Ordering::SeqCst), 1);
    }
}

mod task_recycle {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static TASK: TaskCb<SystemTraits> = TaskCb::new();
    static STACK: TaskStack<4096> = TaskStack::new();
    static SUPERVISOR: TaskCb<SystemTraits> = TaskCb::new();
    static SUPERVISOR_STACK: TaskStack<4096> = TaskStack::new();

    fn body(param: usize) -> usize {
        param + 1
    }

    fn supervisor(_: usize) -> usize {
        // A joined task's control block can back a brand-new task.
        for generation in 0..3 {
            Sys::task_create(&TASK, STACK.hunk(), 1, body, generation);
            assert_eq!(Sys::task_join(&TASK), generation + 1);
        }
        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 2, supervisor, 0);
    }

    #[test]
    fn task_recycle() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod yield_fairness {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new();
    static STACK_A: TaskStack<4096> = TaskStack::new();
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new();
    static STACK_B: TaskStack<4096> = TaskStack::new();
    static SUPERVISOR: TaskCb<SystemTraits> = TaskCb::new();
    static SUPERVISOR_STACK: TaskStack<4096> = TaskStack::new();

    const ROUNDS: usize = 100;

    static COUNTERS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];
    /// Who incremented last; `usize::MAX` means nobody yet.
    static LAST: AtomicUsize = AtomicUsize::new(usize::MAX);

    fn body(me: usize) -> usize {
        for _ in 0..ROUNDS {
            let prev = LAST.swap(me, Ordering::SeqCst);
            // strict alternation between the two equal-priority tasks
            assert_ne!(prev, me, "two consecutive turns for the same task");
            COUNTERS[me].fetch_add(1, Ordering::SeqCst);
            Sys::yield_now();
        }
        0
    }

    fn supervisor(_: usize) -> usize {
        Sys::task_join(&TASK_A);
        Sys::task_join(&TASK_B);
        assert_eq!(COUNTERS[0].load(Ordering::SeqCst), ROUNDS);
        assert_eq!(COUNTERS[1].load(Ordering::SeqCst), ROUNDS);
        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&TASK_A, STACK_A.hunk(), 1, body, 0);
        Sys::task_create(&TASK_B, STACK_B.hunk(), 1, body, 1);
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 2, supervisor, 0);
    }

    #[test]
    fn yield_fairness() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod preemptive_tick {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new();
    static STACK_A: TaskStack<4096> = TaskStack::new();
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new();
    static STACK_B: TaskStack<4096> = TaskStack::new();
    static SUPERVISOR: TaskCb<SystemTraits> = TaskCb::new();
    static SUPERVISOR_STACK: TaskStack<4096> = TaskStack::new();

    const TARGET: usize = 1_000_000;

    static COUNTERS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

    fn busy(me: usize) -> usize {
        // No kernel calls in the loop: only the preemptive tick can take the
        // processor away from us.
        while COUNTERS[me].fetch_add(1, Ordering::SeqCst) + 1 < TARGET {}
        0
    }

    fn supervisor(_: usize) -> usize {
        let start_ticks = Sys::ticks_now();
        Sys::task_join(&TASK_A);
        Sys::task_join(&TASK_B);

        assert_eq!(COUNTERS[0].load(Ordering::SeqCst), TARGET);
        assert_eq!(COUNTERS[1].load(Ordering::SeqCst), TARGET);
        // both finished, so the tick demonstrably preempted the busy loops
        assert!(Sys::ticks_diff(start_ticks, Sys::ticks_now()) > 0);

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&TASK_A, STACK_A.hunk(), 1, busy, 0);
        Sys::task_create(&TASK_B, STACK_B.hunk(), 1, busy, 1);
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 2, supervisor, 0);
        tern_port_std::start_tick::<SystemTraits>(Duration::from_millis(1));
    }

    #[test]
    fn preemptive_tick() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
        let total = COUNTERS[0].load(Ordering::SeqCst) + COUNTERS[1].load(Ordering::SeqCst);
        assert_eq!(total, 2 * TARGET);
    }
}

mod scheduler_lock_blocks_preemption {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static LOW: TaskCb<SystemTraits> = TaskCb::new();
    static LOW_STACK: TaskStack<4096> = TaskStack::new();
    static HIGH: TaskCb<SystemTraits> = TaskCb::new();
    static HIGH_STACK: TaskStack<4096> = TaskStack::new();
    static SUPERVISOR: TaskCb<SystemTraits> = TaskCb::new();
    static SUPERVISOR_STACK: TaskStack<4096> = TaskStack::new();

    static SEM: tern_kernel::SemaphoreCb<SystemTraits> = tern_kernel::SemaphoreCb::new(0);
    static MARKER: AtomicUsize = AtomicUsize::new(0);

    fn low(_: usize) -> usize {
        Sys::scheduler_lock();
        // Waking the high-priority task must not switch while the scheduler
        // lock is held.
        SEM.signal();
        assert_eq!(MARKER.load(Ordering::SeqCst), 0);
        MARKER.store(1, Ordering::SeqCst);
        Sys::scheduler_unlock(false);
        // Now the high-priority task must have run.
        assert_eq!(MARKER.load(Ordering::SeqCst), 2);
        0
    }

    fn high(_: usize) -> usize {
        SEM.wait().unwrap();
        assert_eq!(MARKER.load(Ordering::SeqCst), 1);
        MARKER.store(2, Ordering::SeqCst);
        0
    }

    fn supervisor(_: usize) -> usize {
        Sys::task_join(&HIGH);
        Sys::task_join(&LOW);
        assert_eq!(MARKER.load(Ordering::SeqCst), 2);
        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        // `high` blocks on the semaphore first, then `low` does its thing
        Sys::task_create(&HIGH, HIGH_STACK.hunk(), 2, high, 0);
        Sys::task_create(&LOW, LOW_STACK.hunk(), 1, low, 0);
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 3, supervisor, 0);
    }

    #[test]
    fn scheduler_lock_blocks_preemption() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}
