//! Semaphore behavior.
#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tern_kernel::{DownError, SemaphoreCb, System, TaskCb, TaskStack};

mod ping_pong {
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

    // `SEM_A` starts with one permit to get the rally going.
    static SEM_A: SemaphoreCb<SystemTraits> = SemaphoreCb::new(1);
    static SEM_B: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);
    static COUNTERS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

    fn player_a(_: usize) -> usize {
        for _ in 0..ROUNDS {
            SEM_A.wait().unwrap();
            COUNTERS[0].fetch_add(1, Ordering::SeqCst);
            SEM_B.signal();
        }
        0
    }

    fn player_b(_: usize) -> usize {
        for _ in 0..ROUNDS {
            SEM_B.wait().unwrap();
            COUNTERS[1].fetch_add(1, Ordering::SeqCst);
            SEM_A.signal();
        }
        0
    }

    fn supervisor(_: usize) -> usize {
        Sys::task_join(&TASK_A);
        Sys::task_join(&TASK_B);
        assert_eq!(COUNTERS[0].load(Ordering::SeqCst), ROUNDS);
        assert_eq!(COUNTERS[1].load(Ordering::SeqCst), ROUNDS);
        // the last signal had no waiter left, so it went into the counter
        assert_eq!(SEM_A.value(), 1);
        assert_eq!(SEM_B.value(), 0);
        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&TASK_A, STACK_A.hunk(), 1, player_a, 0);
        Sys::task_create(&TASK_B, STACK_B.hunk(), 1, player_b, 0);
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 2, supervisor, 0);
    }

    #[test]
    fn ping_pong() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod poll_and_counter_laws {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WORKER: TaskCb<SystemTraits> = TaskCb::new();
    static WORKER_STACK: TaskStack<4096> = TaskStack::new();

    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);

    fn worker(_: usize) -> usize {
        // `poll` on an empty semaphore does not block
        assert_eq!(SEM.poll(), Err(DownError::WouldBlock));

        // signal-then-wait with no waiters leaves the counter unchanged
        let before = SEM.value();
        SEM.signal();
        SEM.wait().unwrap();
        assert_eq!(SEM.value(), before);

        SEM.signal();
        SEM.signal();
        assert_eq!(SEM.value(), 2);
        assert_eq!(SEM.poll(), Ok(()));
        assert_eq!(SEM.value(), 1);
        assert_eq!(SEM.poll(), Ok(()));
        assert_eq!(SEM.poll(), Err(DownError::WouldBlock));

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&WORKER, WORKER_STACK.hunk(), 1, worker, 0);
    }

    #[test]
    fn poll_and_counter_laws() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod wait_timeout_expires {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WORKER: TaskCb<SystemTraits> = TaskCb::new();
    static WORKER_STACK: TaskStack<16384> = TaskStack::new();

    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);

    fn worker(_: usize) -> usize {
        let start = Sys::ticks_now();
        assert_eq!(SEM.wait_timeout(5), Err(DownError::Timeout));
        let elapsed = Sys::ticks_diff(start, Sys::ticks_now());
        assert!(elapsed >= 5, "woke up after {elapsed} ticks");

        // a permit deposited before the wait prevents the timeout
        SEM.signal();
        assert_eq!(SEM.wait_timeout(5), Ok(()));

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&WORKER, WORKER_STACK.hunk(), 1, worker, 0);
        tern_port_std::start_tick::<SystemTraits>(Duration::from_micros(200));
    }

    #[test]
    fn wait_timeout_expires() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod signal_from_isr {
    use super::*;
    use tern_kernel::Timer;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WORKER: TaskCb<SystemTraits> = TaskCb::new();
    static WORKER_STACK: TaskStack<16384> = TaskStack::new();

    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);
    static TIMER: Timer<SystemTraits> = Timer::new();
    static FIRED: AtomicUsize = AtomicUsize::new(0);

    const ROUNDS: usize = 50;

    fn on_timer(
        _param: usize,
        mut lock: tern_kernel::klock::CpuLockGuard<SystemTraits>,
    ) -> tern_kernel::klock::CpuLockGuard<SystemTraits> {
        FIRED.fetch_add(1, Ordering::SeqCst);
        SEM.signal_locked(lock.borrow_mut(), false);
        lock
    }

    fn worker(_: usize) -> usize {
        TIMER.start_static(on_timer, 0, 1, 1);
        for _ in 0..ROUNDS {
            SEM.wait().unwrap();
        }
        TIMER.destroy();
        assert!(FIRED.load(Ordering::SeqCst) >= ROUNDS);
        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&WORKER, WORKER_STACK.hunk(), 1, worker, 0);
        tern_port_std::start_tick::<SystemTraits>(Duration::from_micros(200));
    }

    #[test]
    fn signal_from_isr() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod destroy_wakes_waiters {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WAITER: TaskCb<SystemTraits> = TaskCb::new();
    static WAITER_STACK: TaskStack<4096> = TaskStack::new();
    static DESTROYER: TaskCb<SystemTraits> = TaskCb::new();
    static DESTROYER_STACK: TaskStack<4096> = TaskStack::new();
    static SUPERVISOR: TaskCb<SystemTraits> = TaskCb::new();
    static SUPERVISOR_STACK: TaskStack<4096> = TaskStack::new();

    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);

    fn waiter(_: usize) -> usize {
        assert_eq!(SEM.wait(), Err(DownError::Destroyed));
        1
    }

    fn destroyer(_: usize) -> usize {
        // the waiter ran first (same priority, FIFO) and is now blocked
        SEM.destroy();
        2
    }

    fn supervisor(_: usize) -> usize {
        assert_eq!(Sys::task_join(&WAITER), 1);
        assert_eq!(Sys::task_join(&DESTROYER), 2);
        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&WAITER, WAITER_STACK.hunk(), 1, waiter, 0);
        Sys::task_create(&DESTROYER, DESTROYER_STACK.hunk(), 1, destroyer, 0);
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 2, supervisor, 0);
    }

    #[test]
    fn destroy_wakes_waiters() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}
