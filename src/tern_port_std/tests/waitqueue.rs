//! Wait-queue protocol behavior.
#![cfg(unix)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tern_kernel::{System, TaskCb, TaskStack, WaitError, WaitQueueCb};

mod notifier_task {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static RECEIVER: TaskCb<SystemTraits> = TaskCb::new();
    static RECEIVER_STACK: TaskStack<4096> = TaskStack::new();
    static NOTIFIER: TaskCb<SystemTraits> = TaskCb::new();
    static NOTIFIER_STACK: TaskStack<4096> = TaskStack::new();
    static SUPERVISOR: TaskCb<SystemTraits> = TaskCb::new();
    static SUPERVISOR_STACK: TaskStack<4096> = TaskStack::new();

    static WQ: WaitQueueCb<SystemTraits> = WaitQueueCb::new();
    static CONDITION: AtomicBool = AtomicBool::new(false);
    static OBSERVED: AtomicUsize = AtomicUsize::new(0);

    const ROUNDS: usize = 100;

    fn receiver(_: usize) -> usize {
        for _ in 0..ROUNDS {
            loop {
                WQ.prepare();
                if CONDITION.swap(false, Ordering::SeqCst) {
                    WQ.finish();
                    OBSERVED.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                WQ.wait().unwrap();
            }
        }
        0
    }

    fn notifier(_: usize) -> usize {
        for _ in 0..ROUNDS {
            CONDITION.store(true, Ordering::SeqCst);
            WQ.wake_up(1, false);
            // let the (equal-priority) receiver consume it
            Sys::yield_now();
        }
        0
    }

    fn supervisor(_: usize) -> usize {
        Sys::task_join(&RECEIVER);
        Sys::task_join(&NOTIFIER);
        assert_eq!(OBSERVED.load(Ordering::SeqCst), ROUNDS);
        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&RECEIVER, RECEIVER_STACK.hunk(), 1, receiver, 0);
        Sys::task_create(&NOTIFIER, NOTIFIER_STACK.hunk(), 1, notifier, 0);
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 2, supervisor, 0);
    }

    #[test]
    fn notifier_task() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod lost_wakeup_resistance {
    use super::*;
    use tern_kernel::{klock::CpuLockGuard, Timer};

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static RECEIVER: TaskCb<SystemTraits> = TaskCb::new();
    static RECEIVER_STACK: TaskStack<16384> = TaskStack::new();

    static WQ: WaitQueueCb<SystemTraits> = WaitQueueCb::new();
    static TIMER: Timer<SystemTraits> = Timer::new();
    static CONDITION: AtomicBool = AtomicBool::new(false);
    static SENT: AtomicUsize = AtomicUsize::new(0);
    static OBSERVED: AtomicUsize = AtomicUsize::new(0);

    const ROUNDS: usize = 2000;

    /// The notifier, firing from the tick interrupt while the receiver spins
    /// through prepare/check/wait. Skips a beat when the previous
    /// notification has not been consumed yet, so every notification is
    /// observable exactly once.
    fn on_timer(
        _param: usize,
        mut lock: CpuLockGuard<SystemTraits>,
    ) -> CpuLockGuard<SystemTraits> {
        if !CONDITION.swap(true, Ordering::SeqCst) {
            SENT.fetch_add(1, Ordering::SeqCst);
        }
        WQ.wake_up_locked(lock.borrow_mut(), 1, false);
        lock
    }

    fn receiver(_: usize) -> usize {
        TIMER.start_static(on_timer, 0, 1, 1);

        while OBSERVED.load(Ordering::SeqCst) < ROUNDS {
            WQ.prepare();
            if CONDITION.swap(false, Ordering::SeqCst) {
                WQ.finish();
                OBSERVED.fetch_add(1, Ordering::SeqCst);
            } else {
                WQ.wait().unwrap();
            }
        }

        TIMER.destroy();

        let sent = SENT.load(Ordering::SeqCst);
        let observed = OBSERVED.load(Ordering::SeqCst);
        // every notification sent was observed, save for at most one still
        // in flight when we stopped
        assert!(
            sent == observed || sent == observed + 1,
            "sent {sent}, observed {observed}"
        );

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&RECEIVER, RECEIVER_STACK.hunk(), 1, receiver, 0);
        tern_port_std::start_tick::<SystemTraits>(Duration::from_micros(100));
    }

    #[test]
    fn lost_wakeup_resistance() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod preempted_while_prepared {
    use super::*;
    use tern_kernel::SemaphoreCb;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static RECEIVER: TaskCb<SystemTraits> = TaskCb::new();
    static RECEIVER_STACK: TaskStack<4096> = TaskStack::new();
    static NOTIFIER: TaskCb<SystemTraits> = TaskCb::new();
    static NOTIFIER_STACK: TaskStack<4096> = TaskStack::new();
    static SUPERVISOR: TaskCb<SystemTraits> = TaskCb::new();
    static SUPERVISOR_STACK: TaskStack<4096> = TaskStack::new();

    static WQ: WaitQueueCb<SystemTraits> = WaitQueueCb::new();
    static WAKE_NOTIFIER: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);
    static CONDITION: AtomicBool = AtomicBool::new(false);
    static OBSERVED: AtomicUsize = AtomicUsize::new(0);

    fn receiver(_: usize) -> usize {
        loop {
            WQ.prepare();
            // The higher-priority notifier preempts us right here, while we
            // are prepared but not yet waiting. The scheduler must park us
            // in the wait queue's task queue, where the notifier's wakeup
            // finds us; we then observe the condition without ever blocking.
            WAKE_NOTIFIER.signal();
            if CONDITION.swap(false, Ordering::SeqCst) {
                WQ.finish();
                OBSERVED.fetch_add(1, Ordering::SeqCst);
                break;
            }
            WQ.wait().unwrap();
        }
        0
    }

    fn notifier(_: usize) -> usize {
        WAKE_NOTIFIER.wait().unwrap();
        CONDITION.store(true, Ordering::SeqCst);
        WQ.wake_up(1, false);
        0
    }

    fn supervisor(_: usize) -> usize {
        Sys::task_join(&RECEIVER);
        Sys::task_join(&NOTIFIER);
        assert_eq!(OBSERVED.load(Ordering::SeqCst), 1);
        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&RECEIVER, RECEIVER_STACK.hunk(), 1, receiver, 0);
        Sys::task_create(&NOTIFIER, NOTIFIER_STACK.hunk(), 2, notifier, 0);
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 3, supervisor, 0);
    }

    #[test]
    fn preempted_while_prepared() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod wait_timeout {
    use super::*;
    use core::pin::pin;
    use tern_kernel::WaitObj;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WORKER: TaskCb<SystemTraits> = TaskCb::new();
    static WORKER_STACK: TaskStack<16384> = TaskStack::new();

    static WQ: WaitQueueCb<SystemTraits> = WaitQueueCb::new();

    fn worker(_: usize) -> usize {
        // nobody ever signals; the prepared wait must end in a timeout
        let start = Sys::ticks_now();
        let wait_obj = pin!(WaitObj::new());
        WQ.prepare_timeout(wait_obj.as_ref(), 5);
        match WQ.wait() {
            Err(WaitError::Timeout) => {}
            other => panic!("unexpected wait result: {other:?}"),
        }
        assert!(Sys::ticks_diff(start, Sys::ticks_now()) >= 5);

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&WORKER, WORKER_STACK.hunk(), 1, worker, 0);
        tern_port_std::start_tick::<SystemTraits>(Duration::from_micros(200));
    }

    #[test]
    fn wait_timeout() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod wake_all {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WAITERS: [TaskCb<SystemTraits>; 3] =
        [TaskCb::new(), TaskCb::new(), TaskCb::new()];
    static WAITER_STACKS: [TaskStack<4096>; 3] =
        [TaskStack::new(), TaskStack::new(), TaskStack::new()];
    static NOTIFIER: TaskCb<SystemTraits> = TaskCb::new();
    static NOTIFIER_STACK: TaskStack<4096> = TaskStack::new();
    static SUPERVISOR: TaskCb<SystemTraits> = TaskCb::new();
    static SUPERVISOR_STACK: TaskStack<4096> = TaskStack::new();

    static WQ: WaitQueueCb<SystemTraits> = WaitQueueCb::new();
    static CONDITION: AtomicBool = AtomicBool::new(false);
    static WOKEN: AtomicUsize = AtomicUsize::new(0);

    fn waiter(_: usize) -> usize {
        loop {
            WQ.prepare();
            if CONDITION.load(Ordering::SeqCst) {
                WQ.finish();
                break;
            }
            WQ.wait().unwrap();
        }
        WOKEN.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn notifier(_: usize) -> usize {
        // all three waiters are blocked by now (they ran before us)
        CONDITION.store(true, Ordering::SeqCst);
        WQ.wake_up(tern_kernel::WAKE_ALL, false);
        0
    }

    fn supervisor(_: usize) -> usize {
        for waiter_cb in &WAITERS {
            Sys::task_join(waiter_cb);
        }
        Sys::task_join(&NOTIFIER);
        assert_eq!(WOKEN.load(Ordering::SeqCst), 3);
        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        for (waiter_cb, stack) in WAITERS.iter().zip(&WAITER_STACKS) {
            Sys::task_create(waiter_cb, stack.hunk(), 1, waiter, 0);
        }
        Sys::task_create(&NOTIFIER, NOTIFIER_STACK.hunk(), 1, notifier, 0);
        Sys::task_create(&SUPERVISOR, SUPERVISOR_STACK.hunk(), 2, supervisor, 0);
    }

    #[test]
    fn wake_all() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}
