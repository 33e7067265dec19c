//! Timer-wheel behavior.
#![cfg(unix)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tern_kernel::{klock::CpuLockGuard, SemaphoreCb, System, TaskCb, TaskStack, Timer};

mod one_tick_timer {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WORKER: TaskCb<SystemTraits> = TaskCb::new();
    static WORKER_STACK: TaskStack<16384> = TaskStack::new();

    static TIMER: Timer<SystemTraits> = Timer::new();
    static DONE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);
    static FIRED_AT: AtomicU32 = AtomicU32::new(0);

    fn on_timer(
        _param: usize,
        mut lock: CpuLockGuard<SystemTraits>,
    ) -> CpuLockGuard<SystemTraits> {
        FIRED_AT.store(Sys::ticks_now(), Ordering::SeqCst);
        DONE.signal_locked(lock.borrow_mut(), false);
        lock
    }

    fn worker(_: usize) -> usize {
        // arm first, start the clock second, so no tick can sneak in between
        let armed_at = Sys::ticks_now();
        TIMER.start_static(on_timer, 0, 1, 0);
        tern_port_std::start_tick::<SystemTraits>(Duration::from_micros(200));
        DONE.wait().unwrap();

        // a timeout of 1 fires on the very next tick
        let fired_at = FIRED_AT.load(Ordering::SeqCst);
        assert_eq!(Sys::ticks_diff(armed_at, fired_at), 1);

        // destroying a fired one-shot is allowed, any number of times
        TIMER.destroy();
        TIMER.destroy();

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&WORKER, WORKER_STACK.hunk(), 1, worker, 0);
    }

    #[test]
    fn one_tick_timer() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod many_at_once {
    use super::*;
    use tern_kernel::utils::Init;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WORKER: TaskCb<SystemTraits> = TaskCb::new();
    static WORKER_STACK: TaskStack<16384> = TaskStack::new();

    const TIMER_CNT: usize = 512;

    static TIMERS: [Timer<SystemTraits>; TIMER_CNT] = Init::INIT;
    static DONE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);
    /// The number of timers that fired so far; doubles as the expected
    /// firing order.
    static FIRE_SEQ: AtomicUsize = AtomicUsize::new(0);
    static BASE_TICK: AtomicU32 = AtomicU32::new(0);
    static ORDER_OK: AtomicUsize = AtomicUsize::new(1);

    fn on_timer(
        param: usize,
        mut lock: CpuLockGuard<SystemTraits>,
    ) -> CpuLockGuard<SystemTraits> {
        let seq = FIRE_SEQ.fetch_add(1, Ordering::SeqCst);

        // timer `i` (timeout `i + 1`) must be the `i`-th to fire, exactly on
        // tick `base + i + 1`
        let base = BASE_TICK.load(Ordering::SeqCst);
        let now = Sys::ticks_now();
        if seq != param || Sys::ticks_diff(base, now) != (param as u32 + 1) {
            ORDER_OK.store(0, Ordering::SeqCst);
        }

        if param == TIMER_CNT - 1 {
            DONE.signal_locked(lock.borrow_mut(), false);
        }
        lock
    }

    fn worker(_: usize) -> usize {
        // Arm all 512 one-shot timers with timeouts 1..=512 before the first
        // tick arrives (the tick source is started afterwards).
        BASE_TICK.store(Sys::ticks_now(), Ordering::SeqCst);
        for (i, timer) in TIMERS.iter().enumerate() {
            timer.start_static(on_timer, i, (i + 1) as u32, 0);
        }
        tern_port_std::start_tick::<SystemTraits>(Duration::from_micros(200));

        DONE.wait().unwrap();
        assert_eq!(FIRE_SEQ.load(Ordering::SeqCst), TIMER_CNT);
        assert_eq!(ORDER_OK.load(Ordering::SeqCst), 1, "a timer fired off-schedule");

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&WORKER, WORKER_STACK.hunk(), 1, worker, 0);
    }

    #[test]
    fn many_at_once() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod periodic_reload {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WORKER: TaskCb<SystemTraits> = TaskCb::new();
    static WORKER_STACK: TaskStack<16384> = TaskStack::new();

    static TIMER: Timer<SystemTraits> = Timer::new();
    static DONE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);
    static FIRE_TICKS: std::sync::Mutex<Vec<u32>> = std::sync::Mutex::new(Vec::new());

    const PERIOD: u32 = 3;
    const FIRINGS: usize = 5;

    fn on_timer(
        _param: usize,
        mut lock: CpuLockGuard<SystemTraits>,
    ) -> CpuLockGuard<SystemTraits> {
        let mut fire_ticks = FIRE_TICKS.lock().unwrap();
        fire_ticks.push(Sys::ticks_now());
        if fire_ticks.len() == FIRINGS {
            DONE.signal_locked(lock.borrow_mut(), false);
        }
        lock
    }

    fn worker(_: usize) -> usize {
        let base = Sys::ticks_now();
        TIMER.start_static(on_timer, 0, PERIOD, PERIOD);
        tern_port_std::start_tick::<SystemTraits>(Duration::from_micros(200));
        DONE.wait().unwrap();
        TIMER.destroy();

        let fire_ticks = FIRE_TICKS.lock().unwrap();
        for (i, &tick) in fire_ticks.iter().enumerate() {
            assert_eq!(Sys::ticks_diff(base, tick), PERIOD * (i as u32 + 1));
        }

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&WORKER, WORKER_STACK.hunk(), 1, worker, 0);
    }

    #[test]
    fn periodic_reload() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}

mod destroy_pending {
    use super::*;

    tern_port_std::use_port!(unsafe struct SystemTraits { priority_levels: 5 });
    type Sys = System<SystemTraits>;

    static WORKER: TaskCb<SystemTraits> = TaskCb::new();
    static WORKER_STACK: TaskStack<16384> = TaskStack::new();

    static VICTIM: Timer<SystemTraits> = Timer::new();
    static WITNESS: Timer<SystemTraits> = Timer::new();
    static DONE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);
    static VICTIM_FIRED: AtomicUsize = AtomicUsize::new(0);

    fn on_victim(
        _param: usize,
        lock: CpuLockGuard<SystemTraits>,
    ) -> CpuLockGuard<SystemTraits> {
        VICTIM_FIRED.fetch_add(1, Ordering::SeqCst);
        lock
    }

    fn on_witness(
        _param: usize,
        mut lock: CpuLockGuard<SystemTraits>,
    ) -> CpuLockGuard<SystemTraits> {
        DONE.signal_locked(lock.borrow_mut(), false);
        lock
    }

    fn worker(_: usize) -> usize {
        VICTIM.start_static(on_victim, 0, 2, 0);
        WITNESS.start_static(on_witness, 0, 4, 0);

        // disarm the victim before the clock even starts; double destroy is
        // a no-op
        VICTIM.destroy();
        VICTIM.destroy();
        tern_port_std::start_tick::<SystemTraits>(Duration::from_micros(200));

        DONE.wait().unwrap();
        assert_eq!(VICTIM_FIRED.load(Ordering::SeqCst), 0);

        tern_port_std::shutdown::<SystemTraits>()
    }

    fn app_init() {
        Sys::task_create(&WORKER, WORKER_STACK.hunk(), 1, worker, 0);
    }

    #[test]
    fn destroy_pending() {
        tern_port_std::boot::<SystemTraits>(app_init, || {});
    }
}
