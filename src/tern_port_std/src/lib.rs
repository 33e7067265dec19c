//! Simulation environment for running the *tern* kernel on a hosted POSIX
//! system.
//!
//! Each kernel task is backed by an OS thread, but a user-mode scheduler
//! ([`ums`]) lets only one of them run at a time, which preserves the
//! kernel's single-CPU semantics. Preemption is real: a timer thread pends
//! the tick interrupt and force-parks the running worker through a POSIX
//! signal, so even a task spinning in a busy loop is preempted, exactly like
//! on bare metal.
//!
//! The port maps the kernel's port interface as follows:
//!
//! | kernel concept      | simulator implementation                        |
//! |---------------------|-------------------------------------------------|
//! | CPU Lock            | a flag; pended interrupts wait for it to clear  |
//! | context switch      | unpark the next task's thread, park our own      |
//! | interrupt entry     | remote-park the running thread, run the handler  |
//! |                     | on a dedicated interrupt thread                  |
//! | idle relaxation     | a short sleep                                    |
//! | halt                | a panic, which fails the enclosing test          |
#![cfg(unix)]

use std::{
    sync::{mpsc, Once},
    time::Duration,
};

use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;

use tern_kernel::{KernelTraits, System, TaskCb};

mod sched;
mod threading;
pub mod ums;

/// Used by `use_port!`.
#[doc(hidden)]
pub use tern_kernel;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance: KernelTraits<PortTaskState = TaskState> {
    fn port_state() -> &'static State;
}

/// Task state machine, as seen by the port.
///
/// These don't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Tsm {
    /// The task's context state is not initialized. The kernel has to call
    /// `initialize_task_state` first before switching to this task.
    Uninit,
    /// The task's context state is initialized but hasn't started running;
    /// a worker thread is spawned on the first switch to it.
    Dormant,
    /// The task is backed by the given worker thread.
    Running(ums::ThreadId),
}

/// The port's per-task state.
#[derive(Debug)]
pub struct TaskState {
    /// Guarded by a spinlock because it's only ever contended for a moment;
    /// the real mutual exclusion comes from the thread-group lock.
    tsm: SpinMutex<Tsm>,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

enum TimerCmd {
    SetPeriod(Duration),
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety contracts of this type's methods, see the corresponding
/// methods of [`tern_kernel::KernelTraits`].
#[doc(hidden)]
pub struct State {
    thread_group: OnceCell<ums::ThreadGroup<sched::SchedState>>,
    timer_cmd_send: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            thread_group: OnceCell::new(),
            timer_cmd_send: SpinMutex::new(None),
        }
    }

    fn group(&self) -> &ums::ThreadGroup<sched::SchedState> {
        self.thread_group.get().expect("kernel is not booted")
    }

    /// Initialize the user-mode scheduling system and boot the kernel.
    ///
    /// Returns when [`shutdown`] is called from inside the simulated system.
    pub fn port_boot<Traits: PortInstance>(&'static self, app_init: fn(), app_idle: fn()) {
        install_panic_hook();
        let _ = env_logger::builder().is_test(true).try_init();

        let (thread_group, join_handle) = ums::ThreadGroup::new(sched::SchedState::new());
        self.thread_group
            .set(thread_group)
            .ok()
            .expect("already booted");

        // Start the timer thread, which will drive the tick interrupt once
        // `app_init` configures a period.
        let (timer_cmd_send, timer_cmd_recv) = mpsc::channel();
        *self.timer_cmd_send.lock() = Some(timer_cmd_send);
        log::trace!("starting the timer thread");
        let timer_join_handle = std::thread::spawn(move || {
            let mut period = None;
            loop {
                let recv_result = if let Some(period) = period {
                    timer_cmd_recv.recv_timeout(period)
                } else {
                    timer_cmd_recv
                        .recv()
                        .map_err(|_| mpsc::RecvTimeoutError::Disconnected)
                };
                match recv_result {
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        pend_tick_from_outside::<Traits>();
                    }
                    Ok(TimerCmd::SetPeriod(new_period)) => period = Some(new_period),
                }
            }
            log::trace!("timer thread exiting");
        });

        {
            let mut lock = self.group().lock();

            // The worker on which every interrupt handler runs.
            let isr_thread = lock.spawn(|_| isr_thread_body::<Traits>());
            lock.scheduler().isr_thread = Some(isr_thread);

            // The worker that becomes the kernel's idle task.
            let boot_thread = lock.spawn(move |thread_id| {
                let idle_task = Traits::state().idle_task();
                *idle_task.port_task_state.tsm.lock() = Tsm::Running(thread_id);

                log::trace!("booting the kernel on {thread_id:?}");
                // Safety: we are the port; this context becomes the idle task
                unsafe { System::<Traits>::boot(app_init, app_idle) }
            });
            lock.scheduler().task_thread = Some(boot_thread);
            lock.preempt();
        }

        // Wait until the simulated system shuts down.
        let result = join_handle.join();

        // Stop the timer thread. `recv` will fail when we drop the sender.
        log::trace!("stopping the timer thread");
        *self.timer_cmd_send.lock() = None;
        timer_join_handle.join().unwrap();

        // Propagate any panic that occurred in a worker thread.
        if let Err(e) = result {
            std::panic::resume_unwind(e);
        }
    }

    pub unsafe fn try_enter_cpu_lock<Traits: PortInstance>(&self) -> bool {
        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        if sched.cpu_lock {
            false
        } else {
            sched.cpu_lock = true;
            true
        }
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&self) {
        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        debug_assert!(sched.cpu_lock);
        sched.cpu_lock = false;

        // Interrupt delivery was held back by the CPU Lock; take any pended
        // one now. Skipped during unwinding so a failing assertion inside a
        // task can propagate instead of getting the thread parked.
        let deliver =
            lock.scheduler().can_take_interrupt() && !lock.is_panicking() && !std::thread::panicking();
        drop(lock);
        if deliver {
            ums::yield_now();
        }
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        self.group().lock().scheduler().cpu_lock
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(&self, task: &'static TaskCb<Traits>) {
        log::trace!("initialize_task_state {task:p}");
        let mut tsm = task.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Dormant => {}
            Tsm::Uninit => *tsm = Tsm::Dormant,
            Tsm::Running(_) => panic!("reinitializing a live task is not supported"),
        }
    }

    pub unsafe fn context_switch<Traits: PortInstance>(&self, next: &'static TaskCb<Traits>) {
        log::trace!("context_switch -> {next:p}");
        let mut lock = self.group().lock();
        debug_assert!(lock.scheduler().cpu_lock);
        let thread = resolve_task_thread::<Traits>(&mut lock, next);
        lock.scheduler().task_thread = Some(thread);
        drop(lock);

        // Park ourselves; we resume when another context switches back.
        ums::yield_now();
    }

    pub unsafe fn context_switch_exit<Traits: PortInstance>(
        &self,
        exiting: &'static TaskCb<Traits>,
        next: &'static TaskCb<Traits>,
    ) -> ! {
        log::trace!("context_switch_exit {exiting:p} -> {next:p}");
        let mut lock = self.group().lock();
        let thread = resolve_task_thread::<Traits>(&mut lock, next);
        lock.scheduler().task_thread = Some(thread);

        // Dissociate the dying task from its worker thread so that a future
        // `task_create` on the same control block gets a fresh one.
        *exiting.port_task_state.tsm.lock() = Tsm::Uninit;
        drop(lock);

        ums::exit_thread()
    }

    pub unsafe fn idle<Traits: PortInstance>(&self) {
        // Relax; the tick will preempt us whenever something is due.
        std::thread::sleep(Duration::from_micros(100));
    }

    pub fn halt<Traits: PortInstance>(&self) -> ! {
        panic!("the kernel halted the system");
    }
}

/// Spawn a worker thread for `task` if it doesn't have one yet, and return
/// the worker backing it.
fn resolve_task_thread<Traits: PortInstance>(
    lock: &mut ums::ThreadGroupLockGuard<'_, sched::SchedState>,
    task: &'static TaskCb<Traits>,
) -> ums::ThreadId {
    let mut tsm = task.port_task_state.tsm.lock();
    match *tsm {
        Tsm::Running(thread_id) => thread_id,
        Tsm::Dormant => {
            let thread_id = lock.spawn(move |_| task_thread_body::<Traits>(task));
            log::trace!("spawned a worker for task {task:p}");
            *tsm = Tsm::Running(thread_id);
            thread_id
        }
        Tsm::Uninit => unreachable!("switching to an uninitialized task"),
    }
}

fn task_thread_body<Traits: PortInstance>(task: &'static TaskCb<Traits>) {
    log::debug!("task {task:p} is now running");

    // A switch into a fresh task leaves CPU Lock active; release it the way
    // a real port's first context restore re-enables interrupts.
    // Safety: we are the port
    unsafe { <Traits as KernelTraits>::leave_cpu_lock() };

    let entry = task.entry_point().expect("task entry point not set");
    let ret_value = (entry.entry)(entry.param);

    System::<Traits>::task_exit(ret_value);
}

/// The interrupt thread: services one pended tick per wakeup.
fn isr_thread_body<Traits: PortInstance>() {
    loop {
        // We run only when the scheduler elected us for a pended interrupt
        // (the first park happens in the ums spawn wrapper, subsequent ones
        // inside `yield_now`).

        // Safety: we are the port; this is the interrupt prologue
        unsafe { System::<Traits>::isr_enter() };
        // Safety: called from an interrupt context with CPU Lock inactive
        unsafe { System::<Traits>::tick() };
        // Safety: balanced with `isr_enter` above
        let next = unsafe { System::<Traits>::isr_exit() };

        let state = Traits::port_state();
        let mut lock = state.group().lock();
        let thread = resolve_task_thread::<Traits>(&mut lock, next);
        lock.scheduler().task_thread = Some(thread);
        lock.scheduler().in_isr = false;
        drop(lock);

        // Interrupt epilogue: restore whatever `running_task` now points to.
        // If the tick was pended again in the meantime, the scheduler sends
        // us right back into the loop instead.
        ums::yield_now();
    }
}

/// Pend the tick interrupt from a thread not managed by the port (the timer
/// thread or a test harness thread).
fn pend_tick_from_outside<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut lock = state.group().lock();
    lock.scheduler().tick_pended = true;
    if lock.scheduler().can_take_interrupt() && !lock.is_panicking() {
        // Force the running worker off the virtual CPU and let the
        // scheduler elect the interrupt thread.
        lock.preempt();
    }
    // Otherwise the interrupt stays pended until CPU Lock is released or
    // the current handler finishes.
}

/// Boot the kernel configured on `Traits` and run it until [`shutdown`].
///
/// `app_init` runs first (with the scheduler locked) and must create the
/// initial tasks and, typically, call [`start_tick`]. `app_idle` becomes the
/// body of the idle loop.
pub fn boot<Traits: PortInstance>(app_init: fn(), app_idle: fn()) {
    Traits::port_state().port_boot::<Traits>(app_init, app_idle);
}

/// Start (or retune) the periodic tick source.
pub fn start_tick<Traits: PortInstance>(period: Duration) {
    let state = Traits::port_state();
    let timer_cmd_send = state.timer_cmd_send.lock();
    timer_cmd_send
        .as_ref()
        .expect("kernel is not booted")
        .send(TimerCmd::SetPeriod(period))
        .unwrap();
}

/// Pend a single tick interrupt by hand. Useful for tests that want full
/// control over time.
pub fn pend_tick<Traits: PortInstance>() {
    if ums::current_thread().is_some() {
        // Called from a task: mark the line pended and offer the virtual CPU
        // so the scheduler can take the interrupt.
        let state = Traits::port_state();
        let mut lock = state.group().lock();
        lock.scheduler().tick_pended = true;
        drop(lock);
        ums::yield_now();
    } else {
        pend_tick_from_outside::<Traits>();
    }
}

/// Initiate shutdown from inside the simulated system. [`boot`] returns on
/// the host side; the calling task never resumes.
pub fn shutdown<Traits: PortInstance>() -> ! {
    let state = Traits::port_state();
    state.group().lock().shutdown();
    ums::park_forever()
}

fn install_panic_hook() {
    static HOOK_ONCE: Once = Once::new();
    HOOK_ONCE.call_once(|| {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            // Stop preemption for the affected group right away so the
            // unwinding thread cannot be parked mid-unwind.
            ums::mark_current_group_panicking();
            prev(info);
        }));
    });
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident { priority_levels: $N:expr }) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::tern_kernel::{
                klock::CpuLockCell, utils::intrusive_list::StaticListHead, utils::FixedPrioBitmap,
                KernelTraits, State as KernelState, TaskCb,
            };
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();
            pub(super) static KERNEL_STATE: KernelState<$SystemTraits> = KernelState::new();

            // Safety: `State`'s methods implement the port interface
            unsafe impl KernelTraits for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: TaskState = TaskState::new();

                const STACK_MIN_SIZE: usize = 64;
                const STACK_DESCENDING: bool = true;

                unsafe fn try_enter_cpu_lock() -> bool {
                    PORT_STATE.try_enter_cpu_lock::<Self>()
                }

                unsafe fn leave_cpu_lock() {
                    PORT_STATE.leave_cpu_lock::<Self>()
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>) {
                    PORT_STATE.initialize_task_state::<Self>(task)
                }

                unsafe fn context_switch(next: &'static TaskCb<Self>) {
                    PORT_STATE.context_switch::<Self>(next)
                }

                unsafe fn context_switch_exit(
                    exiting: &'static TaskCb<Self>,
                    next: &'static TaskCb<Self>,
                ) -> ! {
                    PORT_STATE.context_switch_exit::<Self>(exiting, next)
                }

                unsafe fn idle() {
                    PORT_STATE.idle::<Self>()
                }

                fn halt() -> ! {
                    PORT_STATE.halt::<Self>()
                }

                const NUM_PRIORITY_LEVELS: usize = $N;
                type PrioBitmap = FixedPrioBitmap<{ $N }>;
                type BucketArray =
                    [CpuLockCell<$SystemTraits, StaticListHead<TaskCb<$SystemTraits>>>; $N];

                fn state() -> &'static KernelState<$SystemTraits> {
                    &KERNEL_STATE
                }
            }

            // Safety: `use_port!` is the designated implementor
            unsafe impl PortInstance for $SystemTraits {
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }
        }
    };
}
