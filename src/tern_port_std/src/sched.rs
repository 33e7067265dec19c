//! The simulator's scheduler state: which worker thread embodies the running
//! task, whether the virtual CPU has interrupts masked (CPU Lock), and
//! whether the tick interrupt is pending or being serviced.
use crate::ums::{Scheduler, ThreadId};

/// The per-kernel scheduling state, driving [`crate::ums`].
#[derive(Debug)]
pub(crate) struct SchedState {
    /// Emulates the interrupts-disabled state of the virtual CPU. While set,
    /// pended interrupts stay pending.
    pub(crate) cpu_lock: bool,

    /// The worker thread embodying the kernel's running task.
    pub(crate) task_thread: Option<ThreadId>,

    /// The worker thread on which interrupt handlers run.
    pub(crate) isr_thread: Option<ThreadId>,

    /// The tick interrupt line.
    pub(crate) tick_pended: bool,

    /// An interrupt handler is in progress on `isr_thread`.
    pub(crate) in_isr: bool,
}

impl SchedState {
    pub(crate) fn new() -> Self {
        Self {
            cpu_lock: false,
            task_thread: None,
            isr_thread: None,
            tick_pended: false,
            in_isr: false,
        }
    }

    /// `true` if a pended interrupt can be taken right now. When it can,
    /// whoever holds the thread-group lock should cause a reschedule
    /// (`preempt` from the outside, `yield_now` from a worker).
    pub(crate) fn can_take_interrupt(&self) -> bool {
        self.tick_pended && !self.cpu_lock && !self.in_isr
    }
}

impl Scheduler for SchedState {
    fn choose_next_thread(&mut self) -> Option<ThreadId> {
        if self.in_isr {
            // An interrupt handler never loses the virtual CPU (the
            // simulator models a single nesting level).
            self.isr_thread
        } else if self.can_take_interrupt() {
            // Interrupt entry: transfer the virtual CPU to the handler
            // thread. The interrupted task's context is whatever its worker
            // thread's stack holds while parked.
            self.tick_pended = false;
            self.in_isr = true;
            self.isr_thread
        } else {
            self.task_thread
        }
    }

    fn thread_exited(&mut self, thread_id: ThreadId) {
        if self.task_thread == Some(thread_id) {
            self.task_thread = None;
        }
        if self.isr_thread == Some(thread_id) {
            self.isr_thread = None;
        }
    }
}
