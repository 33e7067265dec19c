//! Bounded message queue over the lock-free ring.
use core::{pin::pin, sync::atomic::AtomicPtr};

use crate::{
    error::PopError,
    ring::{Msg, Ring},
    timeout::WaitObj,
    waitqueue::{WaitQueueCb, WAKE_ALL},
    KernelTraits, Ticks, WaitError,
};

/// Producer/consumer discipline of a message queue, fixed at construction.
///
/// The single-producer and single-consumer variants skip the reservation
/// loop of the ring operations; picking the right discipline is the
/// application's promise about how many tasks touch each end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Single producer, single consumer.
    SpSc,
    /// Single producer, multiple consumers.
    SpMc,
    /// Multiple producers, single consumer.
    MpSc,
    /// Multiple producers, multiple consumers.
    MpMc,
}

/// *Message-queue control block* — a bounded multi-message mailbox.
///
/// The capacity is the ring size minus one.
pub struct MqueueCb<Traits: KernelTraits> {
    wait_queue: WaitQueueCb<Traits>,
    ring: Ring,
    discipline: Discipline,
}

impl<Traits: KernelTraits> MqueueCb<Traits> {
    /// Construct a message queue over `slots` (a power-of-two-sized slot
    /// array, e.g. from [`RingStorage`](crate::RingStorage)).
    pub const fn new(slots: &'static [AtomicPtr<()>], discipline: Discipline) -> Self {
        Self {
            wait_queue: WaitQueueCb::new(),
            ring: Ring::new(slots),
            discipline,
        }
    }

    fn enq(&self, msgs: &[Msg]) -> usize {
        match self.discipline {
            Discipline::SpSc | Discipline::SpMc => self.ring.sp_enq(msgs),
            Discipline::MpSc | Discipline::MpMc => self.ring.mp_enq::<Traits>(msgs),
        }
    }

    fn deq(&self, out: &mut [Msg]) -> usize {
        match self.discipline {
            Discipline::SpSc | Discipline::MpSc => self.ring.sc_deq(out),
            Discipline::SpMc | Discipline::MpMc => self.ring.mc_deq::<Traits>(out),
        }
    }

    /// Enqueue as many of `msgs` as fit and wake all receivers. Returns the
    /// number actually enqueued, possibly zero.
    ///
    /// Callable from an interrupt handler (with `sync == false`) only under
    /// a single-producer discipline.
    pub fn post(&self, msgs: &[Msg], sync: bool) -> usize {
        api_assert!(Traits, !msgs.is_empty());

        let stored = self.enq(msgs);
        if stored > 0 {
            self.wait_queue.wake_up(WAKE_ALL, sync);
        }
        stored
    }

    /// Dequeue up to `out.len()` messages, blocking while the queue is
    /// empty. Returns the number retrieved (at least one).
    pub fn pop(&self, out: &mut [Msg]) -> Result<usize, PopError> {
        api_assert!(Traits, !out.is_empty());

        loop {
            self.wait_queue.prepare();
            let retrieved = self.deq(out);
            if retrieved > 0 {
                self.wait_queue.finish();
                return Ok(retrieved);
            }
            match self.wait_queue.wait() {
                // woken up, but rival consumers may have drained it; retry
                Ok(()) => {}
                Err(WaitError::Timeout) => return Err(PopError::Timeout),
                Err(WaitError::Destroyed) => return Err(PopError::Destroyed),
            }
        }
    }

    /// Like [`pop`](Self::pop), blocking for at most `timeout_ticks` ticks.
    pub fn pop_timeout(&self, out: &mut [Msg], timeout_ticks: Ticks) -> Result<usize, PopError> {
        api_assert!(Traits, !out.is_empty());

        loop {
            let wait_obj = pin!(WaitObj::new());
            self.wait_queue
                .prepare_timeout(wait_obj.as_ref(), timeout_ticks);
            let retrieved = self.deq(out);
            if retrieved > 0 {
                self.wait_queue.finish();
                return Ok(retrieved);
            }
            match self.wait_queue.wait() {
                Ok(()) => {}
                Err(WaitError::Timeout) => return Err(PopError::Timeout),
                Err(WaitError::Destroyed) => return Err(PopError::Destroyed),
            }
        }
    }

    /// Destroy the message queue, waking every waiting receiver with
    /// [`PopError::Destroyed`]. Stored messages are discarded.
    pub fn destroy(&self) {
        // drain so a re-created queue starts out empty
        let mut sink = [core::ptr::null_mut(); 1];
        while self.ring.sc_deq(&mut sink) != 0 {}
        self.wait_queue.destroy();
    }
}
