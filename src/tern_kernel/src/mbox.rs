//! One-slot message box.
use core::{pin::pin, sync::atomic::{AtomicPtr, Ordering}};

use crate::{
    error::{PopError, PostError},
    ring::Msg,
    timeout::WaitObj,
    waitqueue::{WaitQueueCb, WAKE_ALL},
    KernelTraits, Ticks, WaitError,
};

/// *Message-box control block* — a single atomically exchangeable message
/// slot with a wait queue for receivers.
///
/// A null pointer plays the role of "no message".
pub struct MboxCb<Traits: KernelTraits> {
    wait_queue: WaitQueueCb<Traits>,
    msg: AtomicPtr<()>,
}

impl<Traits: KernelTraits> MboxCb<Traits> {
    pub const fn new(init_msg: Msg) -> Self {
        Self {
            wait_queue: WaitQueueCb::new(),
            msg: AtomicPtr::new(init_msg),
        }
    }

    /// Receive a message, blocking until one is posted.
    pub fn pop(&self) -> Result<Msg, PopError> {
        loop {
            self.wait_queue.prepare();
            let msg = self.msg.swap(core::ptr::null_mut(), Ordering::SeqCst);
            if !msg.is_null() {
                self.wait_queue.finish();
                return Ok(msg);
            }
            match self.wait_queue.wait() {
                // woken up, but a rival receiver may have been faster; retry
                Ok(()) => {}
                Err(WaitError::Timeout) => return Err(PopError::Timeout),
                Err(WaitError::Destroyed) => return Err(PopError::Destroyed),
            }
        }
    }

    /// Receive a message, blocking for at most `timeout_ticks` ticks.
    pub fn pop_timeout(&self, timeout_ticks: Ticks) -> Result<Msg, PopError> {
        loop {
            let wait_obj = pin!(WaitObj::new());
            self.wait_queue
                .prepare_timeout(wait_obj.as_ref(), timeout_ticks);
            let msg = self.msg.swap(core::ptr::null_mut(), Ordering::SeqCst);
            if !msg.is_null() {
                self.wait_queue.finish();
                return Ok(msg);
            }
            match self.wait_queue.wait() {
                Ok(()) => {}
                Err(WaitError::Timeout) => return Err(PopError::Timeout),
                Err(WaitError::Destroyed) => return Err(PopError::Destroyed),
            }
        }
    }

    /// Store `msg` unconditionally and wake one receiver. Returns the
    /// displaced message (null when the box was empty). Callable from an
    /// interrupt handler (with `sync == false`).
    pub fn push(&self, msg: Msg, sync: bool) -> Msg {
        let prev_msg = self.msg.swap(msg, Ordering::SeqCst);
        // a single message can satisfy only a single receiver
        self.wait_queue.wake_up(1, sync);
        prev_msg
    }

    /// Store `msg` only if the box is empty, waking all receivers on
    /// success. Callable from an interrupt handler (with `sync == false`).
    pub fn post(&self, msg: Msg, sync: bool) -> Result<(), PostError> {
        api_assert!(Traits, !msg.is_null());

        if self
            .msg
            .compare_exchange(
                core::ptr::null_mut(),
                msg,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(PostError::Busy);
        }

        self.wait_queue.wake_up(WAKE_ALL, sync);
        Ok(())
    }

    /// Destroy the message box, waking every waiting receiver with
    /// [`PopError::Destroyed`]. The slot content is discarded.
    pub fn destroy(&self) {
        self.msg.store(core::ptr::null_mut(), Ordering::SeqCst);
        self.wait_queue.destroy();
    }
}
