//! Lock-free bounded FIFO of opaque pointers.
//!
//! Derived from the classic FreeBSD `bufring` design: `head` *reserves* a
//! span of slots, `tail` *publishes* it. Consumers only ever observe `tail`,
//! so a producer's half-written span is invisible until committed. The
//! single-producer/single-consumer variants skip the reservation loop but
//! still keep both index families up to date, so the discipline can be
//! switched at runtime without desynchronizing the ring.
//!
//! Capacity is `size - 1` where `size` is a power of two; one slot stays
//! free to distinguish a full ring from an empty one.
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::{state, utils::Init, KernelTraits};

/// A message payload: an opaque pointer.
pub type Msg = *mut ();

/// One head/tail index pair. The indices grow monotonically (wrapping at the
/// index type's range); the ring mask isolates the slot number.
struct Ends {
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl Init for Ends {
    const INIT: Self = Self {
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    };
}

/// Statically allocatable slot storage for a [`Ring`].
pub struct RingStorage<const LEN: usize> {
    slots: [AtomicPtr<()>; LEN],
}

impl<const LEN: usize> RingStorage<LEN> {
    #[allow(clippy::declare_interior_mutable_const)]
    const NULL_SLOT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

    pub const fn new() -> Self {
        Self {
            slots: [Self::NULL_SLOT; LEN],
        }
    }

    pub const fn slots(&'static self) -> &'static [AtomicPtr<()>] {
        &self.slots
    }
}

impl<const LEN: usize> Default for RingStorage<LEN> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free multi-producer/multi-consumer FIFO over borrowed slot storage.
pub struct Ring {
    slots: &'static [AtomicPtr<()>],
    mask: usize,
    prod: Ends,
    cons: Ends,
}

impl Ring {
    /// Construct a ring over `slots`, whose length must be a power of two.
    pub const fn new(slots: &'static [AtomicPtr<()>]) -> Self {
        assert!(slots.len().is_power_of_two(), "size must be a power of 2");
        Self {
            mask: slots.len() - 1,
            slots,
            prod: Ends::INIT,
            cons: Ends::INIT,
        }
    }

    /// Copy `objs` into the reserved span starting at `prod_head`.
    fn write_span(&self, prod_head: usize, objs: &[Msg]) {
        for (i, obj) in objs.iter().enumerate() {
            self.slots[(prod_head + i) & self.mask].store(*obj, Ordering::SeqCst);
        }
    }

    /// Copy the span starting at `cons_head` into `out`.
    fn read_span(&self, cons_head: usize, out: &mut [Msg]) {
        for (i, out_slot) in out.iter_mut().enumerate() {
            *out_slot = self.slots[(cons_head + i) & self.mask].load(Ordering::SeqCst);
        }
    }

    /// Single-producer enqueue. Returns the number of items actually stored,
    /// which may be any prefix of `objs` (zero when the ring is full).
    pub fn sp_enq(&self, objs: &[Msg]) -> usize {
        debug_assert!(!objs.is_empty());

        let cons_tail = self.cons.tail.load(Ordering::SeqCst);
        let prod_head = self.prod.head.load(Ordering::SeqCst);

        let free = cons_tail.wrapping_sub(prod_head).wrapping_sub(1) & self.mask;
        let cnt = objs.len().min(free);
        if cnt == 0 {
            return 0;
        }

        let prod_next = prod_head.wrapping_add(cnt);
        // not strictly needed in the single-producer discipline, but keeps
        // the index families compatible with `mp_enq`
        self.prod.head.store(prod_next, Ordering::SeqCst);

        self.write_span(prod_head, &objs[..cnt]);

        // release the span to consumers
        self.prod.tail.store(prod_next, Ordering::SeqCst);

        cnt
    }

    /// Multi-producer enqueue. Returns the number of items actually stored.
    ///
    /// Not callable from an interrupt handler: a producer that reserved
    /// earlier but has not committed yet must be given a chance to run.
    pub fn mp_enq<Traits: KernelTraits>(&self, objs: &[Msg]) -> usize {
        debug_assert!(!objs.is_empty());
        // the commit wait below may need to yield
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut prod_head;
        let mut prod_next;
        let mut cnt;
        loop {
            let cons_tail = self.cons.tail.load(Ordering::SeqCst);
            prod_head = self.prod.head.load(Ordering::SeqCst);

            let free = cons_tail.wrapping_sub(prod_head).wrapping_sub(1) & self.mask;
            cnt = objs.len().min(free);
            if cnt == 0 {
                return 0;
            }

            prod_next = prod_head.wrapping_add(cnt);
            // reserve the span
            if self
                .prod
                .head
                .compare_exchange(prod_head, prod_next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        self.write_span(prod_head, &objs[..cnt]);

        // Producers that reserved before us must commit first; on a single
        // CPU the only way to let them is to yield (they can only be peers
        // of our own priority, or we could not be running).
        while self.prod.tail.load(Ordering::SeqCst) != prod_head {
            crate::task::yield_to_peer::<Traits>();
        }
        self.prod.tail.store(prod_next, Ordering::SeqCst);

        cnt
    }

    /// Single-consumer dequeue. Returns the number of items retrieved (zero
    /// when the ring is empty).
    pub fn sc_deq(&self, out: &mut [Msg]) -> usize {
        debug_assert!(!out.is_empty());

        let cons_head = self.cons.head.load(Ordering::SeqCst);
        let prod_tail = self.prod.tail.load(Ordering::SeqCst);

        let entries = prod_tail.wrapping_sub(cons_head) & self.mask;
        let cnt = out.len().min(entries);
        if cnt == 0 {
            return 0;
        }

        let cons_next = cons_head.wrapping_add(cnt);
        // see the remark in `sp_enq`
        self.cons.head.store(cons_next, Ordering::SeqCst);

        self.read_span(cons_head, &mut out[..cnt]);

        self.cons.tail.store(cons_next, Ordering::SeqCst);

        cnt
    }

    /// Multi-consumer dequeue. Returns the number of items retrieved.
    ///
    /// Not callable from an interrupt handler, for the same reason as
    /// [`mp_enq`](Self::mp_enq).
    pub fn mc_deq<Traits: KernelTraits>(&self, out: &mut [Msg]) -> usize {
        debug_assert!(!out.is_empty());
        api_assert!(Traits, state::in_task_context::<Traits>());

        let mut cons_head;
        let mut cons_next;
        let mut cnt;
        loop {
            cons_head = self.cons.head.load(Ordering::SeqCst);
            let prod_tail = self.prod.tail.load(Ordering::SeqCst);

            let entries = prod_tail.wrapping_sub(cons_head) & self.mask;
            cnt = out.len().min(entries);
            if cnt == 0 {
                return 0;
            }

            cons_next = cons_head.wrapping_add(cnt);
            // reserve the span
            if self
                .cons
                .head
                .compare_exchange(cons_head, cons_next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        self.read_span(cons_head, &mut out[..cnt]);

        // wait for earlier dequeues to release their spans
        while self.cons.tail.load(Ordering::SeqCst) != cons_head {
            crate::task::yield_to_peer::<Traits>();
        }
        self.cons.tail.store(cons_next, Ordering::SeqCst);

        cnt
    }

    /// The number of stored entries. Statistical only: concurrent operations
    /// may make the result stale immediately.
    pub fn len(&self) -> usize {
        let prod_tail = self.prod.tail.load(Ordering::SeqCst);
        let cons_tail = self.cons.tail.load(Ordering::SeqCst);
        prod_tail.wrapping_sub(cons_tail) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of free entries. Statistical only.
    pub fn free(&self) -> usize {
        let prod_tail = self.prod.tail.load(Ordering::SeqCst);
        let cons_tail = self.cons.tail.load(Ordering::SeqCst);
        cons_tail.wrapping_sub(prod_tail).wrapping_sub(1) & self.mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_storage(len: usize) -> &'static [AtomicPtr<()>] {
        let vec: Vec<AtomicPtr<()>> = (0..len)
            .map(|_| AtomicPtr::new(core::ptr::null_mut()))
            .collect();
        Vec::leak(vec)
    }

    fn msg(value: usize) -> Msg {
        value as Msg
    }

    #[test]
    fn sp_sc_round_trip() {
        let ring = Ring::new(leak_storage(8));

        assert_eq!(ring.sp_enq(&[msg(1), msg(2), msg(3)]), 3);
        assert_eq!(ring.len(), 3);

        let mut out = [core::ptr::null_mut(); 8];
        assert_eq!(ring.sc_deq(&mut out), 3);
        assert_eq!(&out[..3], &[msg(1), msg(2), msg(3)]);
        assert!(ring.is_empty());
    }

    #[test]
    fn capacity_is_one_less_than_size() {
        let ring = Ring::new(leak_storage(8));
        let items: Vec<Msg> = (1..=8).map(msg).collect();

        // only 7 fit; the eighth slot stays free
        assert_eq!(ring.sp_enq(&items), 7);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.sp_enq(&[msg(9)]), 0);

        let mut out = [core::ptr::null_mut(); 1];
        assert_eq!(ring.sc_deq(&mut out), 1);
        assert_eq!(out[0], msg(1));
        assert_eq!(ring.sp_enq(&[msg(9)]), 1);
    }

    #[test]
    fn partial_dequeue_preserves_order() {
        let ring = Ring::new(leak_storage(4));

        assert_eq!(ring.sp_enq(&[msg(10), msg(20), msg(30)]), 3);

        let mut out = [core::ptr::null_mut(); 2];
        assert_eq!(ring.sc_deq(&mut out), 2);
        assert_eq!(&out, &[msg(10), msg(20)]);

        assert_eq!(ring.sp_enq(&[msg(40), msg(50)]), 2);

        let mut out = [core::ptr::null_mut(); 4];
        assert_eq!(ring.sc_deq(&mut out), 3);
        assert_eq!(&out[..3], &[msg(30), msg(40), msg(50)]);
    }

    #[test]
    fn wrap_around() {
        let ring = Ring::new(leak_storage(4));
        let mut out = [core::ptr::null_mut(); 1];

        for i in 0..100 {
            assert_eq!(ring.sp_enq(&[msg(i)]), 1);
            assert_eq!(ring.sc_deq(&mut out), 1);
            assert_eq!(out[0], msg(i));
        }
    }
}
