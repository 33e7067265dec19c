//! Timekeeping: the monotonic tick counter and software timers.
//!
//! Pending timers are kept on a single intrusive list sorted by remaining
//! burn-off time. The tick handler does not walk the list on every tick;
//! it accumulates elapsed ticks in `tick_unsynch` and only synchronizes the
//! list when the head timer is due (or when the accumulator approaches the
//! range limit of the smallest supported tick type).
use core::{
    fmt,
    marker::PhantomPinned,
    ops,
    pin::Pin,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use crate::{
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    task::TaskCb,
    utils::{
        intrusive_list::{Link, ListAccessorCell, ListHead},
        Init,
    },
    KernelTraits, Ticks,
};

/// Maximal number of unsynchronized ticks accumulated before the timer list
/// is walked regardless of the head timer's deadline.
pub const UNSYNCH_MAX: Ticks = 1024;

/// Upper bound for a timer's timeout. Keeps the remaining-time bookkeeping
/// within the range of a 16-bit tick type even with the unsynchronized-tick
/// allowance on top.
pub const TICKS_REM_MAX: Ticks = u16::MAX as Ticks - UNSYNCH_MAX;

const MAGIC_LIVE: u16 = 0xAABB;
const MAGIC_DEAD: u16 = 0xCCDD;

/// A timer callback. Runs in tick-interrupt context with CPU Lock active;
/// the guard is threaded through so the callback can manipulate kernel state,
/// but it must not block.
pub type TimerFn<Traits> = fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// Kernel-global state of the timer module.
pub(crate) struct TimeoutGlobals<Traits: KernelTraits> {
    /// Sorted list of all armed timers.
    timers: CpuLockCell<Traits, ListHead<TimerRef<Traits>>>,

    /// Number of ticks since the last timer-list synchronization.
    tick_unsynch: CpuLockCell<Traits, Ticks>,

    /// Monotonic tick counter. Read without CPU Lock by `ticks_now`.
    pub(crate) ticks_cnt: AtomicU32,
}

impl<Traits: KernelTraits> TimeoutGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const INIT: Self = Self {
        timers: CpuLockCell::new(ListHead::new()),
        tick_unsynch: CpuLockCell::new(0),
        ticks_cnt: AtomicU32::new(0),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimeoutGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("ticks_cnt", &self.ticks_cnt)
            .finish_non_exhaustive()
    }
}

/// A software timer.
///
/// The kernel links armed timers into a global list, so a `Timer` must stay
/// put once armed: the arming methods take `Pin`, and dropping an armed
/// timer disarms it first.
///
/// With a non-zero reload time the timer re-arms itself after every
/// expiration; otherwise it is one-shot.
pub struct Timer<Traits: KernelTraits> {
    link: CpuLockCell<Traits, Option<Link<TimerRef<Traits>>>>,

    /// Remaining burn-off time, relative to the last synchronization point.
    /// An armed timer has a non-zero value.
    ticks_rem: CpuLockCell<Traits, Ticks>,

    /// Auto-reload period; `0` makes the timer one-shot.
    ticks_reload: CpuLockCell<Traits, Ticks>,

    callback: CpuLockCell<Traits, Option<TimerFn<Traits>>>,
    param: CpuLockCell<Traits, usize>,

    /// Double-use guard. Arming flips this to a live pattern, destruction to
    /// a dead one, which makes `destroy` idempotent for as long as the
    /// memory stays valid.
    magic: CpuLockCell<Traits, u16>,

    /// Whether the timer is currently linked into a timer list. Readable
    /// without CPU Lock so that `Drop` can take the fast path.
    registered: AtomicBool,

    _pin: PhantomPinned,
}

// Safety: all fields are atomic or CPU Lock-guarded
unsafe impl<Traits: KernelTraits> Send for Timer<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for Timer<Traits> {}

impl<Traits: KernelTraits> Timer<Traits> {
    pub const fn new() -> Self {
        Self {
            link: CpuLockCell::new(None),
            ticks_rem: CpuLockCell::new(0),
            ticks_reload: CpuLockCell::new(0),
            callback: CpuLockCell::new(None),
            param: CpuLockCell::new(0),
            magic: CpuLockCell::new(0),
            registered: AtomicBool::new(false),
            _pin: PhantomPinned,
        }
    }
}

impl<Traits: KernelTraits> Default for Timer<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Init for Timer<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for Timer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("self", &(self as *const _))
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Drop for Timer<Traits> {
    fn drop(&mut self) {
        if self.registered.load(Ordering::SeqCst) {
            // Dropped while armed (e.g. an abandoned wait object). Disarm so
            // the global list doesn't end up pointing into freed memory.
            let mut lock = klock::lock_cpu::<Traits>();
            self.destroy_locked(lock.borrow_mut());
        }
    }
}

/// A reference to a [`Timer`], which may live on a task's stack.
///
/// Valid while the timer is linked into a timer list; the arming methods'
/// `Pin` contract plus disarm-on-drop uphold this.
pub(crate) struct TimerRef<Traits: KernelTraits>(NonNull<Timer<Traits>>);

// Safety: `Timer` is `Send + Sync`
unsafe impl<Traits: KernelTraits> Send for TimerRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for TimerRef<Traits> {}

impl<Traits: KernelTraits> Clone for TimerRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<Traits: KernelTraits> Copy for TimerRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for TimerRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for TimerRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for TimerRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimerRef").field(&self.0).finish()
    }
}

use self::unsafe_static::UnsafeStatic;
mod unsafe_static {
    use super::*;

    /// A virtual container of all extant timers, indexed by [`TimerRef`].
    pub(super) struct UnsafeStatic {
        _nonexhaustive: (),
    }

    impl UnsafeStatic {
        /// # Safety
        ///
        /// All pointees to be accessed through the constructed `UnsafeStatic`
        /// must be valid.
        #[inline]
        pub(super) const unsafe fn new() -> &'static Self {
            &Self { _nonexhaustive: () }
        }
    }

    impl<Traits: KernelTraits> ops::Index<TimerRef<Traits>> for UnsafeStatic {
        type Output = Timer<Traits>;

        #[inline]
        fn index(&self, index: TimerRef<Traits>) -> &Self::Output {
            // Safety: see `UnsafeStatic::new`
            unsafe { &*index.0.as_ptr() }
        }
    }
}

/// Get a `ListAccessorCell` for a timer list.
macro_rules! timer_list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new(
            $head,
            // Safety: timers are unlinked before their memory is invalidated
            unsafe { UnsafeStatic::new() },
            |timer: &Timer<Traits>| &timer.link,
            $key,
        )
    };
}

/// Link `timer_ref` into the global timer list at its sorted position.
/// Timers with an equal remaining time keep their insertion order.
fn insert_sorted<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_ref: TimerRef<Traits>,
) {
    let globals = &Traits::state().timeout;
    // Safety: `timer_ref` is being armed, so it's valid
    let rem = unsafe { timer_ref.0.as_ref() }.ticks_rem.get(&*lock);

    let accessor = timer_list_accessor!(&globals.timers, lock.borrow_mut());
    let mut insert_at = None;
    let mut cursor = accessor.front();
    while let Some(cur) = cursor {
        if accessor.pool()[cur].ticks_rem.get(&**accessor.cell_key()) > rem {
            insert_at = Some(cur);
            break;
        }
        cursor = accessor.next(cur);
    }

    let mut accessor = accessor;
    accessor.insert(timer_ref, insert_at);
    // Safety: as above
    unsafe { timer_ref.0.as_ref() }
        .registered
        .store(true, Ordering::SeqCst);
}

impl<Traits: KernelTraits> Timer<Traits> {
    /// Arm the timer: after `timeout_ticks` ticks its callback runs in
    /// tick-interrupt context, and with a non-zero `reload_ticks` the timer
    /// re-arms itself with that period.
    ///
    /// Arming an already-armed timer halts the system; destroy it first.
    /// Callable from an interrupt handler.
    pub fn start_static(
        &'static self,
        callback: TimerFn<Traits>,
        param: usize,
        timeout_ticks: Ticks,
        reload_ticks: Ticks,
    ) {
        let mut lock = klock::lock_cpu::<Traits>();
        // Safety: a static never moves
        let pinned = unsafe { Pin::new_unchecked(self) };
        pinned.start_locked(lock.borrow_mut(), callback, param, timeout_ticks, reload_ticks);
    }

    /// [`start_static`](Self::start_static) for pinned timers and for
    /// callers that already hold CPU Lock (e.g. timer callbacks).
    pub fn start_locked(
        self: Pin<&Self>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        callback: TimerFn<Traits>,
        param: usize,
        timeout_ticks: Ticks,
        reload_ticks: Ticks,
    ) {
        // timeout must be at least one tick in the future, and small enough
        // not to overflow the tick bookkeeping
        api_assert!(Traits, timeout_ticks > 0);
        api_assert!(Traits, timeout_ticks < TICKS_REM_MAX);
        // prevent double use of an armed timer
        api_assert!(Traits, self.magic.get(&*lock) != MAGIC_LIVE);

        let globals = &Traits::state().timeout;

        // Count down relative to the last synchronization point, so the
        // pending unsynchronized ticks must be added on top; they will be
        // subtracted again during the next synchronization.
        let rem = timeout_ticks + globals.tick_unsynch.get(&*lock);
        self.ticks_rem.replace(&mut *lock, rem);
        self.ticks_reload.replace(&mut *lock, reload_ticks);
        self.callback.replace(&mut *lock, Some(callback));
        self.param.replace(&mut *lock, param);
        self.magic.replace(&mut *lock, MAGIC_LIVE);

        insert_sorted(lock, TimerRef(NonNull::from(self.get_ref())));
    }

    /// Disarm the timer. Safe to call any number of times for as long as the
    /// timer's memory stays valid. Callable from an interrupt handler.
    pub fn destroy(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.destroy_locked(lock.borrow_mut());
    }

    /// [`destroy`](Self::destroy) for callers that already hold CPU Lock
    /// (e.g. timer callbacks).
    pub fn destroy_locked(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        {
            let magic = self.magic.get(&*lock);
            // reject timers that were never armed (or whose memory is stale)
            api_assert!(Traits, magic == MAGIC_LIVE || magic == MAGIC_DEAD);
        }

        if self.registered.load(Ordering::SeqCst) {
            let globals = &Traits::state().timeout;
            let mut accessor = timer_list_accessor!(&globals.timers, lock.borrow_mut());
            accessor.remove(TimerRef(NonNull::from(self)));
            self.registered.store(false, Ordering::SeqCst);
        }

        self.ticks_rem.replace(&mut *lock, 0);
        // a zero reload also keeps the expiration path from re-arming a
        // timer that its own callback destroyed
        self.ticks_reload.replace(&mut *lock, 0);
        self.magic.replace(&mut *lock, MAGIC_DEAD);
    }
}

/// The per-tick entry of the timer module. Must be called with CPU Lock
/// active, from the tick interrupt.
pub(crate) fn handle_tick<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let globals = &Traits::state().timeout;

    // The counter wraps at `TICKS_MAX`; `ticks_diff` accounts for that.
    globals.ticks_cnt.fetch_add(1, Ordering::SeqCst);

    let head = {
        let accessor = timer_list_accessor!(&globals.timers, lock.borrow_mut());
        accessor.front()
    };

    let Some(head) = head else {
        // No timers; nothing to synchronize against.
        globals.tick_unsynch.replace(&mut *lock, 0);
        return lock;
    };

    let unsynch = globals.tick_unsynch.get(&*lock) + 1;
    globals.tick_unsynch.replace(&mut *lock, unsynch);

    // Fast path: as long as the head timer (the soonest one) is not due and
    // the accumulator is within bounds, the list is left untouched.
    // Safety: `head` is linked, so it's valid
    let head_rem = unsafe { head.0.as_ref() }.ticks_rem.get(&*lock);
    if unsynch >= head_rem || unsynch > UNSYNCH_MAX {
        lock = trigger_expired(lock);
    }

    lock
}

/// Synchronize the timer list with the accumulated ticks, firing expired
/// timers and re-arming the auto-reloaded ones.
fn trigger_expired<Traits: KernelTraits>(mut lock: CpuLockGuard<Traits>) -> CpuLockGuard<Traits> {
    let globals = &Traits::state().timeout;
    let unsynch = globals.tick_unsynch.get(&*lock);

    // Expired timers are collected on a temporary list so that the callbacks
    // (which may arm or destroy arbitrary timers) never observe a
    // half-walked pending list.
    let expired: CpuLockCell<Traits, ListHead<TimerRef<Traits>>> =
        CpuLockCell::new(ListHead::new());

    let mut cursor = {
        let accessor = timer_list_accessor!(&globals.timers, lock.borrow_mut());
        accessor.front()
    };
    while let Some(cur) = cursor {
        cursor = {
            let accessor = timer_list_accessor!(&globals.timers, lock.borrow_mut());
            accessor.next(cur)
        };

        // Safety: `cur` is linked, so it's valid
        let timer = unsafe { cur.0.as_ref() };
        let rem = timer.ticks_rem.get(&*lock);
        if rem <= unsynch {
            timer_list_accessor!(&globals.timers, lock.borrow_mut()).remove(cur);
            timer.registered.store(false, Ordering::SeqCst);
            timer.ticks_rem.replace(&mut *lock, 0);
            timer_list_accessor!(&expired, lock.borrow_mut()).push_back(cur);
        } else {
            // Not due yet, but synchronize the countdown anyway.
            timer.ticks_rem.replace(&mut *lock, rem - unsynch);
        }
    }

    globals.tick_unsynch.replace(&mut *lock, 0);

    loop {
        let front = {
            let mut accessor = timer_list_accessor!(&expired, lock.borrow_mut());
            accessor.pop_front()
        };
        let Some(timer_ref) = front else { break };

        // Safety: the timer was linked a moment ago and expired timers are
        // only unlinked by this loop
        let timer = unsafe { timer_ref.0.as_ref() };

        // A callback earlier in this batch may have destroyed this timer;
        // honor that by skipping it.
        if timer.magic.get(&*lock) != MAGIC_LIVE {
            continue;
        }

        let callback = timer.callback.get(&*lock).unwrap_or_else(|| {
            crate::halt::<Traits>();
        });
        let param = timer.param.get(&*lock);

        lock = callback(param, lock);

        let reload = timer.ticks_reload.get(&*lock);
        if reload > 0 {
            timer.ticks_rem.replace(&mut *lock, reload);
            insert_sorted(lock.borrow_mut(), timer_ref);
        }
    }

    lock
}

/// Arm a one-shot timeout guarding the current task's blocking operation
/// and remember it in the task control block.
pub(crate) fn blocktimer_create<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer: Pin<&Timer<Traits>>,
    callback: TimerFn<Traits>,
    task: &'static TaskCb<Traits>,
    timeout_ticks: Ticks,
) {
    self_check_assert!(Traits, task.block_timer.load(Ordering::SeqCst).is_null());

    timer.start_locked(
        lock.borrow_mut(),
        callback,
        task as *const _ as usize,
        timeout_ticks,
        0,
    );
    task.block_timer
        .store(timer.get_ref() as *const _ as *mut _, Ordering::SeqCst);
}

/// Disarm and forget the task's block timer, if any. Idempotent.
pub(crate) fn blocktimer_destroy<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &TaskCb<Traits>,
) {
    let timer = task
        .block_timer
        .swap(core::ptr::null_mut(), Ordering::SeqCst);
    if !timer.is_null() {
        // Safety: the block timer lives on a stack frame that outlives the
        // blocking operation it guards
        unsafe { &*timer }.destroy_locked(lock);
    }
}

/// A scratch object carrying the timeout timer of a prepare/check/wait
/// sequence. Lives on the waiting task's stack across the sequence.
pub struct WaitObj<Traits: KernelTraits> {
    timer: Timer<Traits>,
}

impl<Traits: KernelTraits> WaitObj<Traits> {
    pub const fn new() -> Self {
        Self {
            timer: Timer::new(),
        }
    }

    pub(crate) fn timer(self: Pin<&Self>) -> Pin<&Timer<Traits>> {
        // Safety: structural pinning; `WaitObj` is never moved out of
        unsafe { self.map_unchecked(|wait_obj| &wait_obj.timer) }
    }
}

impl<Traits: KernelTraits> Default for WaitObj<Traits> {
    fn default() -> Self {
        Self::new()
    }
}
