//! Utterly inefficient cross-thread user-mode scheduling: a dynamic set of
//! worker threads of which at most one runs at any moment, as decided by a
//! client-supplied [`Scheduler`].
use slab::Slab;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc, Mutex, MutexGuard},
    thread::Result,
};

use crate::threading;

type SlabPtr = usize;

/// Represents a dynamic set of threads that can be scheduled for execution
/// by `Sched: `[`Scheduler`].
#[derive(Debug)]
pub struct ThreadGroup<Sched: ?Sized> {
    state: Arc<Mutex<State<Sched>>>,
}

impl<Sched: ?Sized> Clone for ThreadGroup<Sched> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

/// Object that can be used to join on a [`ThreadGroup`].
#[derive(Debug)]
pub struct ThreadGroupJoinHandle {
    result_recv: mpsc::Receiver<Result<()>>,
}

/// RAII guard returned by [`ThreadGroup::lock`].
pub struct ThreadGroupLockGuard<'a, Sched: ?Sized> {
    state_ref: &'a Arc<Mutex<State<Sched>>>,
    guard: MutexGuard<'a, State<Sched>>,
}

/// Identifies a thread in [`ThreadGroup`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ThreadId(SlabPtr);

/// Encapsulates the state of a client-supplied user-mode scheduler.
pub trait Scheduler: Send + 'static {
    /// Choose the next thread to run.
    ///
    /// It's an error to return an already-exited thread. The client is
    /// responsible for tracking the lifetime of spawned threads.
    fn choose_next_thread(&mut self) -> Option<ThreadId>;

    /// Called when a thread exits.
    fn thread_exited(&mut self, thread_id: ThreadId) {
        let _ = thread_id;
    }
}

#[derive(Debug)]
struct State<Sched: ?Sized> {
    threads: Slab<WorkerThread>,
    cur_thread_id: Option<ThreadId>,
    shutting_down: bool,
    panicking: bool,
    result_send: mpsc::Sender<Result<()>>,
    sched: Sched,
}

#[derive(Debug)]
struct WorkerThread {
    thread: threading::Thread,
}

thread_local! {
    static TLB: std::cell::RefCell<Option<ThreadLocalBlock>> = const { std::cell::RefCell::new(None) };
}

struct ThreadLocalBlock {
    /// The current thread ID.
    thread_id: ThreadId,
    /// The thread group the current worker thread belongs to.
    state: Arc<Mutex<State<dyn Scheduler>>>,
}

impl<Sched: Scheduler> ThreadGroup<Sched> {
    /// Construct a new `ThreadGroup` and the corresponding
    /// [`ThreadGroupJoinHandle`].
    pub fn new(sched: Sched) -> (Self, ThreadGroupJoinHandle) {
        let (send, recv) = mpsc::channel();

        let state = Arc::new(Mutex::new(State {
            threads: Slab::new(),
            cur_thread_id: None,
            shutting_down: false,
            panicking: false,
            result_send: send,
            sched,
        }));

        (Self { state }, ThreadGroupJoinHandle { result_recv: recv })
    }
}

impl ThreadGroupJoinHandle {
    /// Wait for the thread group to shut down.
    pub fn join(self) -> Result<()> {
        self.result_recv.recv().unwrap()
    }
}

impl<Sched: Scheduler + ?Sized> ThreadGroup<Sched> {
    /// Acquire a lock on the thread group's state.
    pub fn lock(&self) -> ThreadGroupLockGuard<'_, Sched> {
        ThreadGroupLockGuard {
            state_ref: &self.state,
            guard: lock_state(&self.state),
        }
    }
}

fn lock_state<Sched: ?Sized>(state: &Arc<Mutex<State<Sched>>>) -> MutexGuard<'_, State<Sched>> {
    // A worker panic is propagated through the result channel, not through
    // lock poisoning.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl<'a, Sched: Scheduler> ThreadGroupLockGuard<'a, Sched> {
    /// Start a worker thread.
    ///
    /// This does not automatically schedule the spawned thread. You should
    /// store the obtained `ThreadId` in the contained `Sched:`[`Scheduler`]
    /// and have it chosen by [`Scheduler::choose_next_thread`] for the
    /// thread to actually run.
    pub fn spawn(&mut self, f: impl FnOnce(ThreadId) + Send + 'static) -> ThreadId {
        if self.guard.shutting_down {
            panic!("thread group is shutting down");
        }

        let state: Arc<Mutex<State<dyn Scheduler>>> = self.state_ref.clone();

        // Allocate a `ThreadId`
        let entry = self.guard.threads.vacant_entry();
        let thread_id = ThreadId(entry.key());

        let join_handle = threading::spawn(move || {
            TLB.with(|cell| {
                *cell.borrow_mut() = Some(ThreadLocalBlock {
                    thread_id,
                    state: Arc::clone(&state),
                })
            });

            // Block the spawned thread until scheduled to run
            threading::park();

            // Call the thread entry point
            let result = catch_unwind(AssertUnwindSafe(move || {
                f(thread_id);
            }));

            match result {
                Ok(()) => {
                    // The entry point returned; retire this thread.
                    finalize_thread(state, thread_id, Ok(()));
                    park_forever();
                }
                Err(payload) => {
                    // Propagate the panic to the thread group's owner and die.
                    finalize_thread(state, thread_id, Err(payload));
                }
            }
        });

        entry.insert(WorkerThread {
            thread: join_handle.thread().clone(),
        });

        log::trace!("created {thread_id:?}");

        thread_id
    }

    /// Preempt the thread group to let the scheduler decide the next thread
    /// to run.
    ///
    /// Calling this method from a worker thread is not allowed.
    pub fn preempt(&mut self) {
        assert!(
            TLB.with(|cell| cell.borrow().is_none()),
            "this method cannot be called from a worker thread"
        );

        let guard = &mut *self.guard;
        if guard.shutting_down || guard.panicking {
            return;
        }

        log::trace!("preempting {:?}", guard.cur_thread_id);
        if let Some(thread_id) = guard.cur_thread_id {
            guard.threads[thread_id.0].thread.remote_park();
        }

        guard.unpark_next_thread();
    }

    /// Initiate shutdown: stop scheduling threads and release
    /// [`ThreadGroupJoinHandle::join`]. Worker threads stay parked forever.
    pub fn shutdown(&mut self) {
        if self.guard.shutting_down {
            return;
        }
        log::trace!("shutdown requested");
        self.guard.shutting_down = true;

        // Ignore if the receiver has already hung up
        let _ = self.guard.result_send.send(Ok(()));
    }

    /// Record that a worker thread is panicking, which stops preemption so
    /// the unwind can reach [`finalize_thread`].
    pub fn mark_panicking(&mut self) {
        self.guard.panicking = true;
    }

    pub fn is_panicking(&self) -> bool {
        self.guard.panicking
    }
}

impl<'a, Sched: Scheduler + ?Sized> ThreadGroupLockGuard<'a, Sched> {
    /// Get a mutable reference to the contained `Sched: `[`Scheduler`].
    pub fn scheduler(&mut self) -> &mut Sched {
        &mut self.guard.sched
    }
}

impl<Sched: Scheduler + ?Sized> State<Sched> {
    /// Find the next thread to run and unpark that thread.
    fn unpark_next_thread(&mut self) {
        if self.shutting_down || self.panicking {
            return;
        }

        self.cur_thread_id = self.sched.choose_next_thread();
        log::trace!("scheduling {:?}", self.cur_thread_id);
        if let Some(thread_id) = self.cur_thread_id {
            self.threads[thread_id.0].thread.unpark();
        }
    }
}

/// Voluntarily yield the processor to let the scheduler decide the next
/// thread to run.
///
/// Panics if the current thread is not a worker thread of some
/// [`ThreadGroup`].
pub fn yield_now() {
    let thread_group: Arc<Mutex<State<dyn Scheduler>>> = TLB
        .with(|cell| {
            cell.borrow()
                .as_ref()
                .map(|tlb| Arc::clone(&tlb.state))
        })
        .expect("current thread does not belong to a thread group");

    {
        let mut state_guard = lock_state(&thread_group);
        log::trace!("{:?} yielded the processor", state_guard.cur_thread_id);
        state_guard.unpark_next_thread();
    }

    // Block the thread until scheduled to run. This might end immediately if
    // the current thread is the next thread to run.
    threading::park();
}

/// Terminate the current worker thread: remove it from the group, invoke the
/// scheduler, and park the underlying OS thread for good.
///
/// Panics if the current thread is not a worker thread of some
/// [`ThreadGroup`].
pub fn exit_thread() -> ! {
    let (thread_id, thread_group) = TLB
        .with(|cell| {
            cell.borrow()
                .as_ref()
                .map(|tlb| (tlb.thread_id, Arc::clone(&tlb.state)))
        })
        .expect("current thread does not belong to a thread group");

    finalize_thread(thread_group, thread_id, Ok(()));
    park_forever()
}

/// Park forever. The underlying OS thread is kept around (parked) because
/// portable in-place thread termination does not exist.
pub fn park_forever() -> ! {
    loop {
        threading::park();
    }
}

/// Mark the specified thread as exited.
fn finalize_thread(
    thread_group: Arc<Mutex<State<dyn Scheduler>>>,
    thread_id: ThreadId,
    result: Result<()>,
) {
    log::trace!("{thread_id:?} exited with result {result:?}");

    let mut state_guard = lock_state(&thread_group);
    state_guard.sched.thread_exited(thread_id);
    state_guard.threads.remove(thread_id.0);

    if let Err(e) = result {
        // Send the panic payload to the thread group's owner. Leave other
        // threads parked because there's no way to terminate them safely.
        state_guard.panicking = true;
        let _ = state_guard.result_send.send(Err(e));
        return;
    }

    // Invoke the scheduler
    state_guard.unpark_next_thread();
}

/// Get the current worker thread.
pub fn current_thread() -> Option<ThreadId> {
    TLB.with(|cell| cell.borrow().as_ref().map(|tlb| tlb.thread_id))
}

/// Mark the containing thread group of the calling worker thread as
/// panicking. Called from a panic hook, before unwinding begins.
pub fn mark_current_group_panicking() {
    let thread_group = TLB.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|tlb| Arc::clone(&tlb.state))
    });
    if let Some(thread_group) = thread_group {
        lock_state(&thread_group).panicking = true;
    }
}
