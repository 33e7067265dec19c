//! Threading layer similar to `std::thread` but with token-based parking and
//! a *remote park* operation: any thread can force another one to park, which
//! is what makes asynchronous preemption possible on a hosted system.
//!
//! Unlike `std::thread::park`, a thread can hold multiple park tokens; each
//! `park` consumes exactly one. Tokens travel over a socket pair, which is
//! async-signal-safe, so the remote-park signal handler can park right inside
//! the interrupted context — the hosted equivalent of saving the task state
//! in an interrupt prologue.
use std::{
    cell::Cell,
    mem::MaybeUninit,
    os::raw::c_int,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Once,
    },
    thread,
};

thread_local! {
    static THREAD_DATA: Cell<*const ThreadData> = const { Cell::new(std::ptr::null()) };
}

/// [`std::thread::JoinHandle`] with extra functionalities.
#[derive(Debug)]
pub struct JoinHandle<T> {
    _std_handle: thread::JoinHandle<T>,
    thread: Thread,
}

impl<T> JoinHandle<T> {
    pub fn thread(&self) -> &Thread {
        &self.thread
    }
}

/// [`std::thread::Thread`] with extra functionalities.
#[derive(Debug, Clone)]
pub struct Thread {
    data: Arc<ThreadData>,
}

#[derive(Debug)]
struct ThreadData {
    /// `[token source, token sink]`
    park_sock: [c_int; 2],
    /// The number of outstanding remote-park requests.
    park_count: AtomicUsize,
    pthread_id: AtomicUsize,
}

// Safety: file descriptors and atomics are thread-safe
unsafe impl Send for ThreadData {}
unsafe impl Sync for ThreadData {}

impl ThreadData {
    fn new() -> Self {
        let park_sock = unsafe {
            let mut park_sock = MaybeUninit::<[c_int; 2]>::uninit();
            ok_or_errno(libc::socketpair(
                libc::PF_LOCAL,
                libc::SOCK_STREAM,
                0,
                park_sock.as_mut_ptr() as _,
            ))
            .expect("socketpair failed");
            park_sock.assume_init()
        };

        Self {
            park_sock,
            park_count: AtomicUsize::new(0),
            pthread_id: AtomicUsize::new(0),
        }
    }

    fn set_self(&self) {
        self.pthread_id
            .store(unsafe { libc::pthread_self() } as usize, Ordering::SeqCst);
    }

    /// The FD to read a park token from.
    fn park_sock_token_source(&self) -> c_int {
        self.park_sock[0]
    }

    /// The FD to write a park token to.
    fn park_sock_token_sink(&self) -> c_int {
        self.park_sock[1]
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.park_sock[0]);
            libc::close(self.park_sock[1]);
        }
    }
}

/// Spawn a new thread. The thread's [`ThreadData`] is fully initialized by
/// the time this function returns, so it can immediately be a remote-park
/// target.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    let data = Arc::new(ThreadData::new());
    let data2 = Arc::clone(&data);

    let (ready_send, ready_recv) = mpsc::channel();

    let std_handle = thread::spawn(move || {
        data2.set_self();

        // Publish `ThreadData` for the signal handler. The `Arc` reference
        // is intentionally leaked; worker threads live (parked) until the
        // process exits.
        THREAD_DATA.with(|cell| cell.set(Arc::into_raw(data2)));

        ready_send.send(()).unwrap();
        drop(ready_send);

        f()
    });

    // Wait until the just-spawned thread configures its own `THREAD_DATA`.
    ready_recv.recv().expect("spawned thread died during setup");

    JoinHandle {
        _std_handle: std_handle,
        thread: Thread { data },
    }
}

/// Block the current thread until a park token becomes available, then
/// consume it.
pub fn park() {
    let data_ptr = THREAD_DATA.with(|cell| cell.get());
    assert!(
        !data_ptr.is_null(),
        "this thread wasn't started by `threading::spawn`"
    );
    // Safety: the pointee is leaked, hence valid forever
    park_inner(unsafe { &*data_ptr });
}

fn park_inner(data: &ThreadData) {
    loop {
        // Take the token (blocking)
        match isize_ok_or_errno(unsafe {
            libc::recv(
                data.park_sock_token_source(),
                (&mut 0u8) as *mut _ as _,
                1,
                0,
            )
        }) {
            Ok(1) => {}
            Ok(0) | Err(errno::Errno(libc::EAGAIN)) => {
                // Spurious wakeup; try again.
                continue;
            }
            Err(errno::Errno(libc::EINTR)) => {
                // Interrupted while waiting (e.g. by a nested remote park).
                // Try again.
                continue;
            }
            Ok(i) => panic!("unexpected return value: {i}"),
            Err(e) => panic!("failed to take a park token: {e}"),
        }

        break;
    }
}

impl Thread {
    /// Make a new park token available for the thread.
    pub fn unpark(&self) {
        isize_ok_or_errno(unsafe {
            libc::send(
                self.data.park_sock_token_sink(),
                &0u8 as *const _ as _,
                1,
                0,
            )
        })
        .expect("failed to make a park token");
    }

    /// Force the thread to park, as if it called [`park`] itself at whatever
    /// instruction it is currently executing.
    ///
    /// Returns after the target thread is confirmed to have entered the
    /// signal handler. The result is unspecified if the thread has already
    /// exited.
    pub fn remote_park(&self) {
        static SIGNAL_HANDLER_ONCE: Once = Once::new();
        SIGNAL_HANDLER_ONCE.call_once(register_remote_park_signal_handler);

        let pthread_id = self.data.pthread_id.load(Ordering::SeqCst);

        self.data.park_count.fetch_add(1, Ordering::SeqCst);

        ok_or_errno(unsafe { libc::pthread_kill(pthread_id as libc::pthread_t, SIGNAL_REMOTE_PARK) })
            .expect("pthread_kill failed");

        // Wait until the signal is delivered.
        while self.data.park_count.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }
}

const SIGNAL_REMOTE_PARK: c_int = libc::SIGUSR1;

#[cold]
fn register_remote_park_signal_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = remote_park_signal_handler as usize;
        ok_or_errno(libc::sigaction(
            SIGNAL_REMOTE_PARK,
            &action,
            std::ptr::null_mut(),
        ))
        .expect("sigaction failed");
    }

    extern "C" fn remote_park_signal_handler(_signo: c_int) {
        let current_ptr = THREAD_DATA.with(|cell| cell.get());
        assert!(!current_ptr.is_null());
        // Safety: the pointee is leaked, hence valid forever
        let current = unsafe { &*current_ptr };

        while current.park_count.load(Ordering::SeqCst) != 0 {
            current.park_count.fetch_sub(1, Ordering::SeqCst);

            // Park right here, in the interrupted context.
            park_inner(current);
        }
    }
}

fn isize_ok_or_errno(x: isize) -> Result<isize, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}

fn ok_or_errno(x: c_int) -> Result<c_int, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}
