//! The public operations of the thread library and the context-switch
//! engine behind them.
//!
//! Every stateful operation brackets its body with [`preempt::MaskGuard`]
//! so the quantum signal cannot fire mid-mutation; the timer handler is
//! the only other entrant and runs with the signal implicitly masked.
//! Between the two, every access to [`SCHEDULER`] is serialized without
//! the spin lock ever being contended.

pub mod context;
pub mod preempt;
pub mod scheduler;
pub mod thread;

pub use thread::ThreadId;

use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{error, trace};

use crate::error::{fatal, Error, Result};

use self::preempt::MaskGuard;
use self::scheduler::Scheduler;
use self::thread::Thread;

/// All scheduler bookkeeping. Lockers mask the preemption signal first,
/// and the handler runs only while the signal is deliverable, so no
/// locker is ever interrupted by the only other entrant.
static SCHEDULER: spin::Mutex<Option<Scheduler>> = spin::Mutex::new(None);

/// Mirror of the running thread's id, written only inside masked critical
/// sections, read lock-free by [`current_thread`].
static CURRENT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

/// Quantum starts since init, the init quantum included. Same discipline
/// as [`CURRENT_THREAD_ID`].
static TOTAL_QUANTUMS: AtomicUsize = AtomicUsize::new(0);

/// Report a misuse on the diagnostic stream and hand the error back.
fn misuse(err: Error) -> Error {
    error!("thread library error: {err}");
    err
}

/// Run `f` against the scheduler. Callers must hold a [`MaskGuard`].
fn with_scheduler<T>(f: impl FnOnce(&mut Scheduler) -> T) -> Result<T> {
    let mut slot = SCHEDULER.lock();
    match slot.as_mut() {
        Some(scheduler) => Ok(f(scheduler)),
        None => Err(misuse(Error::NotInitialized)),
    }
}

/// Start the thread library: create the record for the already-running
/// main thread, install the preemption handler, and arm the periodic
/// quantum timer. Called once per process, before any other operation.
///
/// The main thread's first quantum starts here, so [`total_quantums`]
/// reads 1 immediately after.
pub fn init(quantum: Duration) -> Result<()> {
    if quantum.as_micros() == 0 {
        return Err(misuse(Error::InvalidQuantum));
    }
    let _mask = MaskGuard::block();
    let mut slot = SCHEDULER.lock();
    if slot.is_some() {
        return Err(misuse(Error::AlreadyInitialized));
    }
    preempt::set_quantum(quantum);
    preempt::install(quantum_tick);
    *slot = Some(Scheduler::new());
    CURRENT_THREAD_ID.store(ThreadId::MAIN.as_usize(), Ordering::Release);
    TOTAL_QUANTUMS.store(1, Ordering::Release);
    preempt::arm();
    trace!("initialized with a quantum of {quantum:?}");
    Ok(())
}

/// Create a thread that will enter `entry` on its own stack and file it
/// at the tail of the ready queue. Returns the lowest free id.
///
/// An entry function that returns instead of terminating itself is
/// terminated on its behalf.
pub fn spawn(entry: fn()) -> Result<ThreadId> {
    let _mask = MaskGuard::block();
    let created = with_scheduler(|s| {
        s.reap();
        s.create_thread(entry, thread_trampoline)
    })?;
    match created {
        Some(id) => {
            trace!("spawned thread {id}");
            Ok(id)
        }
        None => Err(misuse(Error::AtCapacity)),
    }
}

/// Destroy the thread with `id` and release everything it owns.
/// Terminating the main thread exits the process with success; a thread
/// terminating itself does not return.
pub fn terminate(id: ThreadId) -> Result<()> {
    let _mask = MaskGuard::block();
    if id == ThreadId::MAIN {
        process::exit(0);
    }
    if !with_scheduler(|s| s.contains(id))? {
        return Err(misuse(Error::UnknownThread(id)));
    }
    trace!("terminating thread {id}");
    if current_thread() == id {
        // The record owns the stack being jumped off of; the hook parks
        // it in the graveyard after the processor has moved on, and the
        // next switch reaps it from another stack.
        switch_mid_quantum(|s, outgoing| s.retire(outgoing));
    } else {
        with_scheduler(|s| {
            s.terminate(id);
        })?;
    }
    Ok(())
}

/// Suspend the thread with `id` until [`resume`]. A thread blocking
/// itself gives up the processor immediately. Blocking an already
/// blocked thread is a no-op success; blocking the main thread is an
/// error.
pub fn block(id: ThreadId) -> Result<()> {
    let _mask = MaskGuard::block();
    if id == ThreadId::MAIN {
        return Err(misuse(Error::BlockMain));
    }
    if !with_scheduler(|s| s.contains(id))? {
        return Err(misuse(Error::UnknownThread(id)));
    }
    if current_thread() == id {
        switch_mid_quantum(|s, outgoing| s.block(outgoing));
    } else {
        with_scheduler(|s| s.block(id))?;
    }
    Ok(())
}

/// Lift an explicit block. Resuming a running, ready, or mutex-waiting
/// thread is a no-op success.
pub fn resume(id: ThreadId) -> Result<()> {
    let _mask = MaskGuard::block();
    if with_scheduler(|s| s.resume(id))? {
        Ok(())
    } else {
        Err(misuse(Error::UnknownThread(id)))
    }
}

/// Acquire the process-wide mutex, waiting in line while another thread
/// holds it. Locking a mutex the caller already holds is an error.
pub fn mutex_lock() -> Result<()> {
    let _mask = MaskGuard::block();
    let me = with_scheduler(|s| s.current_id())?;
    if with_scheduler(|s| s.mutex_holder())? == Some(me) {
        return Err(misuse(Error::MutexAlreadyOwned));
    }
    // Re-check after every wakeup: being readied by a release is not a
    // grant of ownership.
    while with_scheduler(|s| s.mutex_holder().is_some())? {
        switch_mid_quantum(|s, outgoing| s.wait_for_mutex(outgoing));
    }
    with_scheduler(|s| s.lock_mutex(me))?;
    Ok(())
}

/// Release the mutex and ready the first waiter in line that is not
/// blocked. Releasing a mutex the caller does not hold is an error.
pub fn mutex_unlock() -> Result<()> {
    let _mask = MaskGuard::block();
    with_scheduler(|s| {
        if s.mutex_holder() != Some(s.current_id()) {
            Err(Error::MutexNotOwned)
        } else {
            s.unlock_mutex();
            Ok(())
        }
    })?
    .map_err(misuse)
}

/// Id of the calling thread. Lock-free: the mirror is written only
/// inside masked critical sections.
#[must_use]
pub fn current_thread() -> ThreadId {
    ThreadId::new(CURRENT_THREAD_ID.load(Ordering::Acquire))
}

/// Quantum starts since [`init`], including the init quantum and the one
/// in progress. Lock-free.
#[must_use]
pub fn total_quantums() -> usize {
    TOTAL_QUANTUMS.load(Ordering::Acquire)
}

/// Quantums the thread with `id` has spent running, including the one in
/// progress if `id` is the caller. Freshly spawned threads that have
/// never run report 0.
pub fn quantums(id: ThreadId) -> Result<usize> {
    let _mask = MaskGuard::block();
    with_scheduler(|s| s.thread(id).map(Thread::quantums))?
        .ok_or_else(|| misuse(Error::UnknownThread(id)))
}

/// Move the processor to the head of the ready queue.
///
/// Charges the new quantum, advances the current id, runs `after_save`
/// to file the outgoing thread wherever it belongs (ready tail, blocked
/// set, mutex line, or the graveyard), and jumps. The hook sees the
/// scheduler after the current id has advanced, so retiring the outgoing
/// thread cannot free the structures the switch still needs. Returns
/// when a later switch resumes the outgoing thread.
///
/// Callers hold the preemption mask and must not hold the scheduler
/// lock. Precondition: some thread is ready; a thread abandoning the
/// processor with nobody left to take it is a deadlock.
fn switch_threads(after_save: impl FnOnce(&mut Scheduler, ThreadId)) {
    let (from, to) = {
        let mut slot = SCHEDULER.lock();
        let s = slot.as_mut().expect("context switch before init");
        s.reap();
        TOTAL_QUANTUMS.fetch_add(1, Ordering::Release);
        let outgoing = s.current_id();
        let Some(next) = s.pop_next_running() else {
            fatal("every thread is blocked or waiting; nothing left to run");
        };
        CURRENT_THREAD_ID.store(next.as_usize(), Ordering::Release);
        after_save(s, outgoing);
        s.current_thread_mut().start_quantum();
        // Raw pointers survive the lock: the mask keeps every other
        // mutator out until the jump below completes.
        let to = s
            .thread(next)
            .expect("incoming thread has no record")
            .context_ptr();
        let from = s.thread_mut(outgoing).map(Thread::context_mut_ptr);
        (from, to)
    };
    match from {
        Some(from) => unsafe { context::swap(from, to) },
        // the outgoing thread retired itself; there is nowhere to save
        None => unsafe { context::jump(to) },
    }
}

/// A switch outside the timer handler: restart the quantum clock first so
/// the incoming thread gets a full slice.
fn switch_mid_quantum(after_save: impl FnOnce(&mut Scheduler, ThreadId)) {
    preempt::arm();
    switch_threads(after_save);
}

/// First frame of every spawned thread. Looks up the entry function
/// under the mask, runs it unmasked, and terminates the thread if the
/// entry returns instead of terminating itself.
extern "C" fn thread_trampoline() {
    let entry = {
        let _mask = MaskGuard::block();
        with_scheduler(|s| s.current_thread_mut().entry()).ok().flatten()
    };
    if let Some(entry) = entry {
        entry();
    }
    let _ = terminate(current_thread());
    fatal("terminate of the calling thread returned");
}

/// `SIGVTALRM` handler: a quantum has elapsed. Runs with the signal
/// masked, so the scheduler lock is necessarily free. Allocates nothing,
/// logs nothing, and never re-arms the periodic timer.
extern "C" fn quantum_tick(_signal: libc::c_int) {
    {
        let mut slot = SCHEDULER.try_lock().expect("scheduler locked during preemption");
        let Some(s) = slot.as_mut() else { return };
        if !s.has_ready() {
            // Nobody else wants the processor: the running thread starts
            // its next quantum in place.
            TOTAL_QUANTUMS.fetch_add(1, Ordering::Release);
            s.current_thread_mut().start_quantum();
            return;
        }
    }
    switch_threads(|s, outgoing| s.enqueue_ready(outgoing));
}
