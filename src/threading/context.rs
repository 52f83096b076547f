//! The non-local-jump engine: saving and resuming thread execution
//! contexts through the host's `ucontext` facility.

use std::io;
use std::mem;
use std::ptr;

use crate::error::fatal;

use super::thread::Stack;

/// Saved execution state of one thread: register file, stack pointer,
/// resume address, and signal mask.
pub struct Context {
    // Boxed so the captured state keeps a stable address: glibc's
    // `ucontext_t` points back into itself for the FP save area, and the
    // owning record moves around inside the thread table.
    inner: Box<libc::ucontext_t>,
}

// The raw `ucontext_t` carries pointer fields (`uc_link`, the FP save
// area), which blocks the derived `Send`. Every context lives inside the
// scheduler behind its lock, and the whole thread system runs on the
// process's single OS thread; logical threads never execute concurrently,
// so no context is ever reachable from two OS threads at once.
unsafe impl Send for Context {}

impl Context {
    /// Placeholder for a thread that is already executing; the first
    /// switch away from it fills this in.
    pub fn empty() -> Self {
        Self {
            inner: Box::new(unsafe { mem::zeroed() }),
        }
    }

    /// Capture a context whose first resume enters `entry` at the top of
    /// `stack` with an empty signal mask.
    pub fn initial(stack: &mut Stack, entry: extern "C" fn()) -> Self {
        let mut inner: Box<libc::ucontext_t> = Box::new(unsafe { mem::zeroed() });
        if unsafe { libc::getcontext(&mut *inner) } < 0 {
            fatal(format_args!(
                "cannot capture a thread context: {}",
                io::Error::last_os_error()
            ));
        }
        inner.uc_stack.ss_sp = stack.base();
        inner.uc_stack.ss_size = stack.size();
        inner.uc_stack.ss_flags = 0;
        inner.uc_link = ptr::null_mut();
        unsafe {
            libc::sigemptyset(&mut inner.uc_sigmask);
            libc::makecontext(&mut *inner, entry, 0);
        }
        Self { inner }
    }

    pub(crate) fn as_ptr(&self) -> *const libc::ucontext_t {
        &*self.inner
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::ucontext_t {
        &mut *self.inner
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// Save the running thread into `from` and resume `to`. Returns when a
/// later switch resumes `from`, continuing just after the save with the
/// mask `from` carried at save time.
///
/// # Safety
/// The preemption signal must be masked, and both pointers must stay
/// valid until the jump completes; callers take them under the scheduler
/// lock and jump before anything else can touch the records.
pub unsafe fn swap(from: *mut libc::ucontext_t, to: *const libc::ucontext_t) {
    if libc::swapcontext(from, to) < 0 {
        fatal(format_args!(
            "context switch failed: {}",
            io::Error::last_os_error()
        ));
    }
}

/// Resume `to` without saving the running thread.
///
/// # Safety
/// As [`swap`]; used when the outgoing thread's record no longer exists
/// and there is nowhere to save into.
pub unsafe fn jump(to: *const libc::ucontext_t) -> ! {
    libc::setcontext(to);
    fatal(format_args!(
        "context jump failed: {}",
        io::Error::last_os_error()
    ))
}
