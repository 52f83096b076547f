//! Virtual-time preemption: the quantum timer, its signal, and the mask
//! discipline that makes scheduler access atomic with respect to it.

use std::io;
use std::ptr;
use std::time::Duration;

use conquer_once::noblock::OnceCell;
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

use crate::error::fatal;

/// The signal that ends a quantum. `ITIMER_VIRTUAL` measures the
/// process's own CPU time, so a descheduled process does not burn
/// quantums.
const PREEMPT_SIGNAL: Signal = Signal::SIGVTALRM;

/// Quantum length in microseconds, fixed at init.
static QUANTUM_MICROS: OnceCell<u64> = OnceCell::uninit();

fn preempt_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(PREEMPT_SIGNAL);
    set
}

/// Masks the preemption signal for as long as it is alive and restores
/// the previous mask on drop, on every exit path, error returns and
/// resumption after a suspension included.
pub(crate) struct MaskGuard {
    saved: SigSet,
}

impl MaskGuard {
    pub(crate) fn block() -> Self {
        let mut saved = SigSet::empty();
        if let Err(err) = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&preempt_set()), Some(&mut saved))
        {
            fatal(format_args!("cannot mask the preemption signal: {err}"));
        }
        Self { saved }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        if let Err(err) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None) {
            fatal(format_args!("cannot restore the signal mask: {err}"));
        }
    }
}

/// Install `handler` for the preemption signal. The signal is masked
/// while the handler runs; no other flags are requested.
pub(crate) fn install(handler: extern "C" fn(libc::c_int)) {
    let action = SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), SigSet::empty());
    if let Err(err) = unsafe { sigaction(PREEMPT_SIGNAL, &action) } {
        fatal(format_args!("cannot install the preemption handler: {err}"));
    }
}

/// Fix the quantum length. Called once, from init.
pub(crate) fn set_quantum(quantum: Duration) {
    QUANTUM_MICROS
        .try_init_once(|| quantum.as_micros() as u64)
        .expect("quantum configured twice");
}

/// (Re)arm the periodic virtual timer for a full quantum from now. The
/// handler never calls this (the timer is periodic); out-of-band switches
/// do, so the incoming thread gets a full slice.
pub(crate) fn arm() {
    let micros = *QUANTUM_MICROS.try_get().expect("timer armed before init");
    let interval = libc::timeval {
        tv_sec: (micros / 1_000_000) as libc::time_t,
        tv_usec: (micros % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    if unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, ptr::null_mut()) } < 0 {
        fatal(format_args!(
            "cannot arm the quantum timer: {}",
            io::Error::last_os_error()
        ));
    }
}
