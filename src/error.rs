//! Error reporting: recoverable misuse reported to the caller, and fatal
//! system failures that end the process.

use std::fmt;
use std::process;

use thiserror::Error;

use crate::threading::ThreadId;

/// Ways a caller can misuse the library. Each is reported on the log's
/// error level before the value is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// `init` was given a zero-length quantum.
    #[error("quantum length must be positive")]
    InvalidQuantum,
    /// Every thread id is taken.
    #[error("no capacity for another thread")]
    AtCapacity,
    /// The id names no live thread.
    #[error("no thread with id {0}")]
    UnknownThread(ThreadId),
    /// The main thread cannot be blocked.
    #[error("the main thread cannot be blocked")]
    BlockMain,
    /// `mutex_lock` by the thread already holding the mutex.
    #[error("mutex is already held by the calling thread")]
    MutexAlreadyOwned,
    /// `mutex_unlock` by a thread that does not hold the mutex.
    #[error("mutex is not held by the calling thread")]
    MutexNotOwned,
    /// A stateful operation was called before `init`.
    #[error("thread library has not been initialized")]
    NotInitialized,
    /// `init` was called a second time.
    #[error("thread library is already initialized")]
    AlreadyInitialized,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// A facility the scheduler cannot run without has failed, or the thread
/// system has reached a state it cannot recover from. Scheduler state is
/// not trustworthy past this point, so diagnose and end the process with
/// failure status.
pub(crate) fn fatal(message: impl fmt::Display) -> ! {
    log::error!("system error: {message}");
    process::exit(1);
}
