//! User-space threads multiplexed onto a single OS thread.
//!
//! The library hands out small integer thread ids and round-robin
//! schedules them under a virtual-time quantum: a periodic `SIGVTALRM`
//! preempts the running thread, and a non-local jump moves the processor
//! to the head of the ready queue. Threads can also give up the processor
//! voluntarily by blocking themselves, terminating themselves, or waiting
//! on the process-wide mutex.
//!
//! At most one logical thread executes at any instant, so plain shared
//! state needs no synchronization beyond what the scheduler itself
//! provides. The process hosting the library must keep it on one OS
//! thread; the preemption signal is delivered process-wide.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! fn worker() {
//!     // runs interleaved with every other ready thread
//!     timeslice::terminate(timeslice::current_thread()).unwrap();
//! }
//!
//! timeslice::init(Duration::from_millis(10)).unwrap();
//! let id = timeslice::spawn(worker).unwrap();
//! println!("worker {id} has run {} quantums", timeslice::quantums(id).unwrap());
//! ```

pub mod error;
pub mod threading;

pub use error::{Error, Result};
pub use threading::{
    block, current_thread, init, mutex_lock, mutex_unlock, quantums, resume, spawn, terminate,
    total_quantums, ThreadId,
};

/// Maximum number of simultaneously live threads, the main thread included.
pub const MAX_THREADS: usize = 100;

/// Stack size in bytes handed to each spawned thread.
pub const STACK_SIZE: usize = 64 * 1024;
