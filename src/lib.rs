//! # Stackful fiber scheduler with a readiness reactor
//!
//! `weft` multiplexes stackful fibers over a fixed pool of worker threads.
//! Blocking waits suspend the calling fiber instead of the thread: readiness
//! on a file descriptor or an expiring timer moves the parked fiber back into
//! the ready queue, where any worker resumes it.
//!
//! * [fiber::Fiber] is one coroutine: an mmap'd stack, a saved machine
//!   context and a lifecycle state machine.
//! * [scheduler::Scheduler] dispatches fibers and callbacks, optionally
//!   pinned to a worker, with an optional caller-hosted thread.
//! * [io::IoManager] extends the scheduler with an epoll-style reactor and a
//!   timer manager: [io::IoManager::add_event] parks waiters until readiness,
//!   [io::IoManager::add_timer] schedules one-shot or recurring callbacks.
//!
//! ## Example
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use weft::io::IoManager;
//! use weft::Task;
//!
//! let io_manager = IoManager::new(2, false, "example").unwrap();
//! let counter = Arc::new(AtomicUsize::new(0));
//! let shared = counter.clone();
//! io_manager.schedule(
//!     Task::call(move || {
//!         shared.fetch_add(1, Ordering::SeqCst);
//!     }),
//!     None,
//! );
//! io_manager.stop();
//! assert_eq!(counter.load(Ordering::SeqCst), 1);
//! ```

pub mod fd;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod timer;

pub use fiber::{Fiber, FiberState, StackSize};
pub use io::{Event, IoManager};
pub use scheduler::{Scheduler, Task};
pub use timer::Timer;
