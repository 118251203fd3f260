//! Single threaded event loop with non-blocking socket handles.
//!
//! The loop drives a platform backend in either readiness mode (`epoll`) or
//! completion mode (`io_uring`, behind the `io-uring` feature). Handles are
//! callback driven: every asynchronous operation returns immediately and its
//! outcome is delivered through a callback on the loop thread. A small
//! promise/coroutine layer bridges callbacks into `async` tasks resumed on
//! the loop thread only.
//!
//! # Examples
//! ```no_run
//! use strand_io::{Config, EventLoop, RunMode, Timer};
//!
//! let mut event_loop = EventLoop::new(Config::default()).unwrap();
//! let timer = Timer::new(&event_loop.handle());
//! timer.start(std::time::Duration::from_millis(10), None, |t| {
//!     println!("fired");
//!     t.close();
//! });
//! event_loop.run(RunMode::Default).unwrap();
//! ```

mod backend;
mod handle;
mod queue;
mod runtime;
mod task;
mod time;
mod timer;

pub mod net;
pub mod promise;

pub use self::{
    backend::BackendKind,
    handle::HandleKind,
    queue::WorkSender,
    runtime::{Config, EventLoop, LoopError, LoopHandle, LoopRef, RunMode},
    time::Clock,
    timer::Timer,
};

pub use bytes;
