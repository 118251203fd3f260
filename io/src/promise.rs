//! One-shot handoff from an asynchronous completion to a single awaiter.
//!
//! `complete` may be called from any thread; the stored waker routes the
//! resume through the loop's work queue, so the awaiting task continues on
//! the loop thread in a later iteration — never inline inside `complete`,
//! even when `complete` runs on the loop thread itself.

use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

use crate::runtime::{LoopHandle, LoopRef};

/// Returned by [`Promise::complete`] when the promise was already
/// completed. The original outcome is kept; the second one is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyComplete;

impl fmt::Display for AlreadyComplete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("promise already completed")
    }
}

impl std::error::Error for AlreadyComplete {}

/// Snapshot of a promise's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    Pending,
    Ok,
    Err(io::ErrorKind),
}

enum State<T> {
    Pending { waker: Option<Waker> },
    /// `None` once the awaiter consumed the result.
    Complete(Option<Result<T, io::Error>>),
}

/// One-shot container for the outcome of an asynchronous operation.
///
/// Cloneable and sendable; a worker thread keeps one clone to `complete`
/// while a coroutine on the loop awaits the other through
/// [`Promise::wait`].
pub struct Promise<T> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Pending { waker: None })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle the promise. Exactly one resume of the waiting coroutine (if
    /// any) is scheduled onto its loop; a second call is rejected.
    pub fn complete(&self, result: Result<T, io::Error>) -> Result<(), AlreadyComplete> {
        let waker = {
            let mut state = self.lock();
            match *state {
                State::Complete(_) => return Err(AlreadyComplete),
                State::Pending { ref mut waker } => {
                    let waker = waker.take();
                    *state = State::Complete(Some(result));
                    waker
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        matches!(*self.lock(), State::Complete(_))
    }

    pub fn status(&self) -> PromiseStatus {
        match *self.lock() {
            State::Pending { .. } => PromiseStatus::Pending,
            State::Complete(Some(Ok(_))) | State::Complete(None) => PromiseStatus::Ok,
            State::Complete(Some(Err(ref e))) => PromiseStatus::Err(e.kind()),
        }
    }

    /// Await the promise from a coroutine spawned on `handle`'s loop.
    ///
    /// The returned future holds a loop reference from its first pending
    /// poll until it resolves, so a loop with nothing else to do stays
    /// alive for the completion. A promise binds to at most one waiter;
    /// awaiting an already consumed promise resolves to an error.
    pub fn wait(&self, handle: &LoopHandle) -> PromiseFuture<T> {
        PromiseFuture {
            inner: self.inner.clone(),
            handle: handle.clone(),
            loop_ref: None,
        }
    }
}

pub struct PromiseFuture<T> {
    inner: Arc<Mutex<State<T>>>,
    handle: LoopHandle,
    loop_ref: Option<LoopRef>,
}

impl<T> Future for PromiseFuture<T> {
    type Output = Result<T, io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            State::Complete(ref mut result) => {
                let result = result
                    .take()
                    .unwrap_or_else(|| Err(io::Error::other("promise result already taken")));
                drop(state);
                this.loop_ref = None;
                Poll::Ready(result)
            }
            State::Pending { ref mut waker } => {
                *waker = Some(cx.waker().clone());
                drop(state);
                if this.loop_ref.is_none() {
                    this.loop_ref = Some(this.handle.keep_alive());
                }
                Poll::Pending
            }
        }
    }
}
