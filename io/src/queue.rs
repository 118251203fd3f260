use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::{backend::Waker, runtime::LoopHandle};

/// Upper bound of queued work items executed per loop iteration. Keeps a
/// busy producer from starving timers and socket events.
pub(crate) const MAX_WORK_PER_TICK: usize = 1024;

pub(crate) enum Work {
    /// Closure queued from an arbitrary thread. Receives the loop handle
    /// when it runs, so workers can reach back into the loop.
    Call(Box<dyn FnOnce(&LoopHandle) + Send + 'static>),
    /// Resume the task with the given id.
    Resume(usize),
}

/// Same-thread work item. No `Send` bound.
pub(crate) enum LocalWork {
    Call(Box<dyn FnOnce(&LoopHandle) + 'static>),
    Resume(usize),
}

/// Multi-producer handle into the loop's work queue.
///
/// Cloneable and sendable to any thread. Every enqueue wakes the backend so
/// a blocked poll observes the new work promptly. Items execute on the loop
/// thread in enqueue order.
#[derive(Clone)]
pub struct WorkSender {
    tx: Sender<Work>,
    waker: Arc<Waker>,
}

impl WorkSender {
    /// Queue a closure for execution on the loop thread.
    ///
    /// Returns `false` when the loop is gone and the item was dropped.
    pub fn send(&self, f: impl FnOnce(&LoopHandle) + Send + 'static) -> bool {
        self.send_work(Work::Call(Box::new(f)))
    }

    pub(crate) fn send_work(&self, work: Work) -> bool {
        let sent = self.tx.send(work).is_ok();
        if sent {
            self.waker.wake();
        }
        sent
    }
}

pub(crate) fn work_channel(waker: Arc<Waker>) -> (WorkSender, Receiver<Work>) {
    let (tx, rx) = unbounded();
    (WorkSender { tx, waker }, rx)
}
