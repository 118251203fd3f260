//! Cooperative tasks resumed on the loop thread.
//!
//! A spawned future lives in a slab slot; its waker pushes a resume item
//! into the loop's work queue, so resumption always happens during the
//! loop's work-drain phase regardless of which thread woke it.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Wake, Waker},
};

use std::rc::Rc;

use crate::{
    queue::{LocalWork, Work, WorkSender},
    runtime::Core,
};

pub(crate) struct TaskSlot {
    /// Taken out of the slot for the duration of a poll so the callback can
    /// reach the task table reentrantly (spawning, awaiting).
    fut: Option<Pin<Box<dyn Future<Output = ()> + 'static>>>,
}

struct TaskWaker {
    id: usize,
    tx: WorkSender,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.tx.send_work(Work::Resume(self.id));
    }
}

pub(crate) fn spawn(core: &Rc<Core>, fut: impl Future<Output = ()> + 'static) {
    let id = core.tasks.borrow_mut().insert(TaskSlot {
        fut: Some(Box::pin(fut)),
    });
    core.queue_local(LocalWork::Resume(id));
}

pub(crate) fn poll_task(core: &Rc<Core>, id: usize) {
    let fut = {
        let mut tasks = core.tasks.borrow_mut();
        match tasks.get_mut(id) {
            Some(slot) => slot.fut.take(),
            None => return,
        }
    };
    // A second queued resume for the same task while it is mid-poll finds
    // the slot empty and is dropped here.
    let Some(mut fut) = fut else { return };

    let waker = Waker::from(Arc::new(TaskWaker {
        id,
        tx: core.work_sender(),
    }));
    let mut cx = Context::from_waker(&waker);

    match fut.as_mut().poll(&mut cx) {
        Poll::Ready(()) => {
            core.tasks.borrow_mut().try_remove(id);
        }
        Poll::Pending => {
            if let Some(slot) = core.tasks.borrow_mut().get_mut(id) {
                slot.fut = Some(fut);
            }
        }
    }
}
