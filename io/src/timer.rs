use std::{
    cell::RefCell,
    cmp::Reverse,
    collections::BinaryHeap,
    io,
    rc::{Rc, Weak},
    time::Duration,
};

use tracing::trace;

use crate::{
    LoopHandle,
    handle::{HandleBase, HandleKind, Lifecycle, invalid_state},
    runtime::Core,
};

/// Min-heap of armed timers, ordered by absolute deadline with insertion
/// order breaking ties. Stopped timers are removed lazily: stale entries
/// carry an outdated generation and are skipped when popped.
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
    /// Count of currently armed timers. Maintained by the handle
    /// transitions, not the heap, so stale entries do not keep the loop
    /// alive.
    live: usize,
}

struct Entry {
    deadline_us: u64,
    seq: u64,
    generation: u64,
    timer: Weak<RefCell<TimerCore>>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_us == other.deadline_us && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline_us, self.seq).cmp(&(other.deadline_us, other.seq))
    }
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
            live: 0,
        }
    }

    fn push(&mut self, deadline_us: u64, generation: u64, timer: Weak<RefCell<TimerCore>>) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            deadline_us,
            seq,
            generation,
            timer,
        }));
    }

    pub fn has_live(&self) -> bool {
        self.live > 0
    }

    /// Deadline of the nearest heap entry. May belong to a stopped timer,
    /// which at worst wakes the poll early.
    pub fn next_deadline(&self) -> Option<u64> {
        if self.live == 0 {
            return None;
        }
        self.heap.peek().map(|Reverse(e)| e.deadline_us)
    }

    fn adjust_live(&mut self, delta: isize) {
        self.live = self.live.checked_add_signed(delta).unwrap_or(0);
    }
}

/// Fire every timer whose deadline is at or before `now`. Due entries are
/// collected first so a periodic re-arm landing at `now` waits for the next
/// iteration instead of spinning this one.
pub(crate) fn run_timers(core: &Rc<Core>) {
    let now = core.now_micros();
    let mut due = Vec::new();
    {
        let mut timers = core.timers.borrow_mut();
        loop {
            let is_due = matches!(timers.heap.peek(), Some(Reverse(e)) if e.deadline_us <= now);
            if !is_due {
                break;
            }
            if let Some(Reverse(entry)) = timers.heap.pop() {
                due.push(entry);
            }
        }
    }
    for entry in due {
        fire(core, entry);
    }
}

fn fire(core: &Rc<Core>, entry: Entry) {
    let Some(rc) = entry.timer.upgrade() else {
        return;
    };
    let timer = Timer { core: rc };

    let cb = {
        let mut inner = timer.core.borrow_mut();
        if inner.generation != entry.generation || !inner.armed || inner.base.is_closing() {
            return;
        }
        match inner.period_us {
            Some(period) => {
                let deadline = entry.deadline_us + period;
                let generation = inner.generation;
                let weak = Rc::downgrade(&timer.core);
                inner.base.loop_.timers.borrow_mut().push(deadline, generation, weak);
            }
            None => {
                inner.armed = false;
                inner.base.loop_.timers.borrow_mut().adjust_live(-1);
                inner.base.deactivate();
            }
        }
        inner.cb.take()
    };

    let Some(mut cb) = cb else { return };
    cb(&timer);

    let mut inner = timer.core.borrow_mut();
    if inner.cb.is_none() && !inner.base.is_closing() {
        inner.cb = Some(cb);
    }
}

pub(crate) struct TimerCore {
    base: HandleBase,
    period_us: Option<u64>,
    generation: u64,
    armed: bool,
    cb: Option<Box<dyn FnMut(&Timer) + 'static>>,
}

/// One-shot or repeating timer driven by the loop's clock.
///
/// An armed timer is an active handle and keeps the loop alive until it
/// fires (or forever, when repeating) unless stopped or closed.
#[derive(Clone)]
pub struct Timer {
    core: Rc<RefCell<TimerCore>>,
}

impl Timer {
    pub fn new(handle: &LoopHandle) -> Self {
        Self {
            core: Rc::new(RefCell::new(TimerCore {
                base: HandleBase::new(handle.core().clone(), HandleKind::Timer),
                period_us: None,
                generation: 0,
                armed: false,
                cb: None,
            })),
        }
    }

    /// Arm the timer to fire once after `timeout`, then every `period` if
    /// one is given. Re-arming an armed timer replaces its schedule and
    /// callback.
    pub fn start(&self, timeout: Duration, period: Option<Duration>, cb: impl FnMut(&Timer) + 'static) {
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() {
            trace!(target: "strand_timer", "start on closing timer ignored");
            return;
        }
        let loop_ = inner.base.loop_.clone();
        let deadline = loop_.now_micros() + timeout.as_micros() as u64;

        inner.generation += 1;
        if !inner.armed {
            inner.armed = true;
            loop_.timers.borrow_mut().adjust_live(1);
        }
        inner.period_us = period.map(|p| p.as_micros() as u64);
        inner.cb = Some(Box::new(cb));
        let strong = self.core.clone();
        inner.base.activate(move || strong);

        let generation = inner.generation;
        loop_
            .timers
            .borrow_mut()
            .push(deadline, generation, Rc::downgrade(&self.core));
    }

    /// Disarm without closing. The callback is retained for [`Timer::again`].
    pub fn stop(&self) {
        let mut inner = self.core.borrow_mut();
        if inner.armed {
            inner.armed = false;
            inner.generation += 1;
            inner.base.loop_.timers.borrow_mut().adjust_live(-1);
            inner.base.deactivate();
        }
    }

    /// Re-arm a repeating timer from its period.
    pub fn again(&self) -> io::Result<()> {
        let (period, has_cb) = {
            let inner = self.core.borrow();
            (inner.period_us, inner.cb.is_some())
        };
        let Some(period) = period else {
            return Err(invalid_state());
        };
        if !has_cb {
            return Err(invalid_state());
        }

        self.stop();

        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() {
            return Err(invalid_state());
        }
        let loop_ = inner.base.loop_.clone();
        let deadline = loop_.now_micros() + period;
        inner.generation += 1;
        inner.armed = true;
        loop_.timers.borrow_mut().adjust_live(1);
        let strong = self.core.clone();
        inner.base.activate(move || strong);
        let generation = inner.generation;
        loop_
            .timers
            .borrow_mut()
            .push(deadline, generation, Rc::downgrade(&self.core));
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.core.borrow().armed
    }

    pub fn kind(&self) -> crate::HandleKind {
        self.core.borrow().base.kind()
    }

    pub fn close(&self) {
        self.close_with(|_| {});
    }

    /// Close the handle. `cb` runs once, on the loop thread, during the
    /// loop's closing sweep.
    pub fn close_with(&self, cb: impl FnOnce(&Timer) + 'static) {
        self.stop();
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() {
            return;
        }
        inner.base.lifecycle = Lifecycle::Closing;
        inner.cb = None;
        let loop_ = inner.base.loop_.clone();
        drop(inner);

        let timer = self.clone();
        loop_.push_closing(Box::new(move || {
            cb(&timer);
            timer.core.borrow_mut().base.lifecycle = Lifecycle::Closed;
        }));
    }
}
