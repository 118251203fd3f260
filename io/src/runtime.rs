use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt, io,
    rc::Rc,
    time::Duration,
};

use crossbeam_channel::Receiver;
use slab::Slab;
use tracing::{error, trace};

use crate::{
    backend::{ActiveKind, Backend, BackendKind, RawEvent},
    handle::Trampoline,
    net,
    queue::{self, LocalWork, MAX_WORK_PER_TICK, Work, WorkSender},
    task::{self, TaskSlot},
    time::Clock,
    timer::{self, TimerHeap},
};

/// Loop construction parameters.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    /// Upper bound for a blocking poll when no timer is due. Bounds how
    /// long a missed wakeup can delay cross-thread work.
    pub poll_ceiling: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            poll_ceiling: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run until stopped or nothing keeps the loop alive.
    Default,
    /// One poll cycle, blocking for events.
    Once,
    /// One poll cycle with a zero timeout.
    NoWait,
}

#[derive(Debug)]
pub enum LoopError {
    /// `run` was called from inside `run`.
    AlreadyRunning,
    /// The backend failed in a way no handle can recover from.
    Backend(io::Error),
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => f.write_str("event loop is already running"),
            Self::Backend(e) => write!(f, "backend failure: {e}"),
        }
    }
}

impl std::error::Error for LoopError {}

/// Shared loop state. Handles hold an `Rc` to it; everything here is only
/// touched from the loop thread except the work queue and the waker.
pub(crate) struct Core {
    clock: Clock,
    now_us: Cell<u64>,
    poll_ceiling: Duration,
    pub(crate) backend: RefCell<Backend>,
    pub(crate) timers: RefCell<TimerHeap>,
    pub(crate) trampolines: RefCell<Slab<Trampoline>>,
    pub(crate) tasks: RefCell<Slab<TaskSlot>>,
    work_rx: Receiver<Work>,
    work_tx: WorkSender,
    local_work: RefCell<VecDeque<LocalWork>>,
    closing: RefCell<Vec<Box<dyn FnOnce()>>>,
    /// Strong references to active handles. A started handle stays alive
    /// through its callbacks even when the caller dropped every clone.
    pub(crate) keepalive: RefCell<Slab<Rc<dyn std::any::Any>>>,
    /// Handle cores released from `keepalive` while their `RefCell` may
    /// still be borrowed. Swept once per iteration, with no borrows held.
    graveyard: RefCell<Vec<Rc<dyn std::any::Any>>>,
    active_handles: Cell<usize>,
    refs: Cell<usize>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
}

impl Core {
    #[inline]
    pub fn now_micros(&self) -> u64 {
        self.now_us.get()
    }

    pub fn update_time(&self) {
        self.now_us.set(self.clock.now_micros());
    }

    pub fn adjust_active(&self, delta: isize) {
        let n = self.active_handles.get();
        self.active_handles.set(n.checked_add_signed(delta).unwrap_or(0));
    }

    pub fn work_sender(&self) -> WorkSender {
        self.work_tx.clone()
    }

    pub fn queue_local(&self, work: LocalWork) {
        self.local_work.borrow_mut().push_back(work);
    }

    pub fn push_closing(&self, reap: Box<dyn FnOnce()>) {
        self.closing.borrow_mut().push(reap);
    }

    pub fn defer_drop(&self, rc: Rc<dyn std::any::Any>) {
        self.graveyard.borrow_mut().push(rc);
    }

    pub fn backend_kind(&self) -> ActiveKind {
        self.backend.borrow().kind()
    }

    fn add_ref(&self) {
        self.refs.set(self.refs.get() + 1);
    }

    fn release_ref(&self) {
        self.refs.set(self.refs.get().saturating_sub(1));
    }
}

/// Keeps the loop alive while held, independent of any handle. Acquired
/// through [`LoopHandle::keep_alive`]; dropping it releases the reference,
/// saturating at zero.
pub struct LoopRef {
    core: Rc<Core>,
}

impl Clone for LoopRef {
    fn clone(&self) -> Self {
        self.core.add_ref();
        Self {
            core: self.core.clone(),
        }
    }
}

impl Drop for LoopRef {
    fn drop(&mut self) {
        self.core.release_ref();
    }
}

/// Cheap clonable reference to a loop, used to create handles and spawn
/// coroutines. Not sendable: handles belong to the loop thread.
#[derive(Clone)]
pub struct LoopHandle {
    core: Rc<Core>,
}

impl LoopHandle {
    pub(crate) fn core(&self) -> &Rc<Core> {
        &self.core
    }

    /// Current loop time in microseconds.
    pub fn now_micros(&self) -> u64 {
        self.core.now_micros()
    }

    /// Spawn a coroutine. Its first poll is queued, not run inline.
    pub fn spawn(&self, fut: impl std::future::Future<Output = ()> + 'static) {
        task::spawn(&self.core, fut);
    }

    /// Queue same-thread work for the next work-drain phase.
    pub fn queue_local(&self, f: impl FnOnce(&LoopHandle) + 'static) {
        self.core.queue_local(LocalWork::Call(Box::new(f)));
    }

    /// Cross-thread submission channel into this loop.
    pub fn work_sender(&self) -> WorkSender {
        self.core.work_sender()
    }

    pub fn keep_alive(&self) -> LoopRef {
        self.core.add_ref();
        LoopRef {
            core: self.core.clone(),
        }
    }

    /// Ask the loop to return from `run` at the end of the current
    /// iteration.
    pub fn stop(&self) {
        self.core.stop_requested.set(true);
    }
}

/// The event loop. Owns the backend, the timer heap, the work queue and
/// every handle created from its [`LoopHandle`].
pub struct EventLoop {
    core: Rc<Core>,
}

impl EventLoop {
    pub fn new(config: Config) -> io::Result<Self> {
        let backend = Backend::new(config.backend)?;
        let waker = backend.waker();
        let (work_tx, work_rx) = queue::work_channel(waker);
        let clock = Clock::new();
        let now = clock.now_micros();

        Ok(Self {
            core: Rc::new(Core {
                clock,
                now_us: Cell::new(now),
                poll_ceiling: config.poll_ceiling,
                backend: RefCell::new(backend),
                timers: RefCell::new(TimerHeap::new()),
                trampolines: RefCell::new(Slab::new()),
                tasks: RefCell::new(Slab::new()),
                work_rx,
                work_tx,
                local_work: RefCell::new(VecDeque::new()),
                closing: RefCell::new(Vec::new()),
                keepalive: RefCell::new(Slab::new()),
                graveyard: RefCell::new(Vec::new()),
                active_handles: Cell::new(0),
                refs: Cell::new(0),
                running: Cell::new(false),
                stop_requested: Cell::new(false),
            }),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            core: self.core.clone(),
        }
    }

    pub fn work_sender(&self) -> WorkSender {
        self.core.work_sender()
    }

    pub fn now_micros(&self) -> u64 {
        self.core.now_micros()
    }

    pub fn update_time(&self) {
        self.core.update_time();
    }

    pub fn spawn(&self, fut: impl std::future::Future<Output = ()> + 'static) {
        task::spawn(&self.core, fut);
    }

    pub fn stop(&self) {
        self.core.stop_requested.set(true);
    }

    /// Drive the loop.
    ///
    /// `Default` returns once nothing keeps the loop alive: no active
    /// handles, no queued work, no armed timers, no closing handles and no
    /// outstanding [`LoopRef`]s. `Once` and `NoWait` perform a single
    /// iteration.
    pub fn run(&mut self, mode: RunMode) -> Result<(), LoopError> {
        if self.core.running.get() {
            return Err(LoopError::AlreadyRunning);
        }
        self.core.running.set(true);
        self.core.stop_requested.set(false);
        let result = self.run_inner(mode);
        self.core.running.set(false);
        result
    }

    fn run_inner(&self, mode: RunMode) -> Result<(), LoopError> {
        let core = &self.core;
        let mut events: Vec<RawEvent> = Vec::with_capacity(256);

        loop {
            core.update_time();
            timer::run_timers(core);
            drain_work(core);

            if core.stop_requested.get() {
                return Ok(());
            }
            let is_alive = alive(core);
            if !is_alive && mode == RunMode::Default {
                return Ok(());
            }

            let timeout = if !is_alive {
                Some(Duration::ZERO)
            } else {
                poll_timeout(core, mode)
            };

            trace!(target: "strand_loop", ?timeout, "polling backend");
            core.backend.borrow_mut().poll(timeout, &mut events).map_err(|e| {
                error!(target: "strand_loop", error = %e, "backend poll failed, stopping loop");
                LoopError::Backend(e)
            })?;
            core.update_time();

            dispatch(core, &mut events);
            reap_closing(core);
            core.graveyard.borrow_mut().clear();

            match mode {
                RunMode::Default => {
                    if core.stop_requested.get() || !alive(core) {
                        return Ok(());
                    }
                }
                RunMode::Once | RunMode::NoWait => {
                    // Fire timers that came due while polling so a single
                    // `Once` cycle observes them.
                    core.update_time();
                    timer::run_timers(core);
                    return Ok(());
                }
            }
        }
    }
}

fn alive(core: &Rc<Core>) -> bool {
    core.active_handles.get() > 0
        || core.refs.get() > 0
        || !core.local_work.borrow().is_empty()
        || !core.work_rx.is_empty()
        || core.timers.borrow().has_live()
        || !core.closing.borrow().is_empty()
}

fn poll_timeout(core: &Rc<Core>, mode: RunMode) -> Option<Duration> {
    if mode == RunMode::NoWait {
        return Some(Duration::ZERO);
    }
    if !core.local_work.borrow().is_empty()
        || !core.work_rx.is_empty()
        || !core.closing.borrow().is_empty()
    {
        return Some(Duration::ZERO);
    }
    if let Some(deadline) = core.timers.borrow().next_deadline() {
        return Some(Duration::from_micros(deadline.saturating_sub(core.now_micros())));
    }
    Some(core.poll_ceiling)
}

fn drain_work(core: &Rc<Core>) {
    let handle = LoopHandle { core: core.clone() };
    let mut budget = MAX_WORK_PER_TICK;

    while budget > 0 {
        let item = core.local_work.borrow_mut().pop_front();
        match item {
            Some(LocalWork::Call(f)) => f(&handle),
            Some(LocalWork::Resume(id)) => task::poll_task(core, id),
            None => break,
        }
        budget -= 1;
    }
    while budget > 0 {
        match core.work_rx.try_recv() {
            Ok(Work::Call(f)) => f(&handle),
            Ok(Work::Resume(id)) => task::poll_task(core, id),
            Err(_) => break,
        }
        budget -= 1;
    }
}

fn dispatch(core: &Rc<Core>, events: &mut Vec<RawEvent>) {
    for event in events.drain(..) {
        match event {
            RawEvent::Ready { token, events } => {
                let trampoline = core.trampolines.borrow().get(token).cloned();
                match trampoline {
                    Some(Trampoline::Tcp(weak)) => {
                        if let Some(rc) = weak.upgrade() {
                            net::tcp::on_ready(rc, events);
                        }
                    }
                    Some(Trampoline::Udp(weak)) => {
                        if let Some(rc) = weak.upgrade() {
                            net::udp::on_ready(rc, events);
                        }
                    }
                    None => trace!(target: "strand_loop", token, "event for released dispatch key"),
                }
            }
            #[cfg(feature = "io-uring")]
            RawEvent::Complete { token, op } => {
                let trampoline = core.trampolines.borrow().get(token).cloned();
                match trampoline {
                    Some(Trampoline::Tcp(weak)) => {
                        if let Some(rc) = weak.upgrade() {
                            net::tcp::on_complete(rc, op);
                        }
                    }
                    // UDP never submits completion ops; its readiness
                    // events arrive through the poll path above.
                    _ => trace!(target: "strand_loop", token, "completion for released dispatch key"),
                }
            }
        }
    }
}

fn reap_closing(core: &Rc<Core>) {
    loop {
        let batch: Vec<Box<dyn FnOnce()>> = std::mem::take(&mut *core.closing.borrow_mut());
        if batch.is_empty() {
            return;
        }
        for reap in batch {
            reap();
        }
    }
}
