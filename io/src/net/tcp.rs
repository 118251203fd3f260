//! Callback driven TCP handle.
//!
//! One state machine, two I/O models. Under the readiness backend the
//! handle performs non-blocking socket calls when the loop reports the fd
//! ready; under the completion backend (`tcp_uring.rs`) it submits
//! operations up front and advances on their completions. The write queue
//! is strict FIFO either way: partial transmissions never reorder requests.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    net::SocketAddr,
    rc::{Rc, Weak},
};

use bytes::{Bytes, BytesMut};
use socket2::{Protocol, Socket, Type};
use tracing::{trace, warn};

use crate::{
    LoopHandle,
    backend::{ActiveKind, Events},
    handle::{HandleBase, HandleKind, Lifecycle, Trampoline, ecanceled, invalid_state, not_connected},
    net::new_socket,
    queue::LocalWork,
};

/// Bytes asked from the kernel per read.
pub(super) const READ_CHUNK: usize = 64 * 1024;

pub(super) type ConnectCb = Box<dyn FnOnce(&Tcp, io::Result<()>) + 'static>;
pub(super) type ConnectionCb = Box<dyn FnMut(&Tcp, io::Result<()>) + 'static>;
pub(super) type ReadCb = Box<dyn FnMut(&Tcp, io::Result<Option<Bytes>>) + 'static>;
pub(super) type WriteCb = Box<dyn FnOnce(&Tcp, io::Result<()>) + 'static>;

pub(super) struct WriteRequest {
    pub(super) buf: Bytes,
    pub(super) written: usize,
    pub(super) cb: Option<WriteCb>,
}

#[cfg(feature = "io-uring")]
pub(super) struct CompletionState {
    pub(super) recv_armed: bool,
    pub(super) inflight_send: Option<WriteRequest>,
    pub(super) accepts_inflight: usize,
    pub(super) pending_accepts: VecDeque<(Socket, Option<SocketAddr>)>,
    /// Recv results that completed while reading was stopped. `None` marks
    /// EOF.
    pub(super) pending_recv: VecDeque<Option<Bytes>>,
}

#[cfg(feature = "io-uring")]
impl CompletionState {
    fn new() -> Self {
        Self {
            recv_armed: false,
            inflight_send: None,
            accepts_inflight: 0,
            pending_accepts: VecDeque::new(),
            pending_recv: VecDeque::new(),
        }
    }
}

pub(crate) struct TcpCore {
    pub(super) base: HandleBase,
    pub(super) self_weak: Weak<RefCell<TcpCore>>,
    pub(super) socket: Option<Socket>,
    pub(super) connected: bool,
    pub(super) connecting: bool,
    pub(super) listening: bool,
    pub(super) reading: bool,
    pub(super) registered: Events,
    pub(super) on_connect: Option<ConnectCb>,
    pub(super) on_connection: Option<ConnectionCb>,
    pub(super) on_read: Option<ReadCb>,
    pub(super) shutdown_cb: Option<WriteCb>,
    pub(super) write_queue: VecDeque<WriteRequest>,
    pub(super) read_buf: BytesMut,
    #[cfg(feature = "io-uring")]
    pub(super) completion: CompletionState,
}

impl TcpCore {
    pub(super) fn is_completion(&self) -> bool {
        self.base.loop_.backend_kind() == ActiveKind::Completion
    }

    pub(super) fn ensure_socket(&mut self, addr: &SocketAddr) -> io::Result<()> {
        if self.socket.is_none() {
            self.socket = Some(new_socket(addr, Type::STREAM, Protocol::TCP)?);
        }
        Ok(())
    }

    fn desired_interest(&self) -> Events {
        let mut events = Events::NONE;
        if self.reading || self.listening {
            events |= Events::READABLE;
        }
        if self.connecting || !self.write_queue.is_empty() {
            events |= Events::WRITABLE;
        }
        events
    }

    /// Reconcile the backend registration with the handle state. Readiness
    /// mode only; the completion paths register work, not interest.
    pub(super) fn sync_interest(&mut self) {
        if self.is_completion() || self.base.is_closing() {
            return;
        }
        let Some(sock) = &self.socket else { return };
        let desired = self.desired_interest();
        if desired == self.registered {
            return;
        }
        use std::os::fd::AsRawFd;
        let fd = sock.as_raw_fd();
        let loop_ = self.base.loop_.clone();
        if desired.is_empty() {
            loop_.backend.borrow_mut().remove(fd);
        } else {
            let weak = self.self_weak.clone();
            let token = self.base.token(|| Trampoline::Tcp(weak));
            if let Err(e) = loop_.backend.borrow_mut().add(fd, token, desired) {
                warn!(target: "strand_tcp", error = %e, "interest update failed");
                return;
            }
        }
        self.registered = desired;
    }

    pub(super) fn has_inflight(&self) -> bool {
        #[cfg(feature = "io-uring")]
        {
            if self.completion.inflight_send.is_some() {
                return true;
            }
        }
        false
    }

    pub(super) fn update_active(&mut self) {
        let busy = !self.base.is_closing()
            && (self.connecting
                || self.listening
                || self.reading
                || self.shutdown_cb.is_some()
                || !self.write_queue.is_empty()
                || self.has_inflight());
        if busy {
            let weak = self.self_weak.clone();
            self.base.activate(move || {
                weak.upgrade().map(|rc| rc as Rc<dyn std::any::Any>).unwrap_or_else(|| Rc::new(()))
            });
        } else {
            self.base.deactivate();
        }
    }
}

/// A TCP stream or listener handle.
///
/// Clones share the same underlying handle. All methods must be called on
/// the loop thread; callbacks run there too.
#[derive(Clone)]
pub struct Tcp {
    pub(super) core: Rc<RefCell<TcpCore>>,
}

impl std::fmt::Debug for Tcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tcp").finish_non_exhaustive()
    }
}

impl Tcp {
    pub fn new(handle: &LoopHandle) -> Self {
        Self::build(handle.core().clone(), None, false)
    }

    pub(super) fn build(loop_: Rc<crate::runtime::Core>, socket: Option<Socket>, connected: bool) -> Self {
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(TcpCore {
                base: HandleBase::new(loop_, HandleKind::Tcp),
                self_weak: weak.clone(),
                socket,
                connected,
                connecting: false,
                listening: false,
                reading: false,
                registered: Events::NONE,
                on_connect: None,
                on_connection: None,
                on_read: None,
                shutdown_cb: None,
                write_queue: VecDeque::new(),
                read_buf: BytesMut::new(),
                #[cfg(feature = "io-uring")]
                completion: CompletionState::new(),
            })
        });
        Self { core }
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() {
            return Err(invalid_state());
        }
        inner.ensure_socket(&addr)?;
        inner.socket_ref()?.bind(&addr.into())
    }

    /// Start listening. `on_connection` fires once per incoming connection;
    /// call [`Tcp::accept`] from it to obtain the connected handle.
    pub fn listen(&self, backlog: u32, on_connection: impl FnMut(&Tcp, io::Result<()>) + 'static) -> io::Result<()> {
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() || inner.connected || inner.connecting {
            return Err(invalid_state());
        }
        inner.socket_ref()?.listen(backlog as i32)?;
        inner.listening = true;
        inner.on_connection = Some(Box::new(on_connection));

        #[cfg(feature = "io-uring")]
        if inner.is_completion() {
            super::tcp_uring::start_accepts(&mut inner);
            inner.update_active();
            return Ok(());
        }

        inner.sync_interest();
        inner.update_active();
        Ok(())
    }

    /// Accept a pending connection. Returns `WouldBlock` until one has
    /// arrived.
    pub fn accept(&self) -> io::Result<Tcp> {
        let mut inner = self.core.borrow_mut();
        if !inner.listening {
            return Err(invalid_state());
        }

        #[cfg(feature = "io-uring")]
        if inner.is_completion() {
            return match inner.completion.pending_accepts.pop_front() {
                Some((socket, _peer)) => Ok(Tcp::build(inner.base.loop_.clone(), Some(socket), true)),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            };
        }

        let (socket, _peer) = inner.socket_ref()?.accept()?;
        socket.set_nonblocking(true)?;
        Ok(Tcp::build(inner.base.loop_.clone(), Some(socket), true))
    }

    pub fn connect(&self, addr: SocketAddr, on_connect: impl FnOnce(&Tcp, io::Result<()>) + 'static) -> io::Result<()> {
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() || inner.connecting || inner.connected || inner.listening {
            return Err(invalid_state());
        }
        inner.ensure_socket(&addr)?;

        #[cfg(feature = "io-uring")]
        if inner.is_completion() {
            super::tcp_uring::start_connect(&mut inner, addr)?;
            inner.on_connect = Some(Box::new(on_connect));
            inner.update_active();
            return Ok(());
        }

        match inner.socket_ref()?.connect(&addr.into()) {
            Ok(()) => {
                inner.connected = true;
                let loop_ = inner.base.loop_.clone();
                drop(inner);
                let tcp = self.clone();
                // No event will arrive for an instantly established
                // connection; deliver through the work queue to keep the
                // callback asynchronous.
                loop_.queue_local(LocalWork::Call(Box::new(move |_| on_connect(&tcp, Ok(())))));
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                inner.connecting = true;
                inner.on_connect = Some(Box::new(on_connect));
                inner.sync_interest();
                inner.update_active();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Start delivering received data to `on_read`. `Ok(Some(bytes))`
    /// carries data, `Ok(None)` is EOF (reading stops), errors stop
    /// reading as well.
    pub fn read_start(&self, on_read: impl FnMut(&Tcp, io::Result<Option<Bytes>>) + 'static) -> io::Result<()> {
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() {
            return Err(invalid_state());
        }
        if !inner.connected {
            return Err(not_connected());
        }
        inner.reading = true;
        inner.on_read = Some(Box::new(on_read));

        #[cfg(feature = "io-uring")]
        if inner.is_completion() {
            super::tcp_uring::resume_reading(&mut inner, self);
            inner.update_active();
            return Ok(());
        }

        inner.sync_interest();
        inner.update_active();
        Ok(())
    }

    pub fn read_stop(&self) {
        let mut inner = self.core.borrow_mut();
        if !inner.reading {
            return;
        }
        inner.reading = false;
        inner.on_read = None;
        inner.sync_interest();
        inner.update_active();
    }

    /// Queue `buf` for transmission. Requests complete in submission order;
    /// a fully written buffer completes its callback on this call stack.
    pub fn write(&self, buf: Bytes, on_write: impl FnOnce(&Tcp, io::Result<()>) + 'static) -> io::Result<()> {
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() || inner.shutdown_cb.is_some() {
            return Err(invalid_state());
        }
        if !inner.connected {
            return Err(not_connected());
        }
        if buf.is_empty() {
            drop(inner);
            on_write(self, Ok(()));
            return Ok(());
        }

        #[cfg(feature = "io-uring")]
        if inner.is_completion() {
            inner.write_queue.push_back(WriteRequest {
                buf,
                written: 0,
                cb: Some(Box::new(on_write)),
            });
            super::tcp_uring::pump_send(&mut inner, self);
            inner.update_active();
            return Ok(());
        }

        if inner.write_queue.is_empty() {
            // Fast path: try to transmit on the spot.
            let mut written = 0;
            let result = loop {
                match inner.socket_ref()?.send(&buf[written..]) {
                    Ok(n) => {
                        written += n;
                        if written == buf.len() {
                            break Some(Ok(()));
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break Some(Err(e)),
                }
            };
            if let Some(result) = result {
                drop(inner);
                on_write(self, result);
                return Ok(());
            }
            inner.write_queue.push_back(WriteRequest {
                buf,
                written,
                cb: Some(Box::new(on_write)),
            });
        } else {
            inner.write_queue.push_back(WriteRequest {
                buf,
                written: 0,
                cb: Some(Box::new(on_write)),
            });
        }
        inner.sync_interest();
        inner.update_active();
        Ok(())
    }

    /// Close the write side once every queued write has been transmitted.
    /// The read side stays open until EOF or close.
    pub fn shutdown(&self, on_shutdown: impl FnOnce(&Tcp, io::Result<()>) + 'static) -> io::Result<()> {
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() || inner.shutdown_cb.is_some() {
            return Err(invalid_state());
        }
        if !inner.connected {
            return Err(not_connected());
        }
        inner.shutdown_cb = Some(Box::new(on_shutdown));
        inner.update_active();
        if inner.write_queue.is_empty() && !inner.has_inflight() {
            drop(inner);
            finish_shutdown(self);
        }
        Ok(())
    }

    pub fn close(&self) {
        self.close_with(|_| {});
    }

    /// Cancel everything in flight (their callbacks fire with `ECANCELED`
    /// first), unregister, close the socket and schedule `cb` for the
    /// loop's closing sweep.
    pub fn close_with(&self, cb: impl FnOnce(&Tcp) + 'static) {
        let (cancelled, loop_) = {
            let mut inner = self.core.borrow_mut();
            if inner.base.is_closing() {
                return;
            }
            inner.base.lifecycle = Lifecycle::Closing;

            let mut cancelled: Vec<WriteCb> = Vec::new();
            #[cfg(feature = "io-uring")]
            {
                if let Some(req) = inner.completion.inflight_send.take() {
                    if let Some(cb) = req.cb {
                        cancelled.push(cb);
                    }
                }
            }
            for req in inner.write_queue.drain(..) {
                if let Some(cb) = req.cb {
                    cancelled.push(cb);
                }
            }
            if let Some(cb) = inner.shutdown_cb.take() {
                cancelled.push(cb);
            }
            if let Some(cb) = inner.on_connect.take() {
                cancelled.push(cb);
            }
            inner.on_connection = None;
            inner.on_read = None;
            inner.connecting = false;
            inner.listening = false;
            inner.reading = false;

            let loop_ = inner.base.loop_.clone();
            if let Some(sock) = &inner.socket {
                use std::os::fd::AsRawFd;
                let fd = sock.as_raw_fd();
                match loop_.backend_kind() {
                    ActiveKind::Readiness => loop_.backend.borrow_mut().remove(fd),
                    #[cfg(feature = "io-uring")]
                    ActiveKind::Completion => {
                        if let Some(token) = inner.base.current_token() {
                            loop_.backend.borrow_mut().cancel_token(token);
                        }
                    }
                    #[cfg(not(feature = "io-uring"))]
                    ActiveKind::Completion => {}
                }
            }
            inner.base.release_token();
            inner.base.deactivate();
            // Dropping the socket closes the fd. In-flight uring ops hold
            // their own file reference until their (cancelled) completion.
            inner.socket = None;
            (cancelled, loop_)
        };

        for cancelled_cb in cancelled {
            cancelled_cb(self, Err(ecanceled()));
        }

        let tcp = self.clone();
        loop_.push_closing(Box::new(move || {
            trace!(target: "strand_tcp", "handle closed");
            cb(&tcp);
            tcp.core.borrow_mut().base.lifecycle = Lifecycle::Closed;
        }));
    }

    pub fn is_connected(&self) -> bool {
        self.core.borrow().connected
    }

    pub fn kind(&self) -> crate::HandleKind {
        self.core.borrow().base.kind()
    }

    pub fn is_closing(&self) -> bool {
        self.core.borrow().base.is_closing()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let inner = self.core.borrow();
        let addr = inner.socket_ref()?.local_addr()?;
        addr.as_socket().ok_or_else(invalid_state)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let inner = self.core.borrow();
        let addr = inner.socket_ref()?.peer_addr()?;
        addr.as_socket().ok_or_else(invalid_state)
    }

    pub fn set_nodelay(&self, enable: bool) -> io::Result<()> {
        self.core.borrow().socket_ref()?.set_tcp_nodelay(enable)
    }

    pub fn set_keepalive(&self, enable: bool) -> io::Result<()> {
        self.core.borrow().socket_ref()?.set_keepalive(enable)
    }

    pub fn set_reuseaddr(&self, enable: bool) -> io::Result<()> {
        self.core.borrow().socket_ref()?.set_reuse_address(enable)
    }
}

impl TcpCore {
    pub(super) fn socket_ref(&self) -> io::Result<&Socket> {
        self.socket.as_ref().ok_or_else(not_connected)
    }
}

#[cfg(feature = "io-uring")]
pub(crate) use super::tcp_uring::on_complete;

/// Readiness-mode event entry point, called by the loop dispatcher.
pub(crate) fn on_ready(rc: Rc<RefCell<TcpCore>>, events: Events) {
    let tcp = Tcp { core: rc };
    {
        let inner = tcp.core.borrow();
        if inner.base.is_closing() {
            return;
        }
    }

    let connecting = tcp.core.borrow().connecting;
    if connecting && (events.is_writable() || events.is_error() || events.is_hangup()) {
        finish_connect(&tcp);
    }

    let listening = tcp.core.borrow().listening;
    if listening && events.is_readable() {
        deliver_connection(&tcp, Ok(()));
    }

    if events.is_readable() || events.is_hangup() || events.is_error() {
        maybe_read(&tcp);
    }

    let has_writes = !tcp.core.borrow().write_queue.is_empty();
    if events.is_writable() || ((events.is_error() || events.is_hangup()) && has_writes) {
        // Error and hangup conditions surface through the send call, which
        // fails the affected request instead of stalling the queue.
        flush_writes(&tcp);
    }

    let mut inner = tcp.core.borrow_mut();
    if !inner.base.is_closing() {
        inner.sync_interest();
        inner.update_active();
    }
}

fn finish_connect(tcp: &Tcp) {
    let (cb, result) = {
        let mut inner = tcp.core.borrow_mut();
        inner.connecting = false;
        let result = match &inner.socket {
            Some(sock) => match sock.take_error() {
                Ok(Some(e)) => Err(e),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            },
            None => Err(not_connected()),
        };
        if result.is_ok() {
            inner.connected = true;
        }
        (inner.on_connect.take(), result)
    };
    if let Some(cb) = cb {
        cb(tcp, result);
    }
}

pub(super) fn deliver_connection(tcp: &Tcp, result: io::Result<()>) {
    let cb = tcp.core.borrow_mut().on_connection.take();
    let Some(mut cb) = cb else { return };
    cb(tcp, result);
    let mut inner = tcp.core.borrow_mut();
    if inner.on_connection.is_none() && inner.listening {
        inner.on_connection = Some(cb);
    }
}

enum ReadOutcome {
    Data(Bytes),
    Eof,
    Failed(io::Error),
    Nothing,
}

fn maybe_read(tcp: &Tcp) {
    let outcome = {
        let mut inner = tcp.core.borrow_mut();
        if !inner.reading || inner.base.is_closing() {
            ReadOutcome::Nothing
        } else {
            let result = {
                let TcpCore { socket, read_buf, .. } = &mut *inner;
                match socket {
                    Some(sock) => {
                        read_buf.reserve(READ_CHUNK);
                        match sock.recv(read_buf.spare_capacity_mut()) {
                            Ok(n) => {
                                // SAFETY: the kernel initialized `n` bytes
                                // of the spare capacity.
                                unsafe { read_buf.set_len(read_buf.len() + n) };
                                Ok(n)
                            }
                            Err(e) => Err(e),
                        }
                    }
                    None => Err(not_connected()),
                }
            };
            match result {
                Ok(0) => {
                    inner.reading = false;
                    ReadOutcome::Eof
                }
                Ok(n) => ReadOutcome::Data(inner.read_buf.split_to(n).freeze()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Nothing,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Nothing,
                Err(e) => {
                    inner.reading = false;
                    ReadOutcome::Failed(e)
                }
            }
        }
    };

    match outcome {
        ReadOutcome::Data(bytes) => deliver_read(tcp, Ok(Some(bytes))),
        ReadOutcome::Eof => deliver_read(tcp, Ok(None)),
        ReadOutcome::Failed(e) => deliver_read(tcp, Err(e)),
        ReadOutcome::Nothing => {}
    }
}

pub(super) fn deliver_read(tcp: &Tcp, result: io::Result<Option<Bytes>>) {
    let cb = tcp.core.borrow_mut().on_read.take();
    let Some(mut cb) = cb else { return };
    cb(tcp, result);
    let mut inner = tcp.core.borrow_mut();
    if inner.on_read.is_none() && inner.reading {
        inner.on_read = Some(cb);
    }
}

enum WriteStep {
    Complete(WriteRequest, io::Result<()>),
    Drained,
    Stalled,
}

fn flush_writes(tcp: &Tcp) {
    loop {
        let step = {
            let mut inner = tcp.core.borrow_mut();
            if inner.base.is_closing() {
                return;
            }
            match inner.write_queue.pop_front() {
                None => WriteStep::Drained,
                Some(mut req) => {
                    let result = {
                        let TcpCore { socket, .. } = &mut *inner;
                        match socket {
                            Some(sock) => sock.send(&req.buf[req.written..]),
                            None => Err(not_connected()),
                        }
                    };
                    match result {
                        Ok(n) => {
                            req.written += n;
                            if req.written == req.buf.len() {
                                WriteStep::Complete(req, Ok(()))
                            } else {
                                inner.write_queue.push_front(req);
                                WriteStep::Stalled
                            }
                        }
                        Err(ref e)
                            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
                        {
                            inner.write_queue.push_front(req);
                            WriteStep::Stalled
                        }
                        Err(e) => WriteStep::Complete(req, Err(e)),
                    }
                }
            }
        };
        match step {
            WriteStep::Complete(req, result) => {
                if let Some(cb) = req.cb {
                    cb(tcp, result);
                }
                // On error the next queued request still gets its chance.
            }
            WriteStep::Drained => {
                finish_shutdown(tcp);
                return;
            }
            WriteStep::Stalled => return,
        }
    }
}

/// Run the deferred shutdown once the write queue has fully drained.
pub(super) fn finish_shutdown(tcp: &Tcp) {
    let (cb, result) = {
        let mut inner = tcp.core.borrow_mut();
        if inner.base.is_closing() || !inner.write_queue.is_empty() || inner.has_inflight() {
            return;
        }
        let Some(cb) = inner.shutdown_cb.take() else { return };
        let result = inner
            .socket_ref()
            .and_then(|sock| sock.shutdown(std::net::Shutdown::Write));
        inner.update_active();
        (cb, result)
    };
    cb(tcp, result);
}
