//! Callback driven UDP handle.
//!
//! Datagram analogue of the TCP handle, readiness semantics under both
//! backends: the completion backend services the registration through its
//! poll path, so the non-blocking `recvfrom`/`sendto` calls below are the
//! single code path.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    net::SocketAddr,
    rc::{Rc, Weak},
};

use bytes::{Bytes, BytesMut};
use socket2::{Protocol, Socket, Type};
use tracing::warn;

use crate::{
    LoopHandle,
    backend::Events,
    handle::{HandleBase, HandleKind, Lifecycle, Trampoline, ecanceled, invalid_state, not_connected},
    net::new_socket,
};

/// Largest datagram accepted per read.
const RECV_CHUNK: usize = 64 * 1024;

type RecvCb = Box<dyn FnMut(&Udp, io::Result<(Bytes, SocketAddr)>) + 'static>;
type SendCb = Box<dyn FnOnce(&Udp, io::Result<()>) + 'static>;

struct SendRequest {
    buf: Bytes,
    addr: SocketAddr,
    cb: Option<SendCb>,
}

pub(crate) struct UdpCore {
    base: HandleBase,
    self_weak: Weak<RefCell<UdpCore>>,
    socket: Option<Socket>,
    recving: bool,
    registered: Events,
    on_recv: Option<RecvCb>,
    send_queue: VecDeque<SendRequest>,
    read_buf: BytesMut,
}

impl UdpCore {
    fn socket_ref(&self) -> io::Result<&Socket> {
        self.socket.as_ref().ok_or_else(not_connected)
    }

    fn ensure_socket(&mut self, addr: &SocketAddr) -> io::Result<()> {
        if self.socket.is_none() {
            self.socket = Some(new_socket(addr, Type::DGRAM, Protocol::UDP)?);
        }
        Ok(())
    }

    fn desired_interest(&self) -> Events {
        let mut events = Events::NONE;
        if self.recving {
            events |= Events::READABLE;
        }
        if !self.send_queue.is_empty() {
            events |= Events::WRITABLE;
        }
        events
    }

    fn sync_interest(&mut self) {
        if self.base.is_closing() {
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
            let token = self.base.token(|| Trampoline::Udp(weak));
            if let Err(e) = loop_.backend.borrow_mut().add(fd, token, desired) {
                warn!(target: "strand_udp", error = %e, "interest update failed");
                return;
            }
        }
        self.registered = desired;
    }

    fn update_active(&mut self) {
        let busy = !self.base.is_closing() && (self.recving || !self.send_queue.is_empty());
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

/// A UDP socket handle.
#[derive(Clone)]
pub struct Udp {
    core: Rc<RefCell<UdpCore>>,
}

impl Udp {
    pub fn new(handle: &LoopHandle) -> Self {
        let loop_ = handle.core().clone();
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(UdpCore {
                base: HandleBase::new(loop_, HandleKind::Udp),
                self_weak: weak.clone(),
                socket: None,
                recving: false,
                registered: Events::NONE,
                on_recv: None,
                send_queue: VecDeque::new(),
                read_buf: BytesMut::new(),
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

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let inner = self.core.borrow();
        let addr = inner.socket_ref()?.local_addr()?;
        addr.as_socket().ok_or_else(invalid_state)
    }

    pub fn kind(&self) -> crate::HandleKind {
        self.core.borrow().base.kind()
    }

    pub fn set_broadcast(&self, enable: bool) -> io::Result<()> {
        self.core.borrow().socket_ref()?.set_broadcast(enable)
    }

    pub fn set_reuseaddr(&self, enable: bool) -> io::Result<()> {
        self.core.borrow().socket_ref()?.set_reuse_address(enable)
    }

    /// Start delivering datagrams to `on_recv`.
    pub fn recv_start(&self, on_recv: impl FnMut(&Udp, io::Result<(Bytes, SocketAddr)>) + 'static) -> io::Result<()> {
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() {
            return Err(invalid_state());
        }
        inner.socket_ref()?;
        inner.recving = true;
        inner.on_recv = Some(Box::new(on_recv));
        inner.sync_interest();
        inner.update_active();
        Ok(())
    }

    pub fn recv_stop(&self) {
        let mut inner = self.core.borrow_mut();
        if !inner.recving {
            return;
        }
        inner.recving = false;
        inner.on_recv = None;
        inner.sync_interest();
        inner.update_active();
    }

    /// Send one datagram. A send accepted by the kernel completes its
    /// callback on this call stack; a full socket buffer queues it.
    pub fn send_to(&self, buf: Bytes, addr: SocketAddr, on_send: impl FnOnce(&Udp, io::Result<()>) + 'static) -> io::Result<()> {
        let mut inner = self.core.borrow_mut();
        if inner.base.is_closing() {
            return Err(invalid_state());
        }
        inner.ensure_socket(&addr)?;

        if inner.send_queue.is_empty() {
            let result = inner.socket_ref()?.send_to(&buf, &addr.into());
            match result {
                Ok(_) => {
                    drop(inner);
                    on_send(self, Ok(()));
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    drop(inner);
                    on_send(self, Err(e));
                    return Ok(());
                }
            }
        }
        inner.send_queue.push_back(SendRequest {
            buf,
            addr,
            cb: Some(Box::new(on_send)),
        });
        inner.sync_interest();
        inner.update_active();
        Ok(())
    }

    pub fn close(&self) {
        self.close_with(|_| {});
    }

    pub fn close_with(&self, cb: impl FnOnce(&Udp) + 'static) {
        let (cancelled, loop_) = {
            let mut inner = self.core.borrow_mut();
            if inner.base.is_closing() {
                return;
            }
            inner.base.lifecycle = Lifecycle::Closing;
            let cancelled: Vec<SendCb> = inner.send_queue.drain(..).filter_map(|req| req.cb).collect();
            inner.recving = false;
            inner.on_recv = None;

            let loop_ = inner.base.loop_.clone();
            if let Some(sock) = &inner.socket {
                use std::os::fd::AsRawFd;
                loop_.backend.borrow_mut().remove(sock.as_raw_fd());
            }
            inner.base.release_token();
            inner.base.deactivate();
            inner.socket = None;
            (cancelled, loop_)
        };

        for cancelled_cb in cancelled {
            cancelled_cb(self, Err(ecanceled()));
        }

        let udp = self.clone();
        loop_.push_closing(Box::new(move || {
            cb(&udp);
            udp.core.borrow_mut().base.lifecycle = Lifecycle::Closed;
        }));
    }
}

/// Readiness event entry point, called by the loop dispatcher.
pub(crate) fn on_ready(rc: Rc<RefCell<UdpCore>>, events: Events) {
    let udp = Udp { core: rc };
    if udp.core.borrow().base.is_closing() {
        return;
    }

    if events.is_readable() {
        maybe_recv(&udp);
    }
    if events.is_writable() || events.is_error() {
        flush_sends(&udp);
    }

    let mut inner = udp.core.borrow_mut();
    if !inner.base.is_closing() {
        inner.sync_interest();
        inner.update_active();
    }
}

fn maybe_recv(udp: &Udp) {
    let outcome = {
        let mut inner = udp.core.borrow_mut();
        if !inner.recving {
            None
        } else {
            let result = {
                let UdpCore { socket, read_buf, .. } = &mut *inner;
                match socket {
                    Some(sock) => {
                        read_buf.reserve(RECV_CHUNK);
                        sock.recv_from(read_buf.spare_capacity_mut()).map(|(n, addr)| {
                            // SAFETY: the kernel initialized `n` bytes of
                            // the spare capacity.
                            unsafe { read_buf.set_len(read_buf.len() + n) };
                            (n, addr)
                        })
                    }
                    None => Err(not_connected()),
                }
            };
            match result {
                Ok((n, addr)) => match addr.as_socket() {
                    Some(addr) => Some(Ok((inner.read_buf.split_to(n).freeze(), addr))),
                    None => None,
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => None,
                Err(e) => Some(Err(e)),
            }
        }
    };

    if let Some(result) = outcome {
        let cb = udp.core.borrow_mut().on_recv.take();
        let Some(mut cb) = cb else { return };
        cb(udp, result);
        let mut inner = udp.core.borrow_mut();
        if inner.on_recv.is_none() && inner.recving {
            inner.on_recv = Some(cb);
        }
    }
}

fn flush_sends(udp: &Udp) {
    loop {
        let step = {
            let mut inner = udp.core.borrow_mut();
            if inner.base.is_closing() {
                return;
            }
            match inner.send_queue.pop_front() {
                None => return,
                Some(mut req) => {
                    let result = {
                        let UdpCore { socket, .. } = &mut *inner;
                        match socket {
                            Some(sock) => sock.send_to(&req.buf, &req.addr.into()),
                            None => Err(not_connected()),
                        }
                    };
                    match result {
                        Ok(_) => Some((req.cb.take(), Ok(()))),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            inner.send_queue.push_front(req);
                            None
                        }
                        Err(e) => Some((req.cb.take(), Err(e))),
                    }
                }
            }
        };
        match step {
            Some((cb, result)) => {
                if let Some(cb) = cb {
                    cb(udp, result);
                }
            }
            None => return,
        }
    }
}
