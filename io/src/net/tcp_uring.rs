//! Completion-mode TCP paths.
//!
//! The readiness code in `tcp.rs` waits for the fd and then operates on
//! it; here every operation is submitted to the ring up front and the
//! state machine advances inside the completion handlers. Accepts are kept
//! pre-posted as a small pool so a listener is always ready; reads keep a
//! single recv outstanding while `reading` holds; sends fly one at a time
//! off the head of the FIFO so partial completions cannot reorder requests.

use std::{
    cell::RefCell,
    io,
    net::SocketAddr,
    os::fd::{AsRawFd, FromRawFd},
    rc::Rc,
};

use bytes::BytesMut;
use socket2::Socket;
use tracing::warn;

use crate::{
    backend::{OpCompletion, OpKind},
    handle::Trampoline,
    queue::LocalWork,
};

use super::tcp::{READ_CHUNK, Tcp, TcpCore, WriteRequest, deliver_connection, deliver_read, finish_shutdown};

/// Accept operations kept pre-posted on a listener.
const ACCEPT_POOL: usize = 4;

pub(super) fn start_accepts(inner: &mut TcpCore) {
    for _ in 0..ACCEPT_POOL {
        if let Err(e) = submit_accept(inner) {
            warn!(target: "strand_tcp", error = %e, "accept submission failed");
            break;
        }
    }
}

fn submit_accept(inner: &mut TcpCore) -> io::Result<()> {
    let fd = inner.socket_ref()?.as_raw_fd();
    let weak = inner.self_weak.clone();
    let token = inner.base.token(|| Trampoline::Tcp(weak));
    inner.base.loop_.backend.borrow_mut().submit_accept(fd, token)?;
    inner.completion.accepts_inflight += 1;
    Ok(())
}

pub(super) fn start_connect(inner: &mut TcpCore, addr: SocketAddr) -> io::Result<()> {
    let fd = inner.socket_ref()?.as_raw_fd();
    let weak = inner.self_weak.clone();
    let token = inner.base.token(|| Trampoline::Tcp(weak));
    inner.base.loop_.backend.borrow_mut().submit_connect(fd, token, addr.into())?;
    inner.connecting = true;
    Ok(())
}

/// Re-deliver stashed recv results and keep a recv outstanding.
pub(super) fn resume_reading(inner: &mut TcpCore, tcp: &Tcp) {
    while let Some(item) = inner.completion.pending_recv.pop_front() {
        let tcp = tcp.clone();
        inner.base.loop_.queue_local(LocalWork::Call(Box::new(move |_| {
            let stash = item.clone();
            {
                let mut inner = tcp.core.borrow_mut();
                if inner.base.is_closing() {
                    return;
                }
                if !inner.reading {
                    inner.completion.pending_recv.push_front(stash);
                    return;
                }
                if item.is_none() {
                    inner.reading = false;
                }
            }
            deliver_read(&tcp, Ok(item));
        })));
    }
    arm_recv(inner);
}

pub(super) fn arm_recv(inner: &mut TcpCore) {
    if inner.completion.recv_armed || !inner.reading || !inner.connected || inner.base.is_closing() {
        return;
    }
    let Ok(sock) = inner.socket_ref() else { return };
    let fd = sock.as_raw_fd();
    let weak = inner.self_weak.clone();
    let token = inner.base.token(|| Trampoline::Tcp(weak));
    let buf = BytesMut::with_capacity(READ_CHUNK);
    match inner.base.loop_.backend.borrow_mut().submit_recv(fd, token, buf) {
        Ok(_) => inner.completion.recv_armed = true,
        Err(e) => warn!(target: "strand_tcp", error = %e, "recv submission failed"),
    }
}

/// Put the head of the write queue in flight, if nothing is.
pub(super) fn pump_send(inner: &mut TcpCore, tcp: &Tcp) {
    if inner.completion.inflight_send.is_some()
        || inner.base.is_closing()
        || !inner.connected
    {
        return;
    }
    let Some(req) = inner.write_queue.pop_front() else { return };

    let fd = match inner.socket_ref() {
        Ok(sock) => sock.as_raw_fd(),
        Err(_) => return,
    };
    let weak = inner.self_weak.clone();
    let token = inner.base.token(|| Trampoline::Tcp(weak));
    let buf = req.buf.clone();
    let offset = req.written;
    inner.completion.inflight_send = Some(req);

    if let Err(e) = inner.base.loop_.backend.borrow_mut().submit_send(fd, token, buf, offset) {
        if let Some(req) = inner.completion.inflight_send.take() {
            if let Some(cb) = req.cb {
                let tcp = tcp.clone();
                inner
                    .base
                    .loop_
                    .queue_local(LocalWork::Call(Box::new(move |_| cb(&tcp, Err(e)))));
            }
        }
    }
}

/// Completion-mode event entry point, called by the loop dispatcher.
pub(crate) fn on_complete(rc: Rc<RefCell<TcpCore>>, op: OpCompletion) {
    let tcp = Tcp { core: rc };
    match op.kind {
        OpKind::Accept => accept_complete(&tcp, op),
        OpKind::Connect => connect_complete(&tcp, op),
        OpKind::Recv => recv_complete(&tcp, op),
        OpKind::Send => send_complete(&tcp, op),
        OpKind::Poll => {}
    }

    let mut inner = tcp.core.borrow_mut();
    if !inner.base.is_closing() {
        inner.update_active();
    }
}

fn accept_complete(tcp: &Tcp, op: OpCompletion) {
    let deliver = {
        let mut inner = tcp.core.borrow_mut();
        inner.completion.accepts_inflight = inner.completion.accepts_inflight.saturating_sub(1);
        if inner.base.is_closing() {
            if op.result >= 0 {
                unsafe { libc::close(op.result) };
            }
            None
        } else if op.result >= 0 {
            // Route by the op's embedded back reference: the accepted fd
            // belongs to whichever listener submitted the op, independent
            // of any completion-key association.
            let socket = unsafe { Socket::from_raw_fd(op.result) };
            let _ = socket.set_nonblocking(true);
            inner.completion.pending_accepts.push_back((socket, op.peer));
            if inner.listening {
                let _ = submit_accept(&mut inner);
            }
            Some(Ok(()))
        } else {
            let err = op
                .error()
                .unwrap_or_else(|| io::Error::other("accept completed without result"));
            if err.raw_os_error() == Some(libc::ECANCELED) {
                None
            } else {
                if inner.listening {
                    let _ = submit_accept(&mut inner);
                }
                Some(Err(err))
            }
        }
    };
    if let Some(result) = deliver {
        deliver_connection(tcp, result);
    }
}

fn connect_complete(tcp: &Tcp, op: OpCompletion) {
    let (cb, result) = {
        let mut inner = tcp.core.borrow_mut();
        inner.connecting = false;
        if inner.base.is_closing() {
            return;
        }
        let result = match op.error() {
            None => {
                inner.connected = true;
                Ok(())
            }
            Some(e) => Err(e),
        };
        (inner.on_connect.take(), result)
    };
    if let Some(cb) = cb {
        cb(tcp, result);
    }

    let mut inner = tcp.core.borrow_mut();
    if inner.connected && !inner.base.is_closing() {
        arm_recv(&mut inner);
        let tcp = tcp.clone();
        pump_send(&mut inner, &tcp);
    }
}

fn recv_complete(tcp: &Tcp, op: OpCompletion) {
    let deliver = {
        let mut inner = tcp.core.borrow_mut();
        inner.completion.recv_armed = false;
        if inner.base.is_closing() {
            return;
        }
        if op.result > 0 {
            let bytes = op.buf.map(BytesMut::freeze);
            match bytes {
                Some(bytes) if inner.reading => Some(Ok(Some(bytes))),
                Some(bytes) => {
                    inner.completion.pending_recv.push_back(Some(bytes));
                    None
                }
                None => None,
            }
        } else if op.result == 0 {
            if inner.reading {
                inner.reading = false;
                Some(Ok(None))
            } else {
                inner.completion.pending_recv.push_back(None);
                None
            }
        } else {
            let err = op
                .error()
                .unwrap_or_else(|| io::Error::other("recv completed without result"));
            if err.raw_os_error() == Some(libc::ECANCELED) {
                None
            } else if inner.reading {
                inner.reading = false;
                Some(Err(err))
            } else {
                None
            }
        }
    };

    if let Some(result) = deliver {
        deliver_read(tcp, result);
    }

    let mut inner = tcp.core.borrow_mut();
    arm_recv(&mut inner);
}

fn send_complete(tcp: &Tcp, op: OpCompletion) {
    let done: Option<(Option<super::tcp::WriteCb>, io::Result<()>)> = {
        let mut inner = tcp.core.borrow_mut();
        let Some(mut req) = inner.completion.inflight_send.take() else {
            return;
        };
        if inner.base.is_closing() {
            Some((req.cb.take(), Err(crate::handle::ecanceled())))
        } else {
            match op.error() {
                Some(e) => Some((req.cb.take(), Err(e))),
                None => {
                    req.written += op.result as usize;
                    if req.written >= req.buf.len() {
                        Some((req.cb.take(), Ok(())))
                    } else {
                        // Partial completion: keep the same request in
                        // flight with the advanced offset.
                        resubmit_remainder(&mut inner, req)
                    }
                }
            }
        }
    };

    if let Some((cb, result)) = done {
        if let Some(cb) = cb {
            cb(tcp, result);
        }
    }

    {
        let mut inner = tcp.core.borrow_mut();
        if !inner.base.is_closing() {
            let tcp = tcp.clone();
            pump_send(&mut inner, &tcp);
        }
    }
    finish_shutdown(tcp);
}

fn resubmit_remainder(
    inner: &mut TcpCore,
    mut req: WriteRequest,
) -> Option<(Option<super::tcp::WriteCb>, io::Result<()>)> {
    let fd = match inner.socket_ref() {
        Ok(sock) => sock.as_raw_fd(),
        Err(e) => return Some((req.cb.take(), Err(e))),
    };
    let weak = inner.self_weak.clone();
    let token = inner.base.token(|| Trampoline::Tcp(weak));
    let buf = req.buf.clone();
    let offset = req.written;
    match inner.base.loop_.backend.borrow_mut().submit_send(fd, token, buf, offset) {
        Ok(_) => {
            inner.completion.inflight_send = Some(req);
            None
        }
        Err(e) => Some((req.cb.take(), Err(e))),
    }
}
