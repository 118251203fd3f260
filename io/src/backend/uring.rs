//! Completion backend over `io_uring`.
//!
//! Socket operations are submitted up front and reported once the kernel
//! has performed them. Every in-flight operation lives in a slab entry that
//! owns its buffers and address storage; the slab key doubles as the
//! submission's `user_data`, so a completion can always be routed back to
//! the operation that caused it. Readiness-style registrations (the waker
//! eventfd, UDP handles) are serviced through re-armed oneshot poll ops, so
//! both event styles flow out of the same [`poll`](UringBackend::poll).

use std::{collections::HashMap, io, net::SocketAddr, os::fd::RawFd, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use io_uring::{IoUring, opcode, types};
use slab::Slab;
use socket2::SockAddr;
use tracing::trace;

use super::{Events, RawEvent, WAKER_TOKEN, Waker};

const RING_ENTRIES: u32 = 256;

/// What a submitted operation was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Accept,
    Connect,
    Recv,
    Send,
    Poll,
}

/// Completion record handed to the dispatcher.
pub(crate) struct OpCompletion {
    pub kind: OpKind,
    /// Raw CQE result: bytes transferred or negated errno.
    pub result: i32,
    /// Buffer given back from a recv op, length set to the bytes received.
    pub buf: Option<BytesMut>,
    /// Buffer and progress offset given back from a send op.
    pub wbuf: Option<(Bytes, usize)>,
    /// Peer address of an accepted connection.
    pub peer: Option<SocketAddr>,
}

impl OpCompletion {
    pub fn error(&self) -> Option<io::Error> {
        if self.result < 0 {
            Some(io::Error::from_raw_os_error(-self.result))
        } else {
            None
        }
    }
}

struct AcceptStorage {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

struct Op {
    token: usize,
    kind: OpKind,
    buf: Option<BytesMut>,
    wbuf: Option<(Bytes, usize)>,
    addr: Option<Box<SockAddr>>,
    accept: Option<Box<AcceptStorage>>,
    poll_fd: RawFd,
}

impl Op {
    fn new(token: usize, kind: OpKind) -> Self {
        Self {
            token,
            kind,
            buf: None,
            wbuf: None,
            addr: None,
            accept: None,
            poll_fd: -1,
        }
    }
}

struct PollReg {
    token: usize,
    interest: Events,
    /// Outstanding oneshot poll op, if armed.
    op: Option<usize>,
}

pub(crate) struct UringBackend {
    ring: IoUring,
    waker: Arc<Waker>,
    ops: Slab<Op>,
    regs: HashMap<RawFd, PollReg>,
    /// (user_data, result) pairs drained from the completion queue before
    /// the per-op bookkeeping runs.
    scratch: Vec<(u64, i32)>,
}

impl UringBackend {
    pub fn new() -> io::Result<Self> {
        let ring = IoUring::new(RING_ENTRIES)?;
        let waker = Arc::new(Waker::new()?);
        let mut backend = Self {
            ring,
            waker,
            ops: Slab::new(),
            regs: HashMap::new(),
            scratch: Vec::new(),
        };
        let fd = backend.waker.raw_fd();
        backend.poll_add(fd, WAKER_TOKEN, Events::READABLE)?;
        Ok(backend)
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Register readiness interest through a re-armed oneshot poll op.
    pub fn poll_add(&mut self, fd: RawFd, token: usize, interest: Events) -> io::Result<()> {
        if let Some(reg) = self.regs.get_mut(&fd) {
            reg.token = token;
            if reg.interest == interest {
                return Ok(());
            }
            reg.interest = interest;
            // A stale oneshot with the old mask may still fire; cancel it
            // and re-arm with the new mask.
            if let Some(op) = reg.op.take() {
                self.cancel_op(op)?;
            }
        } else {
            self.regs.insert(
                fd,
                PollReg {
                    token,
                    interest,
                    op: None,
                },
            );
        }
        self.arm_poll(fd)
    }

    pub fn poll_remove(&mut self, fd: RawFd) {
        if let Some(reg) = self.regs.remove(&fd) {
            if let Some(op) = reg.op {
                let _ = self.cancel_op(op);
            }
        }
    }

    pub fn submit_accept(&mut self, fd: RawFd, token: usize) -> io::Result<usize> {
        let mut op = Op::new(token, OpKind::Accept);
        op.accept = Some(Box::new(AcceptStorage {
            storage: unsafe { std::mem::zeroed() },
            len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }));
        let id = self.ops.insert(op);

        let accept = self.ops[id].accept.as_mut().expect("accept storage just set");
        let entry = opcode::Accept::new(
            types::Fd(fd),
            (&raw mut accept.storage).cast::<libc::sockaddr>(),
            &raw mut accept.len,
        )
        .build()
        .user_data(id as u64);
        self.push(entry, id)?;
        Ok(id)
    }

    pub fn submit_connect(&mut self, fd: RawFd, token: usize, addr: SockAddr) -> io::Result<usize> {
        let mut op = Op::new(token, OpKind::Connect);
        op.addr = Some(Box::new(addr));
        let id = self.ops.insert(op);

        let addr = self.ops[id].addr.as_ref().expect("connect addr just set");
        let entry = opcode::Connect::new(types::Fd(fd), addr.as_ptr().cast(), addr.len())
            .build()
            .user_data(id as u64);
        self.push(entry, id)?;
        Ok(id)
    }

    /// Submit a recv into the spare capacity of `buf`.
    pub fn submit_recv(&mut self, fd: RawFd, token: usize, mut buf: BytesMut) -> io::Result<usize> {
        buf.clear();
        let mut op = Op::new(token, OpKind::Recv);
        op.buf = Some(buf);
        let id = self.ops.insert(op);

        let buf = self.ops[id].buf.as_mut().expect("recv buffer just set");
        let spare = buf.spare_capacity_mut();
        let entry = opcode::Recv::new(types::Fd(fd), spare.as_mut_ptr().cast::<u8>(), spare.len() as u32)
            .build()
            .user_data(id as u64);
        self.push(entry, id)?;
        Ok(id)
    }

    /// Submit a send of `buf[offset..]`. The buffer travels with the op and
    /// comes back in its completion for the handle to advance.
    pub fn submit_send(&mut self, fd: RawFd, token: usize, buf: Bytes, offset: usize) -> io::Result<usize> {
        let mut op = Op::new(token, OpKind::Send);
        op.wbuf = Some((buf, offset));
        let id = self.ops.insert(op);

        let (buf, offset) = self.ops[id].wbuf.as_ref().expect("send buffer just set");
        let remaining = &buf[*offset..];
        let entry = opcode::Send::new(types::Fd(fd), remaining.as_ptr(), remaining.len() as u32)
            .build()
            .user_data(id as u64);
        self.push(entry, id)?;
        Ok(id)
    }

    /// Request cancellation of every in-flight op owned by `token`. The ops
    /// complete (with `ECANCELED` or their final result) through `poll` as
    /// usual.
    pub fn cancel_token(&mut self, token: usize) {
        let ids: Vec<usize> = self
            .ops
            .iter()
            .filter(|(_, op)| op.token == token && op.kind != OpKind::Poll)
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            let _ = self.cancel_op(id);
        }
    }

    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<RawEvent>) -> io::Result<()> {
        let submitted = match timeout {
            Some(t) if t.is_zero() => self.ring.submit(),
            Some(t) => {
                let ts = types::Timespec::new().sec(t.as_secs()).nsec(t.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submit_and_wait(1),
        };
        match submitted {
            Ok(_) => {}
            Err(err) => match err.raw_os_error() {
                // Timed out, interrupted, or completion queue pressure:
                // drain whatever is there.
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                _ => return Err(err),
            },
        }

        self.scratch.clear();
        for cqe in self.ring.completion() {
            self.scratch.push((cqe.user_data(), cqe.result()));
        }

        trace!(target: "strand_backend", completions = self.scratch.len(), "uring poll drained");

        for i in 0..self.scratch.len() {
            let (user_data, result) = self.scratch[i];
            let id = user_data as usize;
            if !self.ops.contains(id) {
                continue;
            }
            let op = self.ops.remove(id);
            match op.kind {
                OpKind::Poll => self.complete_poll(op, result, out)?,
                kind => {
                    let peer = op.accept.as_ref().and_then(|a| {
                        unsafe { SockAddr::new(a.storage, a.len) }.as_socket()
                    });
                    out.push(RawEvent::Complete {
                        token: op.token,
                        op: OpCompletion {
                            kind,
                            result,
                            buf: op.buf.map(|mut buf| {
                                if result > 0 {
                                    // SAFETY: the kernel wrote `result`
                                    // bytes into the spare capacity.
                                    unsafe { buf.set_len(result as usize) };
                                }
                                buf
                            }),
                            wbuf: op.wbuf,
                            peer,
                        },
                    });
                }
            }
        }
        Ok(())
    }

    fn complete_poll(&mut self, op: Op, result: i32, out: &mut Vec<RawEvent>) -> io::Result<()> {
        let fd = op.poll_fd;
        let rearm = match self.regs.get_mut(&fd) {
            Some(reg) => {
                reg.op = None;
                true
            }
            None => false,
        };
        if result < 0 {
            // Cancelled or the fd went away; a live registration is
            // re-armed below either way.
            if rearm {
                self.arm_poll(fd)?;
            }
            return Ok(());
        }

        if op.token == WAKER_TOKEN {
            self.waker.drain();
            self.arm_poll(fd)?;
            return Ok(());
        }

        if rearm {
            let revents = result as u32 as i16;
            let mut events = Events::NONE;
            if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                events |= Events::READABLE;
            }
            if revents & libc::POLLOUT != 0 {
                events |= Events::WRITABLE;
            }
            if revents & libc::POLLERR != 0 {
                events |= Events::ERROR;
            }
            if revents & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
                events |= Events::HANGUP;
            }
            out.push(RawEvent::Ready {
                token: op.token,
                events,
            });
            self.arm_poll(fd)?;
        }
        Ok(())
    }

    fn arm_poll(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(reg) = self.regs.get(&fd) else {
            return Ok(());
        };
        if reg.op.is_some() || reg.interest.is_empty() {
            return Ok(());
        }
        let token = reg.token;

        let mut mask = 0u32;
        if reg.interest.is_readable() {
            mask |= (libc::POLLIN | libc::POLLRDHUP) as u32;
        }
        if reg.interest.is_writable() {
            mask |= libc::POLLOUT as u32;
        }

        let mut op = Op::new(token, OpKind::Poll);
        op.poll_fd = fd;
        let id = self.ops.insert(op);
        let entry = opcode::PollAdd::new(types::Fd(fd), mask).build().user_data(id as u64);
        self.push(entry, id)?;
        if let Some(reg) = self.regs.get_mut(&fd) {
            reg.op = Some(id);
        }
        Ok(())
    }

    fn cancel_op(&mut self, id: usize) -> io::Result<()> {
        let entry = opcode::AsyncCancel::new(id as u64)
            .build()
            .user_data(u64::MAX);
        // The cancel submission itself carries no op state; its own
        // completion is discarded through the unknown-id path.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| io::Error::other("submission queue full"))?;
            }
        }
        Ok(())
    }

    fn push(&mut self, entry: io_uring::squeue::Entry, id: usize) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_ok() {
                return Ok(());
            }
            if let Err(err) = self.ring.submit() {
                self.ops.remove(id);
                return Err(err);
            }
            if self.ring.submission().push(&entry).is_err() {
                self.ops.remove(id);
                return Err(io::Error::other("submission queue full"));
            }
        }
        Ok(())
    }
}
