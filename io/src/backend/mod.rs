//! Uniform surface over the platform event facility.
//!
//! Two models are supported. In readiness mode (`epoll`) the backend reports
//! which fds may be operated on without blocking and the handle performs the
//! I/O afterwards. In completion mode (`io_uring`) the handle submits the
//! operation up front and the backend reports it finished, buffer already
//! filled or drained. Handles pick their code path from [`Backend::kind`].

mod epoll;
#[cfg(feature = "io-uring")]
mod uring;

use std::{io, os::fd::RawFd, sync::Arc, time::Duration};

#[cfg(feature = "io-uring")]
pub(crate) use self::uring::{OpCompletion, OpKind};

/// Dispatch key reserved for the backend's own wakeup fd.
pub(crate) const WAKER_TOKEN: usize = usize::MAX;

/// Readiness bitmask exchanged with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Events(u8);

impl Events {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(1);
    pub const WRITABLE: Self = Self(2);
    pub const ERROR: Self = Self(4);
    pub const HANGUP: Self = Self(8);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.intersects(Self::READABLE)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE)
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.intersects(Self::ERROR)
    }

    #[inline]
    pub fn is_hangup(self) -> bool {
        self.intersects(Self::HANGUP)
    }
}

impl std::ops::BitOr for Events {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Events {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One dispatchable outcome of a backend poll.
pub(crate) enum RawEvent {
    /// An fd registered for readiness interest may be operated on.
    Ready { token: usize, events: Events },
    /// A submitted operation finished.
    #[cfg(feature = "io-uring")]
    Complete { token: usize, op: OpCompletion },
}

/// Backend selection requested at loop construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Readiness unless the `io-uring` feature is enabled and a ring can be
    /// set up.
    #[default]
    Auto,
    Readiness,
    Completion,
}

/// The model the constructed backend actually operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActiveKind {
    Readiness,
    Completion,
}

/// Out-of-band wakeup of a blocked poll. An `eventfd` under both backends:
/// the readiness backend registers it like any other fd, the completion
/// backend keeps a poll op armed on it.
pub(crate) struct Waker {
    fd: RawFd,
}

impl Waker {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub(crate) fn wake(&self) {
        let one = 1u64;
        // Failure here is either EAGAIN (counter saturated, a wake is
        // already pending) or the loop tearing down. Both are fine to drop.
        unsafe {
            libc::write(self.fd, (&raw const one).cast(), 8);
        }
    }

    fn drain(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(self.fd, (&raw mut buf).cast(), 8);
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub(crate) enum Backend {
    Epoll(epoll::EpollBackend),
    #[cfg(feature = "io-uring")]
    Uring(uring::UringBackend),
}

impl Backend {
    pub fn new(kind: BackendKind) -> io::Result<Self> {
        match kind {
            BackendKind::Readiness => Ok(Self::Epoll(epoll::EpollBackend::new()?)),
            #[cfg(feature = "io-uring")]
            BackendKind::Completion => Ok(Self::Uring(uring::UringBackend::new()?)),
            #[cfg(not(feature = "io-uring"))]
            BackendKind::Completion => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "completion backend requires the io-uring feature",
            )),
            BackendKind::Auto => {
                #[cfg(feature = "io-uring")]
                if let Ok(backend) = uring::UringBackend::new() {
                    return Ok(Self::Uring(backend));
                }
                Ok(Self::Epoll(epoll::EpollBackend::new()?))
            }
        }
    }

    pub fn kind(&self) -> ActiveKind {
        match self {
            Self::Epoll(_) => ActiveKind::Readiness,
            #[cfg(feature = "io-uring")]
            Self::Uring(_) => ActiveKind::Completion,
        }
    }

    pub fn waker(&self) -> Arc<Waker> {
        match self {
            Self::Epoll(b) => b.waker(),
            #[cfg(feature = "io-uring")]
            Self::Uring(b) => b.waker(),
        }
    }

    /// Register or update readiness interest for an fd. Registering an fd a
    /// second time replaces its interest set.
    pub fn add(&mut self, fd: RawFd, token: usize, events: Events) -> io::Result<()> {
        match self {
            Self::Epoll(b) => b.add(fd, token, events),
            #[cfg(feature = "io-uring")]
            Self::Uring(b) => b.poll_add(fd, token, events),
        }
    }

    pub fn modify(&mut self, fd: RawFd, token: usize, events: Events) -> io::Result<()> {
        match self {
            Self::Epoll(b) => b.modify(fd, token, events),
            #[cfg(feature = "io-uring")]
            Self::Uring(b) => b.poll_add(fd, token, events),
        }
    }

    /// Drop all interest in an fd. Removing an unknown fd is a no-op.
    pub fn remove(&mut self, fd: RawFd) {
        match self {
            Self::Epoll(b) => b.remove(fd),
            #[cfg(feature = "io-uring")]
            Self::Uring(b) => b.poll_remove(fd),
        }
    }

    /// Wait for events up to `timeout` (`None` blocks indefinitely) and
    /// append the dispatchable outcomes to `out`.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<RawEvent>) -> io::Result<()> {
        match self {
            Self::Epoll(b) => b.poll(timeout, out),
            #[cfg(feature = "io-uring")]
            Self::Uring(b) => b.poll(timeout, out),
        }
    }
}

#[cfg(feature = "io-uring")]
impl Backend {
    fn uring(&mut self) -> io::Result<&mut uring::UringBackend> {
        match self {
            Self::Uring(b) => Ok(b),
            Self::Epoll(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "operation submission requires the completion backend",
            )),
        }
    }

    pub fn submit_accept(&mut self, fd: RawFd, token: usize) -> io::Result<usize> {
        self.uring()?.submit_accept(fd, token)
    }

    pub fn submit_connect(&mut self, fd: RawFd, token: usize, addr: socket2::SockAddr) -> io::Result<usize> {
        self.uring()?.submit_connect(fd, token, addr)
    }

    pub fn submit_recv(&mut self, fd: RawFd, token: usize, buf: bytes::BytesMut) -> io::Result<usize> {
        self.uring()?.submit_recv(fd, token, buf)
    }

    pub fn submit_send(&mut self, fd: RawFd, token: usize, buf: bytes::Bytes, offset: usize) -> io::Result<usize> {
        self.uring()?.submit_send(fd, token, buf, offset)
    }

    pub fn cancel_token(&mut self, token: usize) {
        if let Self::Uring(b) = self {
            b.cancel_token(token);
        }
    }
}
