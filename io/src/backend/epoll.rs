//! Level-triggered readiness backend over `epoll`.

use std::{collections::HashMap, io, os::fd::RawFd, sync::Arc, time::Duration};

use tracing::trace;

use super::{Events, RawEvent, WAKER_TOKEN, Waker};

/// Events fetched per `epoll_wait` call.
const EVENT_CAPACITY: usize = 256;

pub(crate) struct EpollBackend {
    epfd: RawFd,
    waker: Arc<Waker>,
    /// Scratch space handed to `epoll_wait`.
    sys_events: Vec<libc::epoll_event>,
    /// fd -> currently registered interest. Used to turn repeated `add`
    /// calls into interest updates.
    registered: HashMap<RawFd, (usize, Events)>,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let waker = Arc::new(Waker::new()?);

        let mut backend = Self {
            epfd,
            waker,
            sys_events: Vec::with_capacity(EVENT_CAPACITY),
            registered: HashMap::new(),
        };
        let waker_fd = backend.waker.raw_fd();
        backend.ctl(libc::EPOLL_CTL_ADD, waker_fd, WAKER_TOKEN, Events::READABLE)?;
        Ok(backend)
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn add(&mut self, fd: RawFd, token: usize, events: Events) -> io::Result<()> {
        let op = if self.registered.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, token, events)?;
        self.registered.insert(fd, (token, events));
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, token: usize, events: Events) -> io::Result<()> {
        self.add(fd, token, events)
    }

    pub fn remove(&mut self, fd: RawFd) {
        if self.registered.remove(&fd).is_some() {
            // The fd may already be closed; nothing to do about failure.
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<RawEvent>) -> io::Result<()> {
        let timeout_ms = match timeout {
            // Round up so a 0 < t < 1ms timer wait does not spin.
            Some(t) => i32::try_from(t.as_millis() + u128::from(t.subsec_micros() % 1000 != 0)).unwrap_or(i32::MAX),
            None => -1,
        };

        let n = loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.sys_events.as_mut_ptr(),
                    EVENT_CAPACITY as i32,
                    timeout_ms,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        unsafe { self.sys_events.set_len(n) };
        trace!(target: "strand_backend", events = n, "epoll wait returned");

        for ev in &self.sys_events {
            let token = ev.u64 as usize;
            if token == WAKER_TOKEN {
                self.waker.drain();
                continue;
            }
            let mut events = Events::NONE;
            if ev.events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
                events |= Events::READABLE;
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                events |= Events::WRITABLE;
            }
            if ev.events & libc::EPOLLERR as u32 != 0 {
                events |= Events::ERROR;
            }
            if ev.events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                events |= Events::HANGUP;
            }
            out.push(RawEvent::Ready { token, events });
        }
        Ok(())
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, token: usize, events: Events) -> io::Result<()> {
        let mut flags = 0u32;
        if events.is_readable() {
            flags |= libc::EPOLLIN as u32;
        }
        if events.is_writable() {
            flags |= libc::EPOLLOUT as u32;
        }
        flags |= libc::EPOLLRDHUP as u32;

        let mut ev = libc::epoll_event {
            events: flags,
            u64: token as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wakeup_interrupts_poll() {
        let mut backend = EpollBackend::new().unwrap();
        let waker = backend.waker();
        waker.wake();

        let mut out = Vec::new();
        backend.poll(Some(Duration::from_secs(5)), &mut out).unwrap();
        // The wakeup is consumed internally and produces no dispatchable
        // event.
        assert!(out.is_empty());
    }

    #[test]
    fn remove_unknown_fd_is_noop() {
        let mut backend = EpollBackend::new().unwrap();
        backend.remove(12345);
    }

    #[test]
    fn zero_timeout_returns_immediately() {
        let mut backend = EpollBackend::new().unwrap();
        let mut out = Vec::new();
        backend.poll(Some(Duration::ZERO), &mut out).unwrap();
        assert!(out.is_empty());
    }
}
