use std::{cell::RefCell, io, rc::Rc, rc::Weak};

use crate::{net, runtime::Core};

/// Discriminant of the handle behind a dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Tcp,
    Udp,
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Open,
    Closing,
    Closed,
}

/// Dispatch trampoline stored in the loop's token table. The backend hands
/// back the token with every event; the loop inspects the trampoline to
/// route the event into the right handle's state machine.
#[derive(Clone)]
pub(crate) enum Trampoline {
    Tcp(Weak<RefCell<net::tcp::TcpCore>>),
    Udp(Weak<RefCell<net::udp::UdpCore>>),
}

/// State common to every handle: owning loop, lifecycle, keep-alive
/// participation and the backend dispatch token.
pub(crate) struct HandleBase {
    pub(crate) loop_: Rc<Core>,
    pub(crate) kind: HandleKind,
    pub(crate) lifecycle: Lifecycle,
    active: bool,
    token: Option<usize>,
    keep_slot: Option<usize>,
}

impl HandleBase {
    pub fn new(loop_: Rc<Core>, kind: HandleKind) -> Self {
        Self {
            loop_,
            kind,
            lifecycle: Lifecycle::Open,
            active: false,
            token: None,
            keep_slot: None,
        }
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.lifecycle != Lifecycle::Open
    }

    /// Mark the handle active. Idempotent. `strong` must produce the
    /// handle's own shared core: an active handle is owned by the loop so
    /// it survives the user dropping every clone, the way an accepted
    /// connection lives only in its callbacks.
    pub fn activate(&mut self, strong: impl FnOnce() -> Rc<dyn std::any::Any>) {
        if !self.active {
            self.active = true;
            self.loop_.adjust_active(1);
        }
        if self.keep_slot.is_none() {
            self.keep_slot = Some(self.loop_.keepalive.borrow_mut().insert(strong()));
        }
    }

    /// Mark the handle inactive. Idempotent.
    pub fn deactivate(&mut self) {
        if self.active {
            self.active = false;
            self.loop_.adjust_active(-1);
        }
        if let Some(slot) = self.keep_slot.take() {
            // The slab entry may be the last strong reference and the
            // caller usually holds a mutable borrow of the handle core, so
            // the actual drop is deferred to the loop's graveyard sweep.
            if let Some(rc) = self.loop_.keepalive.borrow_mut().try_remove(slot) {
                self.loop_.defer_drop(rc);
            }
        }
    }

    /// Dispatch token for this handle, allocating a trampoline slot on
    /// first use.
    pub fn token(&mut self, trampoline: impl FnOnce() -> Trampoline) -> usize {
        match self.token {
            Some(token) => token,
            None => {
                let token = self.loop_.trampolines.borrow_mut().insert(trampoline());
                self.token = Some(token);
                token
            }
        }
    }

    #[cfg(feature = "io-uring")]
    pub fn current_token(&self) -> Option<usize> {
        self.token
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn release_token(&mut self) {
        if let Some(token) = self.token.take() {
            self.loop_.trampolines.borrow_mut().try_remove(token);
        }
    }
}

/// Status delivered to callbacks of operations cancelled by a close.
pub(crate) fn ecanceled() -> io::Error {
    io::Error::from_raw_os_error(libc::ECANCELED)
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOTCONN)
}

pub(crate) fn invalid_state() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}
