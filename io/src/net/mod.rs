//! Socket handles driven by the loop's backend.

pub(crate) mod tcp;
#[cfg(feature = "io-uring")]
mod tcp_uring;
pub(crate) mod udp;

pub use self::{tcp::Tcp, udp::Udp};

use std::{io, net::SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};

/// Non-blocking socket for `addr`'s family, the way the listener setup
/// does it everywhere else in this workspace.
pub(crate) fn new_socket(addr: &SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
