//! HTTP/1.x on top of the strand event loop.
//!
//! The heart of the crate is [`h1::Parser`], a resumable push parser: feed
//! it byte slices as they arrive off a socket and it invokes callbacks for
//! every token it recognizes, never buffering body data itself. The
//! [`server`] module wires the parser to `strand_io::net::Tcp` handles into
//! a small callback-driven HTTP server.

pub mod h1;
pub mod server;

mod date;

pub use self::date::HttpDate;

pub use bytes;
pub use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version, header};
