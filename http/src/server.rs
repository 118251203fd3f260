//! Callback-driven HTTP/1.1 server on top of `strand_io`.
//!
//! One [`crate::h1::Parser`] per connection feeds a request collector;
//! when a message completes the service is invoked with an aggregated
//! `http::Request<Bytes>` and its `http::Response<Bytes>` is serialized
//! through the handle's write queue. Keep-alive and pipelining follow the
//! parser's connection flags.

use std::{cell::RefCell, io, net::SocketAddr, rc::Rc};

use bytes::{Bytes, BytesMut};
use http::{
    HeaderMap, Request, Response, StatusCode, Uri, Version,
    header::{HeaderName, HeaderValue},
};
use strand_io::{LoopHandle, net::Tcp};
use tracing::{debug, warn};

use crate::{
    HttpDate,
    h1::{self, Abort, Callbacks, CbResult, Head, Parser},
};

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Parser limits; the kind is forced to `Request`.
    pub parser: h1::Config,
    /// Cap on an aggregated request body. Larger requests get a 413.
    pub max_body: usize,
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            parser: h1::Config::request(),
            max_body: 4 * 1024 * 1024,
            backlog: 256,
        }
    }
}

type Service = Rc<dyn Fn(Request<Bytes>) -> Response<Bytes> + 'static>;

/// A listening HTTP server bound to one address.
pub struct Server {
    listener: Tcp,
}

impl Server {
    pub fn bind<F>(handle: &LoopHandle, addr: SocketAddr, service: F) -> io::Result<Self>
    where
        F: Fn(Request<Bytes>) -> Response<Bytes> + 'static,
    {
        Self::bind_with(handle, addr, ServerConfig::default(), service)
    }

    pub fn bind_with<F>(handle: &LoopHandle, addr: SocketAddr, config: ServerConfig, service: F) -> io::Result<Self>
    where
        F: Fn(Request<Bytes>) -> Response<Bytes> + 'static,
    {
        let listener = Tcp::new(handle);
        listener.bind(addr)?;

        let service: Service = Rc::new(service);
        let config = Rc::new(config);
        let date = Rc::new(HttpDate::new());

        let backlog = config.backlog;
        listener.listen(backlog, move |listener, result| {
            match result.and_then(|()| listener.accept()) {
                Ok(conn) => Connection::start(conn, service.clone(), config.clone(), date.clone()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => warn!(target: "strand_server", error = %e, "accept failed"),
            }
        })?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn close(&self) {
        self.listener.close();
    }
}

/// Aggregates parser callbacks into one request.
struct Collector {
    url: Vec<u8>,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    current_name: Vec<u8>,
    current_value: Vec<u8>,
    in_value: bool,
    body: Vec<u8>,
    max_body: usize,
    body_overflow: bool,
    head: Option<Head>,
}

impl Collector {
    fn new(max_body: usize) -> Self {
        Self {
            url: Vec::new(),
            headers: Vec::new(),
            current_name: Vec::new(),
            current_value: Vec::new(),
            in_value: false,
            body: Vec::new(),
            max_body,
            body_overflow: false,
            head: None,
        }
    }

    fn reset(&mut self) {
        self.url.clear();
        self.headers.clear();
        self.current_name.clear();
        self.current_value.clear();
        self.in_value = false;
        self.body.clear();
        self.body_overflow = false;
        self.head = None;
    }

    fn flush_header(&mut self) {
        if !self.current_name.is_empty() {
            self.headers.push((
                std::mem::take(&mut self.current_name),
                std::mem::take(&mut self.current_value),
            ));
        }
        self.in_value = false;
    }

    fn into_request(&mut self, version: Version) -> Option<Request<Bytes>> {
        let head = self.head.take()?;

        let uri = Uri::from_maybe_shared(Bytes::from(std::mem::take(&mut self.url))).ok()?;
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers.drain(..) {
            let name = HeaderName::from_bytes(&name).ok()?;
            let value = HeaderValue::from_maybe_shared(Bytes::from(value)).ok()?;
            headers.append(name, value);
        }

        let mut request = Request::new(Bytes::from(std::mem::take(&mut self.body)));
        *request.method_mut() = head.method?;
        *request.uri_mut() = uri;
        *request.version_mut() = version;
        *request.headers_mut() = headers;
        Some(request)
    }
}

impl Callbacks for Collector {
    fn on_url(&mut self, raw: &[u8]) -> CbResult {
        self.url.extend_from_slice(raw);
        Ok(())
    }

    fn on_header_field(&mut self, raw: &[u8]) -> CbResult {
        if self.in_value {
            self.flush_header();
        }
        self.current_name.extend_from_slice(raw);
        Ok(())
    }

    fn on_header_value(&mut self, raw: &[u8]) -> CbResult {
        self.in_value = true;
        self.current_value.extend_from_slice(raw);
        Ok(())
    }

    fn on_headers_complete(&mut self, head: &Head) -> CbResult {
        self.flush_header();
        self.head = Some(head.clone());
        Ok(())
    }

    fn on_body(&mut self, chunk: &[u8]) -> CbResult {
        if self.body.len() + chunk.len() > self.max_body {
            self.body_overflow = true;
            return Err(Abort);
        }
        self.body.extend_from_slice(chunk);
        Ok(())
    }
}

struct ConnState {
    parser: Parser,
    collector: Collector,
}

struct Connection;

impl Connection {
    fn start(conn: Tcp, service: Service, config: Rc<ServerConfig>, date: Rc<HttpDate>) {
        let mut parser_config = config.parser.clone();
        parser_config.kind = h1::Kind::Request;
        let state = Rc::new(RefCell::new(ConnState {
            parser: Parser::new(parser_config),
            collector: Collector::new(config.max_body),
        }));

        let started = conn.read_start(move |tcp, result| match result {
            Ok(Some(bytes)) => feed(tcp, &state, &service, &date, &bytes),
            Ok(None) => tcp.close(),
            Err(e) => {
                debug!(target: "strand_server", error = %e, "connection read failed");
                tcp.close();
            }
        });
        if started.is_err() {
            conn.close();
        }
    }
}

enum Step {
    /// A full request was parsed; respond and maybe continue.
    Respond(Box<Request<Bytes>>, bool),
    /// More input required.
    Idle,
    Reject(StatusCode),
}

fn feed(tcp: &Tcp, state: &Rc<RefCell<ConnState>>, service: &Service, date: &Rc<HttpDate>, data: &Bytes) {
    let mut offset = 0;
    loop {
        let step = {
            let mut guard = state.borrow_mut();
            let ConnState { parser, collector } = &mut *guard;
            match parser.execute(collector, &data[offset..]) {
                Ok(n) => {
                    offset += n;
                    if parser.is_complete() {
                        let close = parser.should_close();
                        let version = if parser.version().1 == 0 { Version::HTTP_10 } else { Version::HTTP_11 };
                        let request = collector.into_request(version);
                        parser.reset();
                        collector.reset();
                        match request {
                            Some(request) => Step::Respond(Box::new(request), close),
                            None => Step::Reject(StatusCode::BAD_REQUEST),
                        }
                    } else {
                        Step::Idle
                    }
                }
                Err(_) => {
                    if collector.body_overflow {
                        Step::Reject(StatusCode::PAYLOAD_TOO_LARGE)
                    } else {
                        Step::Reject(StatusCode::BAD_REQUEST)
                    }
                }
            }
        };

        match step {
            Step::Idle => return,
            Step::Reject(status) => {
                let response = Response::builder()
                    .status(status)
                    .body(Bytes::new())
                    .unwrap_or_else(|_| Response::new(Bytes::new()));
                write_response(tcp, response, true, date);
                return;
            }
            Step::Respond(request, close) => {
                let response = service(*request);
                write_response(tcp, response, close, date);
                if close || offset >= data.len() {
                    return;
                }
                // Pipelined request bytes remain in this chunk.
            }
        }
    }
}

fn write_response(tcp: &Tcp, response: Response<Bytes>, close: bool, date: &Rc<HttpDate>) {
    let (parts, body) = response.into_parts();
    let mut buf = BytesMut::with_capacity(256 + body.len());
    date.with(|date| {
        crate::h1::encode::response_head(&mut buf, parts.status, &parts.headers, body.len() as u64, date, close)
    });
    buf.extend_from_slice(&body);

    let written = tcp.write(buf.freeze(), move |tcp, result| {
        if let Err(e) = result {
            debug!(target: "strand_server", error = %e, "response write failed");
            tcp.close();
        } else if close {
            tcp.close();
        }
    });
    if written.is_err() {
        tcp.close();
    }
}
