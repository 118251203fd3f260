//! HTTP/1.1 client over the strand event loop.
//!
//! Each request runs as a coroutine: resolve on a helper thread, connect,
//! write the serialized head and body, then parse the response off the
//! socket — every step bridged from handle callbacks into the coroutine
//! through a promise. The returned [`Promise`] resolves with the complete
//! `http::Response<Bytes>` once the exchange finishes; the connection is
//! not reused.

mod url;

pub use self::url::{Scheme, Url};

use std::{cell::RefCell, fmt, io, net::SocketAddr, rc::Rc};

use bytes::{Bytes, BytesMut};
use http::{
    HeaderMap, Method, Response, StatusCode, Version,
    header::{HeaderName, HeaderValue},
};
use strand_http::h1::{self, Abort, Callbacks, CbResult, Head, ParseError, Parser, encode};
use strand_io::{LoopHandle, net::Tcp, promise::Promise};
use tracing::debug;

#[derive(Debug)]
pub enum ClientError {
    Url,
    /// `https` URLs parse but need a TLS adapter this crate does not ship.
    TlsNotSupported,
    Resolve(io::Error),
    Io(io::Error),
    Parse(ParseError),
    /// The server closed the connection before a full response arrived.
    IncompleteResponse,
    /// The response head could not be represented with `http` types.
    InvalidResponse,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url => f.write_str("malformed url"),
            Self::TlsNotSupported => f.write_str("https requires an external tls adapter"),
            Self::Resolve(e) => write!(f, "resolve failed: {e}"),
            Self::Io(e) => write!(f, "io failed: {e}"),
            Self::Parse(e) => write!(f, "response parse failed: {e}"),
            Self::IncompleteResponse => f.write_str("connection closed before a full response"),
            Self::InvalidResponse => f.write_str("response head is not representable"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ClientError> for io::Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Io(e) | ClientError::Resolve(e) => e,
            other => io::Error::other(other),
        }
    }
}

/// HTTP/1.1 client bound to one loop.
#[derive(Clone)]
pub struct Client {
    handle: LoopHandle,
}

impl Client {
    pub fn new(handle: &LoopHandle) -> Self {
        Self {
            handle: handle.clone(),
        }
    }

    pub fn get(&self, url: &str) -> Promise<Response<Bytes>> {
        self.send(Method::GET, url, HeaderMap::new(), Bytes::new())
    }

    pub fn post(&self, url: &str, body: Bytes) -> Promise<Response<Bytes>> {
        self.send(Method::POST, url, HeaderMap::new(), body)
    }

    /// Issue one request. The promise completes on the loop thread with
    /// the full response, or with the error that ended the exchange.
    pub fn send(&self, method: Method, url: &str, headers: HeaderMap, body: Bytes) -> Promise<Response<Bytes>> {
        let promise = Promise::new();
        let completer = promise.clone();
        let handle = self.handle.clone();
        let url = url.to_string();

        self.handle.spawn(async move {
            let result = exchange(&handle, method, &url, headers, body).await;
            if let Err(error) = &result {
                debug!(target: "strand_client", error = %error, "request failed");
            }
            let _ = completer.complete(result.map_err(Into::into));
        });
        promise
    }
}

async fn exchange(
    handle: &LoopHandle,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Bytes>, ClientError> {
    let url = Url::parse(url).ok_or(ClientError::Url)?;
    if url.scheme == Scheme::Https {
        return Err(ClientError::TlsNotSupported);
    }

    let addr = resolve(url.host.clone(), url.port)
        .wait(handle)
        .await
        .map_err(ClientError::Resolve)?;

    let tcp = Tcp::new(handle);
    let connected = Promise::new();
    {
        let connected = connected.clone();
        tcp.connect(addr, move |_, result| {
            let _ = connected.complete(result);
        })?;
    }
    connected.wait(handle).await?;

    let mut head = BytesMut::with_capacity(256 + body.len());
    encode::request_head(&mut head, &method, &url.request_target(), &url.host_header(), &headers, body.len() as u64);
    head.extend_from_slice(&body);

    let written = Promise::new();
    {
        let written = written.clone();
        tcp.write(head.freeze(), move |_, result| {
            let _ = written.complete(result);
        })?;
    }
    written.wait(handle).await?;

    let response = read_response(handle, &tcp).await;
    tcp.close();
    response
}

/// Resolve on a helper thread; the loop never blocks on the resolver.
fn resolve(host: String, port: u16) -> Promise<SocketAddr> {
    let promise = Promise::new();
    let completer = promise.clone();
    std::thread::spawn(move || {
        use std::net::ToSocketAddrs;
        let result = (host.as_str(), port).to_socket_addrs().and_then(|mut addrs| {
            addrs
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"))
        });
        let _ = completer.complete(result);
    });
    promise
}

/// Aggregates response parser callbacks.
struct ResponseCollector {
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    current_name: Vec<u8>,
    current_value: Vec<u8>,
    in_value: bool,
    body: Vec<u8>,
    head: Option<Head>,
}

impl ResponseCollector {
    fn new() -> Self {
        Self {
            headers: Vec::new(),
            current_name: Vec::new(),
            current_value: Vec::new(),
            in_value: false,
            body: Vec::new(),
            head: None,
        }
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

    fn into_response(&mut self, status: u16, minor: u8) -> Result<Response<Bytes>, ClientError> {
        let _ = self.head.take().ok_or(ClientError::IncompleteResponse)?;
        let mut response = Response::new(Bytes::from(std::mem::take(&mut self.body)));
        *response.status_mut() = StatusCode::from_u16(status).map_err(|_| ClientError::InvalidResponse)?;
        *response.version_mut() = if minor == 0 { Version::HTTP_10 } else { Version::HTTP_11 };
        let headers = response.headers_mut();
        for (name, value) in self.headers.drain(..) {
            let name = HeaderName::from_bytes(&name).map_err(|_| ClientError::InvalidResponse)?;
            let value = HeaderValue::from_maybe_shared(Bytes::from(value)).map_err(|_| ClientError::InvalidResponse)?;
            headers.append(name, value);
        }
        Ok(response)
    }
}

impl Callbacks for ResponseCollector {
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
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn on_message_complete(&mut self) -> CbResult {
        Ok(())
    }

    fn on_status(&mut self, _raw: &[u8]) -> CbResult {
        Ok(())
    }

    fn on_url(&mut self, _raw: &[u8]) -> CbResult {
        // Responses carry no url; aborting here would flag a parser bug.
        Err(Abort)
    }
}

async fn read_response(handle: &LoopHandle, tcp: &Tcp) -> Result<Response<Bytes>, ClientError> {
    struct ReadState {
        parser: Parser,
        collector: ResponseCollector,
    }

    let state = Rc::new(RefCell::new(ReadState {
        parser: Parser::new(h1::Config::response()),
        collector: ResponseCollector::new(),
    }));
    let done = Promise::<()>::new();

    {
        let state = state.clone();
        let done = done.clone();
        tcp.read_start(move |tcp, result| {
            let outcome = {
                let mut guard = state.borrow_mut();
                let ReadState { parser, collector } = &mut *guard;
                match result {
                    Ok(Some(bytes)) => match parser.execute(collector, &bytes) {
                        Ok(_) if parser.is_complete() => Some(Ok(())),
                        Ok(_) => None,
                        Err(e) => Some(Err(io::Error::other(ClientError::Parse(e)))),
                    },
                    Ok(None) => match parser.finish(collector) {
                        Ok(()) if parser.is_complete() => Some(Ok(())),
                        Ok(()) => Some(Err(io::Error::other(ClientError::IncompleteResponse))),
                        Err(_) => Some(Err(io::Error::other(ClientError::IncompleteResponse))),
                    },
                    Err(e) => Some(Err(e)),
                }
            };
            if let Some(result) = outcome {
                tcp.read_stop();
                let _ = done.complete(result);
            }
        })?;
    }

    done.wait(handle).await?;

    let mut guard = state.borrow_mut();
    let ReadState { parser, collector } = &mut *guard;
    collector.into_response(parser.status_code(), parser.version().1)
}
