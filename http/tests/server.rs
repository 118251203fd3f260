use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use strand_http::{Request, Response, StatusCode, h1, server::Server};
use strand_io::{Config, EventLoop, RunMode, bytes::Bytes, net::Tcp};

fn service(req: Request<Bytes>) -> Response<Bytes> {
    let body = format!(
        "{} {} {}",
        req.method(),
        req.uri().path(),
        String::from_utf8_lossy(req.body())
    );
    Response::builder()
        .status(StatusCode::OK)
        .header("x-served-by", "strand")
        .body(Bytes::from(body))
        .unwrap()
}

struct NullCallbacks;

impl h1::Callbacks for NullCallbacks {}

#[test]
fn serves_a_request_and_honors_connection_close() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let server = Rc::new(Server::bind(&handle, "127.0.0.1:0".parse().unwrap(), service).unwrap());
    let addr = server.local_addr().unwrap();

    let raw = Rc::new(RefCell::new(Vec::new()));
    let client = Tcp::new(&handle);
    {
        let raw = raw.clone();
        let server = server.clone();
        client
            .connect(addr, move |client, result| {
                result.unwrap();
                client
                    .write(
                        Bytes::from_static(
                            b"POST /echo HTTP/1.1\r\nhost: t\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello",
                        ),
                        |_, result| result.unwrap(),
                    )
                    .unwrap();
                client
                    .read_start(move |client, result| match result.unwrap() {
                        Some(bytes) => raw.borrow_mut().extend_from_slice(&bytes),
                        None => {
                            client.close();
                            server.close();
                        }
                    })
                    .unwrap();
            })
            .unwrap();
    }

    event_loop.run(RunMode::Default).unwrap();

    let raw = raw.borrow();
    let text = std::str::from_utf8(&raw).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("x-served-by: strand\r\n"));
    assert!(text.contains("connection: close\r\n"));
    assert!(text.contains("content-length: 16\r\n"));
    assert!(text.contains("date: "));
    assert!(text.ends_with("\r\n\r\nPOST /echo hello"));
}

#[test]
fn keeps_alive_and_answers_pipelined_requests_in_order() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let server = Rc::new(Server::bind(&handle, "127.0.0.1:0".parse().unwrap(), service).unwrap());
    let addr = server.local_addr().unwrap();

    let completed = Rc::new(Cell::new(0u32));
    let bodies = Rc::new(RefCell::new(Vec::new()));

    let client = Tcp::new(&handle);
    {
        let completed = completed.clone();
        let bodies = bodies.clone();
        let server = server.clone();
        client
            .connect(addr, move |client, result| {
                result.unwrap();
                client
                    .write(
                        Bytes::from_static(b"GET /a HTTP/1.1\r\nhost: t\r\n\r\nGET /b HTTP/1.1\r\nhost: t\r\n\r\n"),
                        |_, result| result.unwrap(),
                    )
                    .unwrap();

                let parser = Rc::new(RefCell::new(h1::Parser::new(h1::Config::response())));
                struct BodySink(Rc<RefCell<Vec<Vec<u8>>>>);
                impl h1::Callbacks for BodySink {
                    fn on_message_begin(&mut self) -> h1::CbResult {
                        self.0.borrow_mut().push(Vec::new());
                        Ok(())
                    }
                    fn on_body(&mut self, chunk: &[u8]) -> h1::CbResult {
                        if let Some(last) = self.0.borrow_mut().last_mut() {
                            last.extend_from_slice(chunk);
                        }
                        Ok(())
                    }
                }

                let completed = completed.clone();
                let bodies = bodies.clone();
                let server = server.clone();
                client
                    .read_start(move |client, result| match result.unwrap() {
                        Some(bytes) => {
                            let mut offset = 0;
                            while offset < bytes.len() {
                                let mut sink = BodySink(bodies.clone());
                                let n = parser.borrow_mut().execute(&mut sink, &bytes[offset..]).unwrap();
                                offset += n;
                                if parser.borrow().is_complete() {
                                    completed.set(completed.get() + 1);
                                    parser.borrow_mut().reset();
                                    if completed.get() == 2 {
                                        client.close();
                                        server.close();
                                        return;
                                    }
                                }
                            }
                        }
                        None => client.close(),
                    })
                    .unwrap();
            })
            .unwrap();
    }

    event_loop.run(RunMode::Default).unwrap();

    assert_eq!(completed.get(), 2);
    let bodies = bodies.borrow();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0], b"GET /a ");
    assert_eq!(bodies[1], b"GET /b ");
}

#[test]
fn malformed_requests_get_a_400_and_a_close() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let server = Rc::new(Server::bind(&handle, "127.0.0.1:0".parse().unwrap(), service).unwrap());
    let addr = server.local_addr().unwrap();

    let raw = Rc::new(RefCell::new(Vec::new()));
    let client = Tcp::new(&handle);
    {
        let raw = raw.clone();
        let server = server.clone();
        client
            .connect(addr, move |client, result| {
                result.unwrap();
                client
                    .write(Bytes::from_static(b"blah blah\r\n\r\n"), |_, result| result.unwrap())
                    .unwrap();
                client
                    .read_start(move |client, result| match result.unwrap() {
                        Some(bytes) => raw.borrow_mut().extend_from_slice(&bytes),
                        None => {
                            client.close();
                            server.close();
                        }
                    })
                    .unwrap();
            })
            .unwrap();
    }

    event_loop.run(RunMode::Default).unwrap();

    let raw = raw.borrow();
    let text = std::str::from_utf8(&raw).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {text}");
}
