use std::{cell::RefCell, rc::Rc};

use strand_client::Client;
use strand_http::{Request, Response, StatusCode, server::Server};
use strand_io::{Config, EventLoop, RunMode, bytes::Bytes};

fn service(req: Request<Bytes>) -> Response<Bytes> {
    let body = format!("{} {} {}", req.method(), req.uri(), String::from_utf8_lossy(req.body()));
    Response::builder()
        .status(StatusCode::OK)
        .header("x-origin", "test")
        .body(Bytes::from(body))
        .unwrap()
}

#[test]
fn get_roundtrip_against_local_server() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let server = Rc::new(Server::bind(&handle, "127.0.0.1:0".parse().unwrap(), service).unwrap());
    let port = server.local_addr().unwrap().port();

    let client = Client::new(&handle);
    let promise = client.get(&format!("http://127.0.0.1:{port}/hello?x=1"));

    let observed = Rc::new(RefCell::new(None));
    {
        let observed = observed.clone();
        let waiter = handle.clone();
        let server = server.clone();
        handle.spawn(async move {
            let result = promise.wait(&waiter).await;
            *observed.borrow_mut() = Some(result);
            server.close();
        });
    }

    event_loop.run(RunMode::Default).unwrap();

    let response = observed.borrow_mut().take().expect("promise resolved").unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-origin").unwrap(), "test");
    assert_eq!(&response.body()[..], b"GET /hello?x=1 ");
}

#[test]
fn post_body_reaches_the_service() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let server = Rc::new(Server::bind(&handle, "127.0.0.1:0".parse().unwrap(), service).unwrap());
    let port = server.local_addr().unwrap().port();

    let client = Client::new(&handle);
    let promise = client.post(
        &format!("http://127.0.0.1:{port}/submit"),
        Bytes::from_static(b"payload"),
    );

    let observed = Rc::new(RefCell::new(None));
    {
        let observed = observed.clone();
        let waiter = handle.clone();
        let server = server.clone();
        handle.spawn(async move {
            let result = promise.wait(&waiter).await;
            *observed.borrow_mut() = Some(result);
            server.close();
        });
    }

    event_loop.run(RunMode::Default).unwrap();

    let response = observed.borrow_mut().take().expect("promise resolved").unwrap();
    assert_eq!(&response.body()[..], b"POST /submit payload");
}

#[test]
fn https_fails_without_a_tls_adapter() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let client = Client::new(&handle);
    let promise = client.get("https://example.com/secret");

    let observed = Rc::new(RefCell::new(None));
    {
        let observed = observed.clone();
        let waiter = handle.clone();
        handle.spawn(async move {
            *observed.borrow_mut() = Some(promise.wait(&waiter).await);
        });
    }

    event_loop.run(RunMode::Default).unwrap();

    let err = observed.borrow_mut().take().expect("promise resolved").unwrap_err();
    assert!(err.to_string().contains("tls"));
}
