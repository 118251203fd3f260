use std::{cell::RefCell, rc::Rc, thread, time::Duration};

use strand_io::{Config, EventLoop, RunMode, promise::Promise};

#[test]
fn cross_thread_complete_resumes_on_loop_thread() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let promise = Promise::<u32>::new();
    let completer = promise.clone();

    let loop_thread = thread::current().id();
    let observed = Rc::new(RefCell::new(None));
    let sink = observed.clone();

    let awaiting = handle.clone();
    event_loop.spawn(async move {
        let value = promise.wait(&awaiting).await.unwrap();
        *sink.borrow_mut() = Some((value, thread::current().id()));
    });

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        completer.complete(Ok(7)).unwrap();
        // The second completion is rejected and schedules nothing.
        assert!(completer.complete(Ok(8)).is_err());
    });

    event_loop.run(RunMode::Default).unwrap();
    worker.join().unwrap();

    let (value, resumed_on) = observed.borrow().expect("coroutine resumed");
    assert_eq!(value, 7);
    assert_eq!(resumed_on, loop_thread);
}

#[test]
fn awaiting_a_completed_promise_returns_immediately() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let promise = Promise::<&'static str>::new();
    promise.complete(Ok("done")).unwrap();

    let observed = Rc::new(RefCell::new(None));
    let sink = observed.clone();
    let awaiting = handle.clone();
    let waited = promise.clone();
    event_loop.spawn(async move {
        *sink.borrow_mut() = Some(waited.wait(&awaiting).await.unwrap());
    });

    event_loop.run(RunMode::Default).unwrap();
    assert_eq!(*observed.borrow(), Some("done"));
}

#[test]
fn error_outcome_propagates_to_the_awaiter() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let promise = Promise::<()>::new();
    let completer = promise.clone();

    let observed = Rc::new(RefCell::new(None));
    let sink = observed.clone();
    let awaiting = handle.clone();
    event_loop.spawn(async move {
        let err = promise.wait(&awaiting).await.unwrap_err();
        *sink.borrow_mut() = Some(err.kind());
    });

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        completer
            .complete(Err(std::io::Error::from(std::io::ErrorKind::TimedOut)))
            .unwrap();
    });

    event_loop.run(RunMode::Default).unwrap();
    worker.join().unwrap();
    assert_eq!(*observed.borrow(), Some(std::io::ErrorKind::TimedOut));
}

#[test]
fn chained_promises_keep_the_loop_alive() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let first = Promise::<u32>::new();
    let second = Promise::<u32>::new();

    let observed = Rc::new(RefCell::new(Vec::new()));
    let sink = observed.clone();
    let awaiting = handle.clone();
    let first_wait = first.clone();
    let second_wait = second.clone();
    event_loop.spawn(async move {
        let a = first_wait.wait(&awaiting).await.unwrap();
        sink.borrow_mut().push(a);
        let b = second_wait.wait(&awaiting).await.unwrap();
        sink.borrow_mut().push(b);
    });

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        first.complete(Ok(1)).unwrap();
        thread::sleep(Duration::from_millis(5));
        second.complete(Ok(2)).unwrap();
    });

    event_loop.run(RunMode::Default).unwrap();
    worker.join().unwrap();
    assert_eq!(*observed.borrow(), vec![1, 2]);
}
