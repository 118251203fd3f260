use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use strand_io::{Config, EventLoop, RunMode, Timer};

#[test]
fn default_run_with_nothing_returns_immediately() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    event_loop.run(RunMode::Default).unwrap();
}

#[test]
fn timer_fires_after_timeout() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let fired = Rc::new(Cell::new(false));
    let observed = fired.clone();
    let start = event_loop.now_micros();

    let timer = Timer::new(&handle);
    timer.start(Duration::from_millis(20), None, move |t| {
        observed.set(true);
        t.close();
    });

    event_loop.run(RunMode::Default).unwrap();

    assert!(fired.get());
    assert!(event_loop.now_micros() - start >= 20_000);
}

#[test]
fn equal_deadlines_fire_in_insertion_order() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let order = Rc::new(RefCell::new(Vec::new()));

    for id in 0..4u32 {
        let order = order.clone();
        let timer = Timer::new(&handle);
        timer.start(Duration::from_millis(10), None, move |t| {
            order.borrow_mut().push(id);
            t.close();
        });
    }

    event_loop.run(RunMode::Default).unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
}

#[test]
fn periodic_timer_repeats_until_stopped() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let count = Rc::new(Cell::new(0u32));
    let counted = count.clone();

    let timer = Timer::new(&handle);
    timer.start(Duration::from_millis(5), Some(Duration::from_millis(5)), move |t| {
        let n = counted.get() + 1;
        counted.set(n);
        if n == 3 {
            t.close();
        }
    });

    event_loop.run(RunMode::Default).unwrap();
    assert_eq!(count.get(), 3);
}

#[test]
fn nowait_does_not_block() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    // An armed timer far in the future keeps the loop alive, yet NoWait
    // must return without sleeping on it.
    let timer = Timer::new(&handle);
    timer.start(Duration::from_secs(60), None, |_| {});

    let start = std::time::Instant::now();
    event_loop.run(RunMode::NoWait).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));

    timer.close();
    event_loop.run(RunMode::Default).unwrap();
}

#[test]
fn queued_local_work_runs_in_order() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    let order = Rc::new(RefCell::new(Vec::new()));
    for id in 0..3u32 {
        let order = order.clone();
        handle.queue_local(move |_| order.borrow_mut().push(id));
    }

    event_loop.run(RunMode::Default).unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn cross_thread_work_wakes_a_blocked_poll() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();
    let sender = event_loop.work_sender();

    let seen = Arc::new(AtomicBool::new(false));
    let observed = seen.clone();

    // Keep the loop alive until the worker reports in.
    let guard = handle.keep_alive();

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        sender.send(move |lh| {
            observed.store(true, Ordering::SeqCst);
            lh.stop();
        });
    });

    let started = std::time::Instant::now();
    event_loop.run(RunMode::Default).unwrap();

    assert!(seen.load(Ordering::SeqCst));
    assert!(started.elapsed() >= Duration::from_millis(20));

    drop(guard);
    worker.join().unwrap();
    event_loop.run(RunMode::Default).unwrap();
}

#[test]
fn stop_exits_a_default_run() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let handle = event_loop.handle();

    // A repeating timer would keep the loop alive forever without stop.
    let timer = Timer::new(&handle);
    let ticks = Rc::new(Cell::new(0u32));
    let counted = ticks.clone();
    timer.start(Duration::from_millis(1), Some(Duration::from_millis(1)), move |_| {
        counted.set(counted.get() + 1);
    });

    let stop_handle = handle.clone();
    let stop_timer = Timer::new(&handle);
    stop_timer.start(Duration::from_millis(30), None, move |t| {
        stop_handle.stop();
        t.close();
    });

    event_loop.run(RunMode::Default).unwrap();
    assert!(ticks.get() >= 1);

    timer.close();
    event_loop.run(RunMode::Default).unwrap();
}
