//! Dispatch queue ordering and backpressure

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use busbridge_core::dispatch::{job, DispatchQueue, Dispatcher};
use busbridge_core::BridgeError;
use futures::FutureExt;

type Log = Vec<u32>;

fn push(queue: &DispatchQueue<Log>, n: u32) -> Result<(), BridgeError> {
    queue.submit(job(move |log: &mut Log| async move { log.push(n) }.boxed_local()))
}

fn snapshot(queue: &DispatchQueue<Log>) -> Log {
    let (tx, rx) = mpsc::channel();
    loop {
        let tx = tx.clone();
        let submitted = queue.submit(job(move |log: &mut Log| {
            let copy = log.clone();
            async move {
                tx.send(copy).unwrap();
            }
            .boxed_local()
        }));
        match submitted {
            Ok(()) => break,
            // the loop may still be draining a full queue
            Err(BridgeError::Overloaded { .. }) => thread::sleep(Duration::from_millis(10)),
            Err(e) => panic!("snapshot rejected: {e}"),
        }
    }
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[test]
fn test_jobs_run_in_submission_order() {
    let dispatcher = Dispatcher::spawn("dispatch-order", 16, |_| Ok(Log::new())).unwrap();

    // J1, J2, J3 from three different threads, strictly one after another
    for n in 1..=3 {
        let queue = dispatcher.queue();
        thread::spawn(move || push(&queue, n).unwrap())
            .join()
            .unwrap();
    }
    for n in 4..=10 {
        push(&dispatcher.queue(), n).unwrap();
    }

    assert_eq!(snapshot(&dispatcher.queue()), (1..=10).collect::<Log>());
    dispatcher.shutdown();
}

#[test]
fn test_full_queue_rejects_without_blocking() {
    const CAPACITY: usize = 3;
    let dispatcher = Dispatcher::spawn("dispatch-full", CAPACITY, |_| Ok(Log::new())).unwrap();
    let queue = dispatcher.queue();

    // park the dispatch thread inside a job
    let (started_tx, started_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    queue
        .submit(job(move |_: &mut Log| {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
            async {}.boxed_local()
        }))
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    for n in 0..CAPACITY as u32 {
        push(&queue, n).unwrap();
    }
    assert_eq!(queue.pending(), CAPACITY);

    let rejected = push(&queue, 99);
    assert!(matches!(
        rejected,
        Err(BridgeError::Overloaded { capacity: CAPACITY })
    ));
    assert_eq!(queue.pending(), CAPACITY);

    gate_tx.send(()).unwrap();
    assert_eq!(snapshot(&queue), vec![0, 1, 2]);
    dispatcher.shutdown();
}

#[test]
fn test_shutdown_drops_queued_jobs() {
    let dispatcher = Dispatcher::spawn("dispatch-stop", 2, |_| Ok(Log::new())).unwrap();
    let queue = dispatcher.queue();
    dispatcher.shutdown();
    assert!(!queue.is_running());
    assert!(matches!(push(&queue, 1), Err(BridgeError::ServiceUnavailable)));
}
