//! Real `SIGVTALRM` preemption through the process-wide API.
//!
//! Runs without the libtest harness: the scenario ends by terminating the main thread from
//! a user thread, which exits the process with status 0. A busy helper OS thread shares the
//! process CPU time, so some timer expiries land on it and must be forwarded.

use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use uthreads::{uthread, Error, Tid, VirtualTimer};

const QUANTUM_US: u64 = 2_000;
const WORKERS: usize = 3;
const DEADLINE: Duration = Duration::from_secs(30);

static STOP: AtomicBool = AtomicBool::new(false);
static HELPER_STOP: AtomicBool = AtomicBool::new(false);

/// Never yields; only the timer can take the CPU away.
fn spinner() {
    while !STOP.load(Ordering::Relaxed) {
        hint::spin_loop();
    }
}

fn ends_process() {
    let _ = uthread::terminate(Tid::MAIN);
    unreachable!("terminating the main thread returned");
}

fn wait_until(what: &str, deadline: Instant, mut done: impl FnMut() -> bool) {
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        hint::spin_loop();
    }
}

fn main() {
    let deadline = Instant::now() + DEADLINE;
    uthread::init(QUANTUM_US).expect("init");
    assert_eq!(uthread::current_tid(), Tid::MAIN);

    let foreign = thread::spawn(|| {
        (
            matches!(uthread::spawn(Some(spinner)), Err(Error::ForeignThread)),
            matches!(uthread::init(QUANTUM_US), Err(Error::ForeignThread)),
        )
    })
    .join()
    .expect("foreign thread");
    assert_eq!(foreign, (true, true), "other OS threads must be refused");

    let helper = thread::spawn(|| {
        while !HELPER_STOP.load(Ordering::Relaxed) {
            hint::spin_loop();
        }
    });

    let workers: Vec<Tid> = (0..WORKERS)
        .map(|_| uthread::spawn(Some(spinner)).expect("spawn"))
        .collect();

    wait_until("every spinner to be scheduled", deadline, || {
        workers
            .iter()
            .all(|&tid| uthread::quanta_for(tid).is_ok_and(|quanta| quanta >= 1))
    });
    assert!(uthread::quanta_for(Tid::MAIN).expect("main quanta") >= 2);
    assert!(uthread::total_quanta() > WORKERS as u64);

    wait_until("a tick forwarded from the helper thread", deadline, || VirtualTimer::forwarded() > 0);
    HELPER_STOP.store(true, Ordering::Relaxed);
    helper.join().expect("helper thread");

    STOP.store(true, Ordering::Relaxed);
    wait_until("the spinners to finish", deadline, || {
        workers.iter().all(|&tid| uthread::state_of(tid).is_err())
    });

    uthread::spawn(Some(ends_process)).expect("spawn finisher");
    wait_until("the process to exit", deadline, || false);
}
