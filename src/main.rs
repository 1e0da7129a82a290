//! Demo driver: spawns CPU-bound workers that get preempted, sleep and block, then shuts
//! the process down by terminating the main thread.

use std::hint::black_box;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use uthreads::arch::x86_64::cpu_relax;
use uthreads::{uthread, Config, Error, ThreadState, Tid};

/// Busy-loop iterations per work round.
const SPIN_ITERS: u64 = 2_000_000;

static ROUNDS: AtomicU64 = AtomicU64::new(0);

#[derive(Parser)]
#[command(name = "uthreads-demo")]
#[command(version)]
#[command(about = "Round-robin user-level threads on a single native thread")]
struct Cli {
    /// Quantum length in microseconds of process CPU time
    #[arg(short, long, default_value_t = 10_000)]
    quantum_us: u64,

    /// Worker threads to spawn
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Work rounds per worker
    #[arg(short, long, default_value_t = 6)]
    rounds: u64,

    /// Stack size per worker in KiB
    #[arg(long, default_value_t = 64)]
    stack_kib: usize,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn spin() -> u64 {
    let mut acc = 0u64;
    for i in 0..SPIN_ITERS {
        acc = acc.wrapping_add(i ^ acc.rotate_left(5));
        cpu_relax();
    }
    black_box(acc)
}

/// Workers only allocate or log with preemption masked: a thread switched out halfway
/// through `malloc` would otherwise deadlock the next one that calls it.
fn worker() {
    let tid = uthread::current_tid();
    let rounds = ROUNDS.load(Ordering::Relaxed);

    for round in 1..=rounds {
        spin();
        uthread::without_preemption(|| {
            info!(
                %tid,
                round,
                quanta = uthread::quanta_for(tid).unwrap_or(0),
                total = uthread::total_quanta(),
                "worker progress"
            )
        });

        let outcome = match round % 3 {
            0 => uthread::sleep(2),
            1 if tid.raw() % 2 == 0 => uthread::block(tid),
            _ => Ok(()),
        };
        if let Err(err) = outcome {
            uthread::without_preemption(|| warn!(%tid, %err, "worker could not suspend"));
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    ROUNDS.store(cli.rounds, Ordering::Relaxed);

    let config = match Config::from_micros(cli.quantum_us) {
        Ok(config) => config.with_stack_size(cli.stack_kib * 1024),
        Err(err) => {
            error!(%err, "invalid configuration");
            process::exit(1);
        }
    };
    if let Err(err) = uthread::init_with(config) {
        error!(%err, "cannot initialize the thread runtime");
        process::exit(1);
    }

    let mut workers = Vec::with_capacity(cli.threads);
    for _ in 0..cli.threads {
        match uthread::spawn(Some(worker)) {
            Ok(tid) => workers.push(tid),
            Err(Error::TableFull) => {
                uthread::without_preemption(|| warn!(spawned = workers.len(), "thread table full"));
                break;
            }
            Err(err) => {
                uthread::without_preemption(|| error!(%err, "spawn failed"));
                process::exit(1);
            }
        }
    }

    // Main keeps taking its turns, waking blocked workers until every one has finished.
    loop {
        let mut alive = 0;
        for &tid in &workers {
            match uthread::state_of(tid) {
                Ok(ThreadState::Blocked) => {
                    alive += 1;
                    let _ = uthread::resume(tid);
                }
                Ok(_) => alive += 1,
                Err(_) => {}
            }
        }
        if alive == 0 {
            break;
        }
        spin();
    }

    uthread::without_preemption(|| {
        info!(
            workers = workers.len(),
            total_quanta = uthread::total_quanta(),
            main_quanta = uthread::quanta_for(Tid::MAIN).unwrap_or(0),
            "all workers finished"
        )
    });
    let _ = uthread::terminate(Tid::MAIN);
}
