//! Channel throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin pc-bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin consumer to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use baton::record::Record;
use baton::{RecvHalf, SendHalf, Strategy, channel};

const CAPACITY: usize = 1024;
const WIDTH: usize = 16;
const ITERATIONS: u64 = 1 << 20;

const PAYLOAD_BYTE: u8 = 0x55;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn bench_strategy(strategy: Strategy, producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (tx, rx) = channel::<WIDTH, CAPACITY>(strategy).unwrap();

    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();

    // Consumer thread
    let consumer_thread = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);

        // Signal ready
        ready_clone.store(true, Ordering::Release);

        for _ in 0..ITERATIONS {
            let record = rx.receive().unwrap();
            if record.as_bytes()[0] != PAYLOAD_BYTE {
                panic!("payload corrupted");
            }
        }
        assert_eq!(rx.consumed(), ITERATIONS);
    });

    // Wait for consumer to be ready
    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    pin_to_cpu(producer_cpu);

    let record = Record::<WIDTH>::from_bytes([PAYLOAD_BYTE; WIDTH]);
    let start = Instant::now();

    for _ in 0..ITERATIONS {
        tx.send(record).unwrap();
    }

    consumer_thread.join().unwrap();
    let elapsed = start.elapsed();

    let ops_per_ms = ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos();
    println!("{strategy}: {ops_per_ms} ops/ms");
}

fn main() {
    let (producer_cpu, consumer_cpu) = get_cpu_affinity();

    println!("baton channels (capacity={CAPACITY}, width={WIDTH}, iters={ITERATIONS}):");
    for strategy in [
        Strategy::DirectStream,
        Strategy::PerSlotLock,
        Strategy::GlobalBroadcast,
    ] {
        bench_strategy(strategy, producer_cpu, consumer_cpu);
    }
}
