//! Producer/consumer word demo.
//!
//! Moves a fixed number of vocabulary words across one channel and prints
//! each on arrival. The two sides run as threads over a heap channel, or as
//! parent and forked child over an inherited pipe or a shared memory
//! region.
//!
//! # Usage
//!
//! ```sh
//! baton-pc <stream|slots|broadcast> <event-count> <prod-interval> <con-interval> [thread|fork]
//! ```
//!
//! An interval paces its side: after every `interval` records that side
//! sleeps for one second. `0` runs unpaced.
//!
//! # Exit status
//!
//! `0` on success, `1` on a usage error, `2` when the transport fails.

use std::thread;

use rustix::io::Errno;
use thiserror::Error;

use baton::channel::broadcast::{BroadcastReceiver, BroadcastSender};
use baton::channel::slotted::{SlottedReceiver, SlottedSender};
use baton::channel::stream;
use baton::pump::{Pacing, run_consumer, run_producer};
use baton::shm::ShmPath;
use baton::vocab::WordPicker;
use baton::{DEFAULT_WIDTH, Record, RecvHalf, SendHalf, Strategy, TransportError, channel};

/// Ring capacity for the slotted and broadcast strategies.
const QUEUE_CAPACITY: usize = 32;

const USAGE: &str =
    "usage: baton-pc <stream|slots|broadcast> <event-count> <prod-interval> <con-interval> [thread|fork]";

#[derive(Debug, Error)]
enum DemoError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("fork failed: {0}")]
    Fork(Errno),
    #[error("waitpid failed: {0}")]
    Wait(Errno),
    #[error("consumer process failed")]
    ConsumerFailed,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Thread,
    Fork,
}

struct Config {
    strategy: Strategy,
    count: u64,
    producer_pacing: Pacing,
    consumer_pacing: Pacing,
    mode: Mode,
}

impl Config {
    fn parse(args: &[String]) -> Result<Self, String> {
        if !(5..=6).contains(&args.len()) {
            return Err("wrong number of arguments".into());
        }
        let strategy: Strategy = args[1].parse().map_err(|err| format!("{err}"))?;
        let count = parse_count(&args[2], "event count")?;
        let producer_pacing = Pacing::every(parse_count(&args[3], "producer interval")?);
        let consumer_pacing = Pacing::every(parse_count(&args[4], "consumer interval")?);
        let mode = match args.get(5).map(String::as_str) {
            None | Some("thread") => Mode::Thread,
            Some("fork") => Mode::Fork,
            Some(other) => return Err(format!("unknown mode `{other}`")),
        };
        Ok(Self {
            strategy,
            count,
            producer_pacing,
            consumer_pacing,
            mode,
        })
    }
}

fn parse_count(text: &str, what: &str) -> Result<u64, String> {
    text.parse()
        .map_err(|_| format!("{what} `{text}` is not a non-negative number"))
}

fn main() {
    baton::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let config = match Config::parse(&args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("baton-pc: {msg}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(&config) {
        eprintln!("baton-pc: {err}");
        std::process::exit(2);
    }
}

fn run(config: &Config) -> Result<(), DemoError> {
    match config.mode {
        Mode::Thread => run_threads(config),
        Mode::Fork => run_forked(config),
    }
}

fn run_threads(config: &Config) -> Result<(), DemoError> {
    let (tx, rx) = channel::<DEFAULT_WIDTH, QUEUE_CAPACITY>(config.strategy)?;
    let count = config.count;
    let pacing = config.producer_pacing;
    let producer = thread::spawn(move || {
        let mut words = WordPicker::from_entropy();
        run_producer(&tx, &mut words, count, pacing)
    });
    let consumed = run_consumer(&rx, print_word, config.count, config.consumer_pacing)?;
    let delivered = producer.join().expect("producer thread panicked")?;
    eprintln!("Producer finished after {delivered} records.");
    eprintln!("Consumer finished after {consumed} records.");
    Ok(())
}

fn run_forked(config: &Config) -> Result<(), DemoError> {
    match config.strategy {
        Strategy::DirectStream => run_forked_stream(config),
        Strategy::PerSlotLock => {
            let path = demo_path("slots")?;
            let sender = SlottedSender::<DEFAULT_WIDTH, QUEUE_CAPACITY, _>::create(path.clone())?;
            run_forked_shared(config, sender, move || {
                SlottedReceiver::<DEFAULT_WIDTH, QUEUE_CAPACITY, _>::open(path)
            })
        }
        Strategy::GlobalBroadcast => {
            let path = demo_path("broadcast")?;
            let sender = BroadcastSender::<DEFAULT_WIDTH, QUEUE_CAPACITY, _>::create(path.clone())?;
            run_forked_shared(config, sender, move || {
                BroadcastReceiver::<DEFAULT_WIDTH, QUEUE_CAPACITY, _>::open(path)
            })
        }
    }
}

fn run_forked_stream(config: &Config) -> Result<(), DemoError> {
    let (tx, rx) = stream::pair::<DEFAULT_WIDTH>()?;
    match spawn_child()? {
        Child::Consumer => {
            // Close the inherited write end so the pipe can report EOF.
            drop(tx);
            let status = consume_to_stdout(&rx, config);
            std::process::exit(status);
        }
        Child::Parent(pid) => {
            drop(rx);
            let mut words = WordPicker::from_entropy();
            let outcome = run_producer(&tx, &mut words, config.count, config.producer_pacing);
            // EOF for the consumer before we wait on it.
            drop(tx);
            let delivered = match outcome {
                Ok(delivered) => delivered,
                Err(err) => return Err(err.into()),
            };
            reap(pid)?;
            eprintln!("Producer finished after {delivered} records.");
            Ok(())
        }
    }
}

/// Parent creates the region before forking; the child only has to open an
/// existing name, so it can never lose the race against creation.
fn run_forked_shared<S, R>(
    config: &Config,
    sender: S,
    open_receiver: impl FnOnce() -> Result<R, TransportError>,
) -> Result<(), DemoError>
where
    S: SendHalf<DEFAULT_WIDTH>,
    R: RecvHalf<DEFAULT_WIDTH>,
{
    match spawn_child()? {
        Child::Consumer => {
            // The child exits below without running destructors, so the
            // inherited creator endpoint never unlinks the region out from
            // under the parent.
            let status = match open_receiver() {
                Ok(receiver) => consume_to_stdout(&receiver, config),
                Err(err) => {
                    eprintln!("baton-pc consumer: {err}");
                    2
                }
            };
            std::process::exit(status);
        }
        Child::Parent(pid) => {
            let mut words = WordPicker::from_entropy();
            let delivered = match run_producer(&sender, &mut words, config.count, config.producer_pacing)
            {
                Ok(delivered) => delivered,
                Err(err) => return Err(err.into()),
            };
            reap(pid)?;
            eprintln!("Producer finished after {delivered} records.");
            Ok(())
        }
    }
}

fn consume_to_stdout<R: RecvHalf<DEFAULT_WIDTH>>(receiver: &R, config: &Config) -> i32 {
    match run_consumer(receiver, print_word, config.count, config.consumer_pacing) {
        Ok(consumed) => {
            eprintln!("Consumer finished after {consumed} records.");
            0
        }
        Err(err) => {
            eprintln!("baton-pc consumer: {err}");
            2
        }
    }
}

fn print_word(tally: u64, record: &Record<DEFAULT_WIDTH>) {
    match record.text() {
        Ok(text) => println!("Word {tally}: {text}"),
        Err(_) => println!("Word {tally}: {:02x?}", record.as_bytes()),
    }
}

fn demo_path(tag: &str) -> Result<ShmPath, TransportError> {
    Ok(ShmPath::new(format!("/baton-pc-{tag}-{}", std::process::id()))?)
}

enum Child {
    Consumer,
    Parent(libc::pid_t),
}

fn spawn_child() -> Result<Child, DemoError> {
    // SAFETY: no other threads exist yet, so the child continues with a
    // consistent process image.
    match unsafe { libc::fork() } {
        -1 => Err(DemoError::Fork(last_errno())),
        0 => Ok(Child::Consumer),
        pid => Ok(Child::Parent(pid)),
    }
}

fn reap(pid: libc::pid_t) -> Result<(), DemoError> {
    let mut status = 0;
    loop {
        // SAFETY: plain blocking wait on our own child.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        let errno = last_errno();
        if errno != Errno::INTR {
            return Err(DemoError::Wait(errno));
        }
    }
    if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
        Ok(())
    } else {
        Err(DemoError::ConsumerFailed)
    }
}

fn last_errno() -> Errno {
    Errno::from_raw_os_error(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
}
