//! Driver loops that move a fixed number of records across a channel.
//!
//! The loops are strategy-agnostic: they run against the [`SendHalf`] and
//! [`RecvHalf`] traits, so the same pump serves a pipe, a slotted ring or a
//! broadcast ring, on the heap or in shared memory. Formatting of consumed
//! records stays out of the library; the consumer hands each record to a
//! caller-supplied sink.
//!
//! Both sides count on their own. A producer and a consumer configured with
//! different counts will leave one side waiting for records that never
//! come, unless the channel closes underneath it or the caller uses the
//! deadline variants directly.

use std::thread;
use std::time::Duration;

use crate::channel::{RecvHalf, SendHalf, TransportError};
use crate::record::Record;
use crate::trace::{debug, info};

/// Pause between bursts when pacing is enabled.
pub const DEFAULT_PAUSE: Duration = Duration::from_secs(1);

/// Burst pacing for a pump loop: sleep `pause` before every `every`-th
/// record. `every == 0` disables pacing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pacing {
    pub every: u64,
    pub pause: Duration,
}

impl Pacing {
    /// No pauses at all.
    pub const fn none() -> Self {
        Self {
            every: 0,
            pause: DEFAULT_PAUSE,
        }
    }

    /// Pause for [`DEFAULT_PAUSE`] before every `every`-th record.
    pub const fn every(every: u64) -> Self {
        Self {
            every,
            pause: DEFAULT_PAUSE,
        }
    }

    fn is_due(&self, i: u64) -> bool {
        self.every > 0 && i > 0 && i % self.every == 0
    }

    fn maybe_pause(&self, i: u64) {
        if self.is_due(i) {
            debug!(record = i, pause_ms = self.pause.as_millis() as u64, "pacing pause");
            thread::sleep(self.pause);
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::none()
    }
}

/// Supplies the payload for each produced record.
pub trait PayloadSource<const W: usize> {
    fn next_record(&mut self) -> Record<W>;
}

impl<const W: usize, F: FnMut() -> Record<W>> PayloadSource<W> for F {
    fn next_record(&mut self) -> Record<W> {
        self()
    }
}

/// Sends `count` records drawn from `source`, pacing between bursts.
///
/// Returns the number delivered, which equals `count` unless a transport
/// error aborts the loop.
pub fn run_producer<const W: usize, S, P>(
    sender: &S,
    source: &mut P,
    count: u64,
    pacing: Pacing,
) -> Result<u64, TransportError>
where
    S: SendHalf<W>,
    P: PayloadSource<W>,
{
    for i in 0..count {
        pacing.maybe_pause(i);
        sender.send(source.next_record())?;
    }
    info!(delivered = count, "producer finished");
    Ok(count)
}

/// Receives up to `count` records, handing `(tally, record)` to `sink`
/// after each one. The tally starts at one.
///
/// A closed channel is a clean early stop and returns the records consumed
/// so far; any other transport error propagates.
pub fn run_consumer<const W: usize, R, F>(
    receiver: &R,
    mut sink: F,
    count: u64,
    pacing: Pacing,
) -> Result<u64, TransportError>
where
    R: RecvHalf<W>,
    F: FnMut(u64, &Record<W>),
{
    for i in 0..count {
        pacing.maybe_pause(i);
        let record = match receiver.receive() {
            Ok(record) => record,
            Err(TransportError::ChannelClosed) => {
                info!(consumed = i, expected = count, "channel closed early");
                return Ok(i);
            }
            Err(err) => return Err(err),
        };
        sink(i + 1, &record);
    }
    info!(consumed = count, "consumer finished");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::stream;

    #[test]
    fn test_pacing_due_schedule() {
        let pacing = Pacing::every(3);
        let due: Vec<u64> = (0..10).filter(|&i| pacing.is_due(i)).collect();
        assert_eq!(due, vec![3, 6, 9]);
        assert!((0..10).all(|i| !Pacing::none().is_due(i)));
    }

    #[test]
    fn test_pump_moves_every_record_in_order() {
        let (tx, rx) = stream::pair::<16>().unwrap();
        let producer = thread::spawn(move || {
            let mut next = 0u8;
            let mut source = || {
                let record = Record::from_bytes([next; 16]);
                next += 1;
                record
            };
            run_producer(&tx, &mut source, 20, Pacing::none())
        });
        let mut seen = Vec::new();
        let consumed = run_consumer(
            &rx,
            |tally, record: &Record<16>| seen.push((tally, record.as_bytes()[0])),
            20,
            Pacing::none(),
        )
        .unwrap();
        assert_eq!(producer.join().unwrap().unwrap(), 20);
        assert_eq!(consumed, 20);
        let expected: Vec<(u64, u8)> = (0..20).map(|i| (i as u64 + 1, i as u8)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_consumer_stops_cleanly_when_channel_closes() {
        let (tx, rx) = stream::pair::<16>().unwrap();
        for _ in 0..5 {
            tx.send(Record::zeroed()).unwrap();
        }
        drop(tx);
        let mut handed = 0u64;
        let consumed = run_consumer(&rx, |tally, _| handed = tally, 10, Pacing::none()).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(handed, 5);
    }

    #[test]
    fn test_producer_error_propagates() {
        let (tx, rx) = stream::pair::<16>().unwrap();
        drop(rx);
        let mut source = || Record::<16>::zeroed();
        assert!(matches!(
            run_producer(&tx, &mut source, 3, Pacing::none()),
            Err(TransportError::ChannelClosed)
        ));
    }
}
