//! Direct-stream strategy: an OS pipe carries whole records.
//!
//! No rendezvous state is shared between the endpoints. The kernel blocks a
//! full writer and an empty reader, bounds the records in flight by the
//! pipe's own buffering, and preserves order. The record width is kept at or
//! below the POSIX atomic-write guarantee, so one `write` moves one whole
//! record; a short transfer in either direction therefore means the stream
//! is out of frame and is surfaced as an error rather than resynchronized.
//!
//! Closing the write end (dropping the sender) is the end-of-stream signal:
//! the reader's next receive reports [`TransportError::ChannelClosed`].

use std::cell::Cell;
use std::os::fd::{AsFd, OwnedFd};

use minstant::Instant;
use rustix::event::{PollFd, PollFlags, poll};
use rustix::io::{self, Errno};
use rustix::pipe;
use rustix::time::Timespec;

use super::{RecvHalf, SendHalf, Timeout, TransportError, deadline_from};
use crate::record::Record;
use crate::trace::debug;

struct WidthCheck<const W: usize>;

impl<const W: usize> WidthCheck<W> {
    /// Records must be nonempty and no wider than the smallest PIPE_BUF
    /// POSIX permits, so a single write is guaranteed atomic.
    const OK: () = assert!(W > 0 && W <= 512, "record width must be 1..=512 bytes");
}

/// Creates the pipe and splits it into the two endpoints.
///
/// The descriptors are close-on-exec; plain `fork` still inherits them, so
/// the pair spans a parent and child process as readily as two threads.
pub fn pair<const W: usize>() -> Result<(StreamSender<W>, StreamReceiver<W>), TransportError> {
    let () = WidthCheck::<W>::OK;
    let (rx, tx) = pipe::pipe_with(pipe::PipeFlags::CLOEXEC)?;
    debug!(width = W, "created stream channel");
    Ok((
        StreamSender {
            fd: tx,
            tally: Cell::new(0),
        },
        StreamReceiver {
            fd: rx,
            tally: Cell::new(0),
        },
    ))
}

/// Write end of the stream. Dropping it closes the stream.
pub struct StreamSender<const W: usize> {
    fd: OwnedFd,
    tally: Cell<u64>,
}

impl<const W: usize> StreamSender<W> {
    /// Delivers one record, blocking while the pipe is full.
    pub fn send(&self, record: Record<W>) -> Result<(), TransportError> {
        self.send_deadline(record, Timeout::Infinite)
    }

    /// Delivers one record within the deadline.
    ///
    /// # Errors
    ///
    /// [`TransportError::TimedOut`] when the pipe stayed full past the
    /// deadline, [`TransportError::ChannelClosed`] when the read end is
    /// gone, [`TransportError::PartialTransfer`] when the kernel moved
    /// fewer than `W` bytes.
    pub fn send_deadline(&self, record: Record<W>, timeout: Timeout) -> Result<(), TransportError> {
        let deadline = deadline_from(timeout);
        wait_ready(&self.fd, PollFlags::OUT, deadline)?;
        let moved = loop {
            match io::write(&self.fd, record.as_bytes()) {
                Ok(n) => break n,
                // Interrupted before any byte moved; the record is intact.
                Err(Errno::INTR) => continue,
                Err(Errno::PIPE) => return Err(TransportError::ChannelClosed),
                Err(err) => return Err(err.into()),
            }
        };
        if moved != W {
            return Err(TransportError::PartialTransfer {
                expected: W,
                moved,
            });
        }
        self.tally.set(self.tally.get() + 1);
        Ok(())
    }

    /// Records delivered through this sender.
    pub fn produced(&self) -> u64 {
        self.tally.get()
    }
}

impl<const W: usize> SendHalf<W> for StreamSender<W> {
    fn send_deadline(&self, record: Record<W>, timeout: Timeout) -> Result<(), TransportError> {
        StreamSender::send_deadline(self, record, timeout)
    }

    fn produced(&self) -> u64 {
        StreamSender::produced(self)
    }
}

/// Read end of the stream.
pub struct StreamReceiver<const W: usize> {
    fd: OwnedFd,
    tally: Cell<u64>,
}

impl<const W: usize> StreamReceiver<W> {
    /// Takes the next record, blocking while the pipe is empty.
    pub fn receive(&self) -> Result<Record<W>, TransportError> {
        self.receive_deadline(Timeout::Infinite)
    }

    /// Takes the next record within the deadline.
    ///
    /// # Errors
    ///
    /// [`TransportError::TimedOut`] when nothing arrived in time,
    /// [`TransportError::ChannelClosed`] once the write end is closed and
    /// the pipe is drained, [`TransportError::PartialTransfer`] when fewer
    /// than `W` bytes were pending.
    pub fn receive_deadline(&self, timeout: Timeout) -> Result<Record<W>, TransportError> {
        let deadline = deadline_from(timeout);
        wait_ready(&self.fd, PollFlags::IN, deadline)?;
        let mut bytes = [0u8; W];
        let moved = loop {
            match io::read(&self.fd, &mut bytes[..]) {
                Ok(n) => break n,
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        };
        match moved {
            0 => Err(TransportError::ChannelClosed),
            n if n == W => {
                self.tally.set(self.tally.get() + 1);
                Ok(Record::from_bytes(bytes))
            }
            n => Err(TransportError::PartialTransfer {
                expected: W,
                moved: n,
            }),
        }
    }

    /// Records taken from this receiver.
    pub fn consumed(&self) -> u64 {
        self.tally.get()
    }
}

impl<const W: usize> RecvHalf<W> for StreamReceiver<W> {
    fn receive_deadline(&self, timeout: Timeout) -> Result<Record<W>, TransportError> {
        StreamReceiver::receive_deadline(self, timeout)
    }

    fn consumed(&self) -> u64 {
        StreamReceiver::consumed(self)
    }
}

/// Blocks until the descriptor is ready for `events` or the deadline
/// passes. Interrupted polls are retried with the remaining time.
fn wait_ready<Fd: AsFd>(
    fd: &Fd,
    events: PollFlags,
    deadline: Option<Instant>,
) -> Result<(), TransportError> {
    loop {
        let remaining = match deadline {
            None => None,
            Some(dl) => {
                let now = Instant::now();
                if now >= dl {
                    return Err(TransportError::TimedOut);
                }
                let left = dl - now;
                Some(Timespec {
                    tv_sec: left.as_secs() as i64,
                    tv_nsec: i64::from(left.subsec_nanos()),
                })
            }
        };
        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, remaining.as_ref()) {
            Ok(0) => return Err(TransportError::TimedOut),
            // Ready, or in an error state the transfer itself will report.
            Ok(_) => return Ok(()),
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_round_trip_preserves_bytes() {
        let (tx, rx) = pair::<16>().unwrap();
        let record = Record::from_str("Alpha").unwrap();
        tx.send(record).unwrap();
        assert_eq!(rx.receive().unwrap(), record);
        assert_eq!(tx.produced(), 1);
        assert_eq!(rx.consumed(), 1);
    }

    #[test]
    fn test_leading_zero_byte_is_legal_payload() {
        let (tx, rx) = pair::<16>().unwrap();
        let mut bytes = [0xAAu8; 16];
        bytes[0] = 0x00;
        tx.send(Record::from_bytes(bytes)).unwrap();
        assert_eq!(rx.receive().unwrap().as_bytes(), &bytes);
    }

    #[test]
    fn test_fifo_order_across_many_records() {
        let (tx, rx) = pair::<16>().unwrap();
        for i in 0..100u8 {
            tx.send(Record::from_bytes([i; 16])).unwrap();
        }
        for i in 0..100u8 {
            assert_eq!(rx.receive().unwrap().as_bytes()[0], i);
        }
    }

    #[test]
    fn test_closed_sender_reports_channel_closed() {
        let (tx, rx) = pair::<16>().unwrap();
        tx.send(Record::from_str("last").unwrap()).unwrap();
        drop(tx);
        // The buffered record still arrives, then end-of-stream.
        assert_eq!(rx.receive().unwrap().text().unwrap(), "last");
        assert!(matches!(
            rx.receive(),
            Err(TransportError::ChannelClosed)
        ));
    }

    #[test]
    fn test_closed_receiver_reports_channel_closed() {
        let (tx, rx) = pair::<16>().unwrap();
        drop(rx);
        assert!(matches!(
            tx.send(Record::zeroed()),
            Err(TransportError::ChannelClosed)
        ));
    }

    #[test]
    fn test_empty_pipe_times_out() {
        let (_tx, rx) = pair::<16>().unwrap();
        let err = rx
            .receive_deadline(Timeout::Duration(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, TransportError::TimedOut));
    }

    #[test]
    fn test_full_pipe_times_out_then_drains() {
        let (tx, rx) = pair::<16>().unwrap();
        let record = Record::zeroed();
        // Fill the pipe until the kernel pushes back.
        let mut queued = 0u64;
        loop {
            match tx.send_deadline(record, Timeout::Duration(Duration::from_millis(20))) {
                Ok(()) => queued += 1,
                Err(TransportError::TimedOut) => break,
                Err(err) => panic!("unexpected error while filling: {err}"),
            }
            assert!(queued < 1_000_000, "pipe never filled");
        }
        // Draining frees the pipe for the next send. The kernel tracks
        // pipe fullness in page-sized chunks, so drain everything rather
        // than assuming one read is enough.
        for _ in 0..queued {
            rx.receive().unwrap();
        }
        tx.send_deadline(record, Timeout::Duration(Duration::from_millis(200)))
            .unwrap();
        assert_eq!(tx.produced(), queued + 1);
    }
}
