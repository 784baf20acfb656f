//! Fixed-width message records.
//!
//! A [`Record`] is the unit every channel strategy moves: exactly `W` bytes,
//! no length prefix, no framing. Contents are opaque to the transport; any
//! byte pattern is legal, including a leading zero. Text payloads are padded
//! on the right with NUL bytes and read back with [`Record::text`].

use std::fmt;
use std::str::Utf8Error;

use thiserror::Error;

use crate::SharedMemorySafe;

/// Default record width in bytes.
pub const DEFAULT_WIDTH: usize = 16;

/// Errors from building or reading a [`Record`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// The text (plus its implicit terminator when shorter than the width)
    /// does not fit the record.
    #[error("text of {len} bytes does not fit a {width}-byte record")]
    TooLong { len: usize, width: usize },
    /// The stored bytes are not valid UTF-8 up to the first NUL.
    #[error("record does not hold UTF-8 text: {0}")]
    NotText(#[from] Utf8Error),
}

/// A fixed-width byte record.
#[derive(SharedMemorySafe, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Record<const W: usize = DEFAULT_WIDTH> {
    bytes: [u8; W],
}

impl<const W: usize> Record<W> {
    /// A record of all zero bytes.
    pub const fn zeroed() -> Self {
        Self { bytes: [0; W] }
    }

    /// Wraps raw bytes without interpretation.
    pub const fn from_bytes(bytes: [u8; W]) -> Self {
        Self { bytes }
    }

    /// Builds a NUL-padded record from text.
    ///
    /// Text of exactly `W` bytes is accepted and stored without a
    /// terminator; anything longer is rejected rather than truncated.
    pub fn from_str(text: &str) -> Result<Self, RecordError> {
        let len = text.len();
        if len > W {
            return Err(RecordError::TooLong { len, width: W });
        }
        let mut bytes = [0u8; W];
        bytes[..len].copy_from_slice(text.as_bytes());
        Ok(Self { bytes })
    }

    /// The full fixed-width contents.
    pub const fn as_bytes(&self) -> &[u8; W] {
        &self.bytes
    }

    /// The stored text: everything before the first NUL (or the whole
    /// record when no NUL is present), UTF-8 checked.
    pub fn text(&self) -> Result<&str, RecordError> {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(W);
        Ok(std::str::from_utf8(&self.bytes[..end])?)
    }

    /// Record width in bytes.
    pub const fn width() -> usize {
        W
    }
}

impl<const W: usize> Default for Record<W> {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl<const W: usize> fmt::Debug for Record<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text() {
            Ok(text) => write!(f, "Record({text:?})"),
            Err(_) => write!(f, "Record({:02x?})", &self.bytes[..]),
        }
    }
}
