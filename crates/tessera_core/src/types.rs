//! Core type definitions for Tessera.

use std::fmt;

/// A point in the journal's logical time.
///
/// Timestamps are issued by a monotonic source and serve as commit times,
/// transaction start times and revision times. The value 0 is reserved for
/// [`Timestamp::UNISOLATED`], which names the live indices rather than a
/// point in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The live, unisolated view.
    pub const UNISOLATED: Self = Self(0);

    /// Creates a timestamp.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// True for [`Timestamp::UNISOLATED`].
    #[must_use]
    pub const fn is_unisolated(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unisolated() {
            f.write_str("ts:unisolated")
        } else {
            write!(f, "ts:{}", self.0)
        }
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
