//! Transaction run states.

use std::fmt;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Accepting reads and writes.
    Active,
    /// Validated and merged, awaiting the durable commit.
    Prepared,
    /// Committed.
    Committed,
    /// Aborted.
    Aborted,
}

impl RunState {
    /// Whether moving from `self` to `to` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Prepared | Self::Committed | Self::Aborted)
                | (Self::Prepared, Self::Committed | Self::Aborted)
        )
    }

    /// True for Committed and Aborted.
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "Active",
            Self::Prepared => "Prepared",
            Self::Committed => "Committed",
            Self::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}
