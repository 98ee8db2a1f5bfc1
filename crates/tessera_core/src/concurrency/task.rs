//! Units of work submitted to the concurrency manager.

use super::TaskContext;
use crate::error::CoreResult;
use crate::types::Timestamp;
use std::fmt;

/// The lane a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Read-only work against a committed snapshot.
    Historical,
    /// Work inside an active transaction.
    Transaction,
    /// Work on the live indices.
    Unisolated,
}

impl Lane {
    /// Lane name used in logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Historical => "read",
            Self::Transaction => "tx",
            Self::Unisolated => "write",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) type Work<T> = Box<dyn FnOnce(&mut TaskContext) -> CoreResult<T> + Send>;

/// A unit of work with its timestamp and declared resources.
///
/// The resource set names every index the work touches. It is sorted and
/// deduplicated on construction.
pub struct Task<T> {
    pub(crate) lane: Lane,
    pub(crate) timestamp: Timestamp,
    pub(crate) resources: Vec<String>,
    pub(crate) work: Work<T>,
}

impl<T> Task<T> {
    fn new<I, S, F>(lane: Lane, timestamp: Timestamp, resources: I, work: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(&mut TaskContext) -> CoreResult<T> + Send + 'static,
    {
        let mut resources: Vec<String> = resources.into_iter().map(Into::into).collect();
        resources.sort();
        resources.dedup();
        Self {
            lane,
            timestamp,
            resources,
            work: Box::new(work),
        }
    }

    /// A task on the live indices. Runs once locks on `resources` are granted
    /// and completes when its group commit does.
    pub fn unisolated<I, S, F>(resources: I, work: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(&mut TaskContext) -> CoreResult<T> + Send + 'static,
    {
        Self::new(Lane::Unisolated, Timestamp::UNISOLATED, resources, work)
    }

    /// A read-only task against the state committed at `commit_time`.
    pub fn historical<I, S, F>(commit_time: Timestamp, resources: I, work: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(&mut TaskContext) -> CoreResult<T> + Send + 'static,
    {
        Self::new(Lane::Historical, commit_time, resources, work)
    }

    /// A task inside the active transaction that started at `start_time`.
    pub fn read_write_tx<I, S, F>(start_time: Timestamp, resources: I, work: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(&mut TaskContext) -> CoreResult<T> + Send + 'static,
    {
        Self::new(Lane::Transaction, start_time, resources, work)
    }

    /// The lane this task is classified into.
    #[must_use]
    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// The task timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Declared resources, sorted.
    #[must_use]
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// True for historical reads.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.lane == Lane::Historical
    }

    /// True for transaction tasks.
    #[must_use]
    pub fn is_read_write_tx(&self) -> bool {
        self.lane == Lane::Transaction
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("lane", &self.lane)
            .field("timestamp", &self.timestamp)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_are_sorted_and_deduplicated() {
        let task = Task::unisolated(["b", "a", "b"], |_| Ok(()));
        assert_eq!(task.resources(), ["a", "b"]);
        assert_eq!(task.lane(), Lane::Unisolated);
        assert!(task.timestamp().is_unisolated());
    }

    #[test]
    fn classification() {
        let read = Task::historical(Timestamp::new(5), ["x"], |_| Ok(()));
        let tx = Task::read_write_tx(Timestamp::new(6), ["x"], |_| Ok(()));
        assert!(read.is_read_only());
        assert!(!read.is_read_write_tx());
        assert!(tx.is_read_write_tx());
        assert_eq!(tx.lane().name(), "tx");
    }
}
