//! Task results.

use crate::error::{CoreError, CoreResult};
use crate::types::Timestamp;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct FutureState<T> {
    result: Option<CoreResult<T>>,
    done: bool,
    started: bool,
    cancelled: bool,
    commit_time: Option<Timestamp>,
}

struct Shared<T> {
    state: Mutex<FutureState<T>>,
    cond: Condvar,
}

/// The pending result of a submitted task.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

/// The executing side of a [`TaskFuture`]. Dropping it unresolved resolves
/// the future as cancelled.
pub(crate) struct Promise<T> {
    shared: Arc<Shared<T>>,
}

pub(crate) fn pair<T>() -> (TaskFuture<T>, Promise<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(FutureState {
            result: None,
            done: false,
            started: false,
            cancelled: false,
            commit_time: None,
        }),
        cond: Condvar::new(),
    });
    (
        TaskFuture {
            shared: Arc::clone(&shared),
        },
        Promise { shared },
    )
}

impl<T> TaskFuture<T> {
    /// Blocks until the task completes.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while !state.done {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Blocks until the task completes or `deadline` passes. Returns whether
    /// the task is done.
    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        let mut state = self.shared.state.lock();
        while !state.done {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return state.done;
            }
        }
        true
    }

    /// Blocks for at most `timeout`. Returns whether the task is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_deadline(Instant::now() + timeout)
    }

    /// Blocks until the task completes and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the task's error, [`CoreError::Cancelled`] if it was cancelled,
    /// or [`CoreError::CommitFailed`] if its group commit failed.
    pub fn get(self) -> CoreResult<T> {
        self.wait();
        self.take()
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::Timeout`] if the task is not done in time.
    pub fn get_timeout(self, timeout: Duration) -> CoreResult<T> {
        if !self.wait_timeout(timeout) {
            return Err(CoreError::Timeout);
        }
        self.take()
    }

    fn take(self) -> CoreResult<T> {
        self.shared
            .state
            .lock()
            .result
            .take()
            .unwrap_or(Err(CoreError::Cancelled))
    }

    /// Cancels the task if it has not started. Returns whether it was
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.started || state.done {
            return false;
        }
        state.cancelled = true;
        state.done = true;
        state.result = Some(Err(CoreError::Cancelled));
        self.shared.cond.notify_all();
        true
    }

    /// True once the task has a result.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    /// True if the task was cancelled before running.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    /// Commit time of the group commit an unisolated task joined, once it has
    /// completed.
    #[must_use]
    pub fn commit_time(&self) -> Option<Timestamp> {
        self.shared.state.lock().commit_time
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TaskFuture")
            .field("done", &state.done)
            .field("started", &state.started)
            .field("cancelled", &state.cancelled)
            .field("commit_time", &state.commit_time)
            .finish()
    }
}

impl<T> Promise<T> {
    /// Marks the task started. Returns false if it was cancelled first.
    pub(crate) fn start(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.done {
            return false;
        }
        state.started = true;
        true
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    pub(crate) fn complete(self, result: CoreResult<T>, commit_time: Option<Timestamp>) {
        self.resolve(result, commit_time);
    }

    fn resolve(&self, result: CoreResult<T>, commit_time: Option<Timestamp>) {
        let mut state = self.shared.state.lock();
        if state.done {
            return;
        }
        state.result = Some(result);
        state.commit_time = commit_time;
        state.done = true;
        self.shared.cond.notify_all();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.resolve(Err(CoreError::Cancelled), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_returns_completed_value() {
        let (future, promise) = pair();
        assert!(promise.start());
        promise.complete(Ok(7), Some(Timestamp::new(3)));

        assert!(future.is_done());
        assert_eq!(future.commit_time(), Some(Timestamp::new(3)));
        assert_eq!(future.get().unwrap(), 7);
    }

    #[test]
    fn cancel_before_start_wins() {
        let (future, promise) = pair::<()>();
        assert!(future.cancel());
        assert!(!promise.start());
        assert!(future.is_cancelled());
        assert!(matches!(future.get(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn cancel_after_start_is_ignored() {
        let (future, promise) = pair();
        assert!(promise.start());
        assert!(!future.cancel());
        promise.complete(Ok("done"), None);
        assert_eq!(future.get().unwrap(), "done");
    }

    #[test]
    fn dropped_promise_resolves_cancelled() {
        let (future, promise) = pair::<u8>();
        drop(promise);
        assert!(matches!(future.get(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn get_timeout_expires() {
        let (future, _promise) = pair::<u8>();
        assert!(matches!(
            future.get_timeout(Duration::from_millis(20)),
            Err(CoreError::Timeout)
        ));
    }

    #[test]
    fn wait_wakes_on_completion() {
        let (future, promise) = pair();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.start();
            promise.complete(Ok(1u32), None);
        });
        assert_eq!(future.get().unwrap(), 1);
        handle.join().unwrap();
    }
}
