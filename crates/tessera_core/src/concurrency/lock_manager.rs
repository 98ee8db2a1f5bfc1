//! Resource locks for the unisolated lane.
//!
//! Requests wait in one FIFO queue. A request is granted once its resources
//! are disjoint from every held resource and from every resource of an
//! earlier request that is still waiting, so a later request never overtakes
//! an earlier conflicting one. Resource sets are acquired whole, which rules
//! out deadlock.

use crate::error::CoreError;
use crate::stats::EngineStats;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The party waiting on a lock request.
pub(crate) trait LockWaiter: Send {
    /// True if the request no longer needs its locks.
    fn is_cancelled(&self) -> bool;

    /// Hands over the locks. Returns false if the waiter could not use them,
    /// in which case they are released again.
    fn grant(self: Box<Self>) -> bool;

    /// Fails the request.
    fn reject(self: Box<Self>, error: CoreError);
}

struct Request {
    resources: Vec<String>,
    enqueued: Instant,
    waiter: Box<dyn LockWaiter>,
}

#[derive(Default)]
struct LockState {
    held: HashSet<String>,
    queue: VecDeque<Request>,
    stopped: bool,
}

pub(crate) struct LockManager {
    state: Mutex<LockState>,
    cond: Condvar,
    timeout: Duration,
    stats: Arc<EngineStats>,
}

impl LockManager {
    /// Creates a lock manager and starts its timeout watchdog.
    pub(crate) fn start(timeout: Duration, stats: Arc<EngineStats>) -> std::io::Result<Arc<Self>> {
        let manager = Arc::new(Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            timeout,
            stats,
        });
        let watchdog = Arc::clone(&manager);
        thread::Builder::new()
            .name("tessera-lock-watchdog".to_string())
            .spawn(move || watchdog.watch())?;
        Ok(manager)
    }

    /// Queues a request for `resources`, which must be sorted and
    /// deduplicated.
    pub(crate) fn request(&self, resources: Vec<String>, waiter: Box<dyn LockWaiter>) {
        let granted = {
            let mut state = self.state.lock();
            if state.stopped {
                drop(state);
                waiter.reject(CoreError::Shutdown);
                return;
            }
            state.queue.push_back(Request {
                resources,
                enqueued: Instant::now(),
                waiter,
            });
            self.cond.notify_one();
            Self::collect_grants(&mut state)
        };
        self.dispatch(granted);
    }

    /// Releases locks held by a finished task.
    pub(crate) fn release(&self, resources: &[String]) {
        let granted = {
            let mut state = self.state.lock();
            for resource in resources {
                state.held.remove(resource);
            }
            Self::collect_grants(&mut state)
        };
        self.dispatch(granted);
    }

    fn collect_grants(state: &mut LockState) -> Vec<Request> {
        let mut granted = Vec::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut waiting = VecDeque::with_capacity(state.queue.len());

        while let Some(request) = state.queue.pop_front() {
            if request.waiter.is_cancelled() {
                continue;
            }
            let free = request
                .resources
                .iter()
                .all(|r| !state.held.contains(r) && !blocked.contains(r));
            if free {
                state.held.extend(request.resources.iter().cloned());
                granted.push(request);
            } else {
                blocked.extend(request.resources.iter().cloned());
                waiting.push_back(request);
            }
        }
        state.queue = waiting;
        granted
    }

    fn dispatch(&self, granted: Vec<Request>) {
        for request in granted {
            let waited = request.enqueued.elapsed();
            self.stats
                .record_lock_wait(u64::try_from(waited.as_micros()).unwrap_or(u64::MAX));
            debug!(
                resources = ?request.resources,
                waited_ms = waited.as_millis() as u64,
                "locks granted"
            );
            let resources = request.resources;
            if !request.waiter.grant() {
                self.release(&resources);
            }
        }
    }

    fn watch(&self) {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return;
            }

            let now = Instant::now();
            let (expired, waiting): (VecDeque<_>, VecDeque<_>) = state
                .queue
                .drain(..)
                .partition(|r| now.duration_since(r.enqueued) >= self.timeout);
            state.queue = waiting;

            if !expired.is_empty() {
                let granted = Self::collect_grants(&mut state);
                drop(state);
                for request in expired {
                    let waited_ms = request.enqueued.elapsed().as_millis() as u64;
                    warn!(resources = ?request.resources, waited_ms, "lock request timed out");
                    self.stats.record_lock_timeout();
                    request.waiter.reject(CoreError::LockTimeout {
                        resources: request.resources,
                        waited_ms,
                    });
                }
                self.dispatch(granted);
                state = self.state.lock();
                continue;
            }

            match state.queue.iter().map(|r| r.enqueued + self.timeout).min() {
                Some(deadline) => {
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Number of waiting requests that are not cancelled.
    pub(crate) fn pending(&self) -> usize {
        self.sweep_cancelled();
        self.state.lock().queue.len()
    }

    /// True when nothing is held or waiting.
    pub(crate) fn is_idle(&self) -> bool {
        self.sweep_cancelled();
        let state = self.state.lock();
        state.queue.is_empty() && state.held.is_empty()
    }

    /// Drops cancelled requests and grants whatever they were blocking.
    fn sweep_cancelled(&self) {
        let granted = {
            let mut state = self.state.lock();
            if !state.queue.iter().any(|r| r.waiter.is_cancelled()) {
                return;
            }
            Self::collect_grants(&mut state)
        };
        self.dispatch(granted);
    }

    /// Stops the watchdog and cancels every waiting request. Returns how many
    /// were cancelled.
    pub(crate) fn stop(&self) -> usize {
        let waiting: Vec<Request> = {
            let mut state = self.state.lock();
            state.stopped = true;
            self.cond.notify_all();
            state.queue.drain(..).collect()
        };
        let cancelled = waiting.len();
        for request in waiting {
            request.waiter.reject(CoreError::Cancelled);
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{channel, Receiver, Sender};

    struct Probe {
        id: u32,
        granted: Sender<(u32, Result<(), String>)>,
        cancelled: Arc<AtomicBool>,
    }

    impl LockWaiter for Probe {
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        fn grant(self: Box<Self>) -> bool {
            self.granted.send((self.id, Ok(()))).is_ok()
        }

        fn reject(self: Box<Self>, error: CoreError) {
            let _ = self.granted.send((self.id, Err(error.to_string())));
        }
    }

    fn manager(timeout: Duration) -> (Arc<LockManager>, Sender<(u32, Result<(), String>)>, Receiver<(u32, Result<(), String>)>) {
        let (tx, rx) = channel();
        (
            LockManager::start(timeout, Arc::new(EngineStats::new())).unwrap(),
            tx,
            rx,
        )
    }

    fn probe(id: u32, tx: &Sender<(u32, Result<(), String>)>) -> Box<Probe> {
        Box::new(Probe {
            id,
            granted: tx.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn set(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn disjoint_requests_are_granted_together() {
        let (locks, tx, rx) = manager(Duration::from_secs(60));
        locks.request(set(&["a"]), probe(1, &tx));
        locks.request(set(&["b"]), probe(2, &tx));

        assert_eq!(rx.try_recv().unwrap(), (1, Ok(())));
        assert_eq!(rx.try_recv().unwrap(), (2, Ok(())));
        locks.stop();
    }

    #[test]
    fn cancelled_request_is_not_counted_as_pending() {
        let (locks, tx, rx) = manager(Duration::from_secs(60));
        locks.request(set(&["a"]), probe(1, &tx));
        let cancelled = Arc::new(AtomicBool::new(false));
        locks.request(
            set(&["a"]),
            Box::new(Probe {
                id: 2,
                granted: tx.clone(),
                cancelled: Arc::clone(&cancelled),
            }),
        );
        locks.request(set(&["a", "b"]), probe(3, &tx));
        assert_eq!(rx.try_recv().unwrap(), (1, Ok(())));
        assert_eq!(locks.pending(), 2);

        cancelled.store(true, Ordering::SeqCst);
        assert_eq!(locks.pending(), 1);
        assert!(!locks.is_idle());

        locks.release(&set(&["a"]));
        assert_eq!(rx.try_recv().unwrap(), (3, Ok(())));
        locks.release(&set(&["a", "b"]));
        assert!(locks.is_idle());
        assert!(rx.try_recv().is_err());
        locks.stop();
    }

    #[test]
    fn conflicting_request_waits_for_release() {
        let (locks, tx, rx) = manager(Duration::from_secs(60));
        locks.request(set(&["a", "b"]), probe(1, &tx));
        locks.request(set(&["b"]), probe(2, &tx));

        assert_eq!(rx.try_recv().unwrap().0, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(locks.pending(), 1);

        locks.release(&set(&["a", "b"]));
        assert_eq!(rx.try_recv().unwrap(), (2, Ok(())));
        locks.release(&set(&["b"]));
        assert!(locks.is_idle());
        locks.stop();
    }

    #[test]
    fn later_request_does_not_overtake_earlier_conflict() {
        let (locks, tx, rx) = manager(Duration::from_secs(60));
        locks.request(set(&["a"]), probe(1, &tx));
        locks.request(set(&["a", "b"]), probe(2, &tx));
        locks.request(set(&["b"]), probe(3, &tx));
        locks.request(set(&["c"]), probe(4, &tx));

        let first: Vec<u32> = rx.try_iter().map(|(id, _)| id).collect();
        assert_eq!(first, vec![1, 4]);

        locks.release(&set(&["a"]));
        assert_eq!(rx.try_recv().unwrap().0, 2);
        assert!(rx.try_recv().is_err());

        locks.release(&set(&["a", "b"]));
        assert_eq!(rx.try_recv().unwrap().0, 3);
        locks.stop();
    }

    #[test]
    fn cancelled_request_is_skipped() {
        let (locks, tx, rx) = manager(Duration::from_secs(60));
        locks.request(set(&["a"]), probe(1, &tx));
        let cancelled = probe(2, &tx);
        let flag = Arc::clone(&cancelled.cancelled);
        locks.request(set(&["a"]), cancelled);
        locks.request(set(&["a"]), probe(3, &tx));
        assert_eq!(rx.try_recv().unwrap().0, 1);

        flag.store(true, Ordering::SeqCst);
        locks.release(&set(&["a"]));

        assert_eq!(rx.try_recv().unwrap().0, 3);
        locks.stop();
    }

    #[test]
    fn waiting_request_times_out() {
        let (locks, tx, rx) = manager(Duration::from_millis(50));
        locks.request(set(&["a"]), probe(1, &tx));
        locks.request(set(&["a"]), probe(2, &tx));
        assert_eq!(rx.recv().unwrap().0, 1);

        let (id, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, 2);
        assert!(outcome.unwrap_err().contains("timed out"));
        assert_eq!(locks.pending(), 0);
        locks.stop();
    }

    #[test]
    fn stop_cancels_waiters() {
        let (locks, tx, rx) = manager(Duration::from_secs(60));
        locks.request(set(&["a"]), probe(1, &tx));
        locks.request(set(&["a"]), probe(2, &tx));
        rx.recv().unwrap();

        assert_eq!(locks.stop(), 1);
        let (id, outcome) = rx.recv().unwrap();
        assert_eq!(id, 2);
        assert!(outcome.is_err());

        locks.request(set(&["z"]), probe(3, &tx));
        assert!(rx.recv().unwrap().1.is_err());
    }
}
