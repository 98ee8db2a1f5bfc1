//! Fixed-size worker pools and queue admission.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of named worker threads fed by one channel.
///
/// Jobs that are dropped without running resolve their futures as
/// cancelled, so discarding the queue is enough to cancel queued work.
pub(crate) struct WorkerPool {
    lane: &'static str,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    live: Arc<(Mutex<usize>, Condvar)>,
    discard: Arc<AtomicBool>,
}

impl WorkerPool {
    pub(crate) fn new(lane: &'static str, threads: usize) -> CoreResult<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let live = Arc::new((Mutex::new(threads), Condvar::new()));
        let discard = Arc::new(AtomicBool::new(false));

        for i in 0..threads {
            let receiver = Arc::clone(&receiver);
            let live = Arc::clone(&live);
            let discard = Arc::clone(&discard);
            thread::Builder::new()
                .name(format!("tessera-{lane}-{i}"))
                .spawn(move || worker_loop(lane, &receiver, &discard, &live))?;
        }

        Ok(Self {
            lane,
            sender: Mutex::new(Some(sender)),
            live,
            discard,
        })
    }

    pub(crate) fn submit(&self, job: Job) -> CoreResult<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(CoreError::Shutdown);
        };
        sender.send(job).map_err(|_| CoreError::Shutdown)
    }

    /// Stops accepting jobs. Queued jobs still run.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Stops accepting jobs and drops the queued ones.
    pub(crate) fn shutdown_now(&self) {
        self.discard.store(true, Ordering::Release);
        self.shutdown();
    }

    /// Waits for every worker to exit. Returns whether they did in time.
    pub(crate) fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, cond) = &*self.live;
        let mut live = count.lock();
        while *live > 0 {
            if cond.wait_until(&mut live, deadline).timed_out() {
                return *live == 0;
            }
        }
        true
    }

    pub(crate) fn lane(&self) -> &'static str {
        self.lane
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    lane: &'static str,
    receiver: &Mutex<mpsc::Receiver<Job>>,
    discard: &AtomicBool,
    live: &(Mutex<usize>, Condvar),
) {
    loop {
        let job = receiver.lock().recv();
        let Ok(job) = job else {
            break;
        };
        if discard.load(Ordering::Acquire) {
            drop(job);
            continue;
        }
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(lane, "task panicked");
        }
    }
    let (count, cond) = live;
    *count.lock() -= 1;
    cond.notify_all();
}

/// Bounds the number of tasks queued on a lane.
pub(crate) struct Admission {
    lane: &'static str,
    capacity: usize,
    backoff: Duration,
    queued: AtomicUsize,
}

/// One admitted task. Dropping it frees its queue slot.
pub(crate) struct AdmissionTicket {
    admission: Arc<Admission>,
}

impl Admission {
    pub(crate) fn new(lane: &'static str, capacity: usize, backoff: Duration) -> Self {
        Self {
            lane,
            capacity,
            backoff,
            queued: AtomicUsize::new(0),
        }
    }

    /// Reserves a queue slot. A nearly full queue makes the caller sleep for
    /// the backoff first; a full queue rejects.
    pub(crate) fn admit(self: &Arc<Self>) -> CoreResult<AdmissionTicket> {
        if self.capacity > 0 {
            let queued = self.queued.load(Ordering::Acquire);
            let remaining = self.capacity.saturating_sub(queued);
            if remaining == 0 {
                return Err(self.rejected());
            }
            if queued as f64 * 1.10 >= remaining as f64 {
                debug!(lane = self.lane, queued, remaining, "queue nearly full, backing off");
                thread::sleep(self.backoff);
            }
            self.queued
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
                    (q < self.capacity).then_some(q + 1)
                })
                .map_err(|_| self.rejected())?;
        } else {
            self.queued.fetch_add(1, Ordering::AcqRel);
        }
        Ok(AdmissionTicket {
            admission: Arc::clone(self),
        })
    }

    fn rejected(&self) -> CoreError {
        CoreError::Rejected {
            lane: self.lane.to_string(),
        }
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.admission.queued.fetch_sub(1, Ordering::AcqRel);
    }
}
