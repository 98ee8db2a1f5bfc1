//! Group commit for the unisolated lane.
//!
//! Tasks `enter` once their locks are granted and `leave` when their work is
//! done. The first task to find the batch idle becomes its leader: it waits
//! until the join window measured from the batch's first entry has elapsed
//! (or the batch is full), then commits every successful task with one
//! root-block advance. Tasks may join until the window closes; after that
//! they wait for the next batch.

use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::stats::EngineStats;
use crate::timestamp::TimestampSource;
use crate::types::Timestamp;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// A task waiting for its batch to become durable.
pub(crate) trait BatchMember: Send {
    fn succeed(self: Box<Self>, commit_time: Timestamp);
    fn fail(self: Box<Self>, error: CoreError);
}

#[derive(Default)]
struct BatchState {
    running: usize,
    members: Vec<Box<dyn BatchMember>>,
    window_start: Option<Instant>,
    /// A task is holding the batch open until its window closes.
    leader: bool,
    /// A commit or journal abort is in progress.
    busy: bool,
}

pub(crate) struct GroupCommit {
    journal: Arc<Journal>,
    timestamps: Arc<dyn TimestampSource>,
    window: Duration,
    max_batch: usize,
    state: Mutex<BatchState>,
    cond: Condvar,
    stats: Arc<EngineStats>,
}

impl GroupCommit {
    pub(crate) fn new(
        journal: Arc<Journal>,
        timestamps: Arc<dyn TimestampSource>,
        window: Duration,
        max_batch: usize,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            journal,
            timestamps,
            window,
            max_batch,
            state: Mutex::new(BatchState::default()),
            cond: Condvar::new(),
            stats,
        }
    }

    /// Joins the open batch, waiting while a commit or abort is in progress
    /// or while a batch whose window has closed is still running.
    pub(crate) fn enter(&self) {
        let mut state = self.state.lock();
        loop {
            if state.busy {
                self.cond.wait(&mut state);
                continue;
            }
            if state.running > 0 || state.leader {
                if self.is_closed(&state) || self.journal.is_abort_required() {
                    self.cond.wait(&mut state);
                    continue;
                }
            } else if self.journal.is_abort_required() {
                state.busy = true;
                MutexGuard::unlocked(&mut state, || self.journal.abort());
                state.busy = false;
                self.cond.notify_all();
                continue;
            }
            break;
        }
        state.running += 1;
        if state.window_start.is_none() {
            state.window_start = Some(Instant::now());
        }
    }

    /// Leaves the batch. `member` is `None` for a task that failed and was
    /// rolled back. The last task out leads the commit unless another task
    /// already does.
    pub(crate) fn leave(&self, member: Option<Box<dyn BatchMember>>) {
        let mut state = self.state.lock();
        if let Some(member) = member {
            state.members.push(member);
        }
        state.running -= 1;
        if state.running > 0 {
            return;
        }
        if state.leader {
            self.cond.notify_all();
            return;
        }
        if state.members.is_empty() {
            state.window_start = None;
            self.cond.notify_all();
            return;
        }

        state.leader = true;
        while state.running > 0 || !self.is_closed(&state) {
            match state.window_start {
                Some(start) if state.running == 0 => {
                    self.cond.wait_until(&mut state, start + self.window);
                }
                _ => self.cond.wait(&mut state),
            }
        }
        state.leader = false;
        state.window_start = None;
        let members = mem::take(&mut state.members);
        if members.is_empty() {
            self.cond.notify_all();
            return;
        }

        state.busy = true;
        let outcome = MutexGuard::unlocked(&mut state, || self.commit_batch(members.len()));
        state.busy = false;
        drop(state);
        self.cond.notify_all();

        match outcome {
            Ok(commit_time) => {
                for member in members {
                    member.succeed(commit_time);
                }
            }
            Err(e) => {
                self.stats.record_commit_failure();
                let message = e.to_string();
                for member in members {
                    member.fail(CoreError::commit_failed(message.clone()));
                }
            }
        }
    }

    /// True once the batch may admit no one else: its window has elapsed or
    /// it holds a full batch of members.
    fn is_closed(&self, state: &BatchState) -> bool {
        let full = self.max_batch > 0 && state.members.len() + state.running >= self.max_batch;
        full || state
            .window_start
            .is_none_or(|start| start.elapsed() >= self.window)
    }

    fn commit_batch(&self, size: usize) -> CoreResult<Timestamp> {
        if self.journal.is_abort_required() {
            self.journal.abort();
            return Err(CoreError::commit_failed("journal abort was requested"));
        }
        let commit_time = self.timestamps.next_timestamp();
        match self.journal.commit(commit_time) {
            Ok(Some(_)) => {
                debug!(size, %commit_time, "group commit");
                Ok(commit_time)
            }
            Ok(None) => Ok(self.journal.last_commit_time()),
            Err(e) => {
                error!(size, error = %e, "group commit failed");
                self.journal.abort();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::index::IndexMetadata;
    use crate::timestamp::TimestampService;
    use std::sync::mpsc;
    use std::thread;

    struct Member(mpsc::Sender<CoreResult<Timestamp>>);

    impl BatchMember for Member {
        fn succeed(self: Box<Self>, commit_time: Timestamp) {
            let _ = self.0.send(Ok(commit_time));
        }

        fn fail(self: Box<Self>, error: CoreError) {
            let _ = self.0.send(Err(error));
        }
    }

    fn group(window: Duration, max_batch: usize) -> (Arc<Journal>, GroupCommit) {
        let stats = Arc::new(EngineStats::new());
        let journal =
            Arc::new(Journal::open(&EngineConfig::transient(), Arc::clone(&stats)).unwrap());
        for name in ["x", "y", "z"] {
            journal.register_index(IndexMetadata::new(name)).unwrap();
        }
        journal.commit(Timestamp::new(1)).unwrap();
        let timestamps = Arc::new(TimestampService::starting_after(Timestamp::new(1)));
        let group = GroupCommit::new(Arc::clone(&journal), timestamps, window, max_batch, stats);
        (journal, group)
    }

    fn write(group: &GroupCommit, journal: &Journal, name: &str, done: mpsc::Sender<CoreResult<Timestamp>>) {
        group.enter();
        journal
            .live_index(name)
            .unwrap()
            .put(b"k".to_vec(), name.as_bytes().to_vec(), 2);
        group.leave(Some(Box::new(Member(done))));
    }

    #[test]
    fn tasks_arriving_within_the_window_share_one_commit() {
        let (journal, group) = group(Duration::from_secs(1), 0);
        let before = journal.commit_counter();
        let (done, results) = mpsc::channel();

        thread::scope(|scope| {
            for (i, name) in ["x", "y", "z"].into_iter().enumerate() {
                let (group, journal, done) = (&group, &journal, done.clone());
                scope.spawn(move || {
                    thread::sleep(Duration::from_millis(30 * i as u64));
                    write(group, journal, name, done);
                });
            }
        });
        drop(done);

        let times: Vec<Timestamp> = results.iter().map(|r| r.unwrap()).collect();
        assert_eq!(times.len(), 3);
        assert!(times.iter().all(|t| *t == times[0]));
        assert_eq!(journal.commit_counter(), before + 1);
    }

    #[test]
    fn zero_window_commits_each_task() {
        let (journal, group) = group(Duration::ZERO, 0);
        let before = journal.commit_counter();
        let (done, results) = mpsc::channel();

        for name in ["x", "y", "z"] {
            write(&group, &journal, name, done.clone());
        }
        drop(done);

        let times: Vec<Timestamp> = results.iter().map(|r| r.unwrap()).collect();
        assert_eq!(times.len(), 3);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(journal.commit_counter(), before + 3);
    }

    #[test]
    fn full_batch_commits_before_the_window_ends() {
        let (journal, group) = group(Duration::from_secs(10), 2);
        let before = journal.commit_counter();
        let (done, results) = mpsc::channel();
        let start = Instant::now();

        thread::scope(|scope| {
            let (group_ref, journal_ref, first) = (&group, &journal, done.clone());
            scope.spawn(move || write(group_ref, journal_ref, "x", first));
            thread::sleep(Duration::from_millis(50));
            write(&group, &journal, "y", done.clone());
        });
        drop(done);

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(journal.commit_counter(), before + 1);
    }

    #[test]
    fn batch_of_failed_tasks_commits_nothing() {
        let (journal, group) = group(Duration::from_secs(10), 0);
        let before = journal.commit_counter();

        group.enter();
        group.leave(None);

        assert_eq!(journal.commit_counter(), before);
        assert!(group.state.lock().window_start.is_none());
    }
}
