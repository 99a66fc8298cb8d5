use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use cloudmirror_core::Share;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ActionError, ErrorKind};
use crate::sync::item_store::Item;
use crate::sync::scheduler::SyncScheduler;

pub type ActivityId = Uuid;
pub type ActivityResult = Result<ActionOutput, ActionError>;

/// What a finished command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    pub item: Option<Item>,
    pub share: Option<Share>,
    pub thumbnail: Option<Vec<u8>>,
    /// Local copy written by a download.
    pub local_path: Option<PathBuf>,
}

impl ActionOutput {
    pub fn with_item(item: Item) -> Self {
        Self {
            item: Some(item),
            ..Self::default()
        }
    }

    fn merge(&mut self, other: ActionOutput) {
        if other.item.is_some() {
            self.item = other.item;
        }
        if other.share.is_some() {
            self.share = other.share;
        }
        if other.thumbnail.is_some() {
            self.thumbnail = other.thumbnail;
        }
        if other.local_path.is_some() {
            self.local_path = other.local_path;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub finished: bool,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.finished || self.total == 0 {
            return if self.finished { 1.0 } else { 0.0 };
        }
        self.completed as f64 / self.total as f64
    }
}

/// Caller-side handle of one command.
///
/// Completes exactly once through [`Activity::wait`]. Dropping the handle
/// does not cancel the underlying records.
#[derive(Debug)]
pub struct Activity {
    id: ActivityId,
    records: Vec<i64>,
    cancel: CancellationToken,
    progress: watch::Receiver<Progress>,
    result: oneshot::Receiver<ActivityResult>,
    scheduler: Weak<SyncScheduler>,
}

impl Activity {
    pub fn id(&self) -> ActivityId {
        self.id
    }

    /// Sequence numbers of the sync records this command queued or joined.
    pub fn records(&self) -> &[i64] {
        &self.records
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn progress_updates(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Requests cancellation. Records that already reached the server still
    /// complete normally.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let Some(scheduler) = self.scheduler.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(activity = %self.id, "cancel requested outside a runtime; records keep running");
            return;
        };
        let id = self.id;
        runtime.spawn(async move {
            if let Err(err) = scheduler.cancel_activity(id).await {
                warn!(activity = %id, error = %err, "failed to cancel activity records");
            }
        });
    }

    pub async fn wait(self) -> ActivityResult {
        self.result.await.unwrap_or_else(|_| {
            Err(ActionError::new(
                ErrorKind::Closed,
                "core closed before the activity completed",
            ))
        })
    }
}

/// Registered activity awaiting its records; turned into an [`Activity`]
/// once the command's transaction committed.
pub(crate) struct ActivityTicket {
    id: ActivityId,
    cancel: CancellationToken,
    progress: watch::Receiver<Progress>,
    result: oneshot::Receiver<ActivityResult>,
}

impl ActivityTicket {
    pub(crate) fn id(&self) -> ActivityId {
        self.id
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn into_activity(self, records: Vec<i64>, scheduler: Weak<SyncScheduler>) -> Activity {
        Activity {
            id: self.id,
            records,
            cancel: self.cancel,
            progress: self.progress,
            result: self.result,
            scheduler,
        }
    }
}

struct Tracker {
    pending: BTreeSet<i64>,
    total: usize,
    completed: usize,
    sealed: bool,
    output: ActionOutput,
    error: Option<ActionError>,
    cancel: CancellationToken,
    progress: watch::Sender<Progress>,
    result: Option<oneshot::Sender<ActivityResult>>,
}

impl Tracker {
    fn absorb(&mut self, result: ActivityResult) {
        self.completed += 1;
        match result {
            Ok(output) => self.output.merge(output),
            Err(error) => {
                self.error.get_or_insert(error);
            }
        }
    }

    fn publish(&self) {
        let progress = Progress {
            total: self.total,
            completed: self.completed,
            finished: self.sealed && self.pending.is_empty(),
        };
        self.progress.send_replace(progress);
    }

    fn finish(mut self) {
        self.publish();
        let result = match self.error.take() {
            Some(error) => Err(error),
            None => Ok(std::mem::take(&mut self.output)),
        };
        if let Some(sender) = self.result.take() {
            // receiver may be gone; nobody is waiting then
            let _ = sender.send(result);
        }
    }
}

#[derive(Default)]
struct RegistryState {
    activities: HashMap<ActivityId, Tracker>,
    by_record: HashMap<i64, Vec<ActivityId>>,
}

impl RegistryState {
    fn settle(&mut self, id: ActivityId, seq: Option<i64>, result: ActivityResult) {
        let Some(tracker) = self.activities.get_mut(&id) else {
            return;
        };
        if let Some(seq) = seq {
            tracker.pending.remove(&seq);
        }
        tracker.absorb(result);
        self.finish_if_done(id);
    }

    fn finish_if_done(&mut self, id: ActivityId) {
        let done = self
            .activities
            .get(&id)
            .is_some_and(|tracker| tracker.sealed && tracker.pending.is_empty());
        if !done {
            if let Some(tracker) = self.activities.get(&id) {
                tracker.publish();
            }
            return;
        }
        if let Some(tracker) = self.activities.remove(&id) {
            debug!(activity = %id, "activity finished");
            tracker.finish();
        }
    }
}

/// Maps sync records to the activities waiting on them.
#[derive(Default)]
pub struct ActivityRegistry {
    state: Mutex<RegistryState>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn open(&self) -> ActivityTicket {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (progress_tx, progress) = watch::channel(Progress::default());
        let (result_tx, result) = oneshot::channel();
        self.lock().activities.insert(
            id,
            Tracker {
                pending: BTreeSet::new(),
                total: 0,
                completed: 0,
                sealed: false,
                output: ActionOutput::default(),
                error: None,
                cancel: cancel.clone(),
                progress: progress_tx,
                result: Some(result_tx),
            },
        );
        ActivityTicket {
            id,
            cancel,
            progress,
            result,
        }
    }

    /// Makes activity `id` wait for record `seq`.
    pub(crate) fn attach(&self, id: ActivityId, seq: i64) {
        let mut state = self.lock();
        let Some(tracker) = state.activities.get_mut(&id) else {
            return;
        };
        if tracker.pending.insert(seq) {
            tracker.total += 1;
            tracker.publish();
            state.by_record.entry(seq).or_default().push(id);
        }
    }

    /// Counts a result that needed no sync record.
    pub(crate) fn complete_immediately(&self, id: ActivityId, result: ActivityResult) {
        let mut state = self.lock();
        if let Some(tracker) = state.activities.get_mut(&id) {
            tracker.total += 1;
        }
        state.settle(id, None, result);
    }

    /// No more records will be attached; completes the activity if nothing
    /// is outstanding.
    pub(crate) fn seal(&self, id: ActivityId) {
        let mut state = self.lock();
        if let Some(tracker) = state.activities.get_mut(&id) {
            tracker.sealed = true;
        }
        state.finish_if_done(id);
    }

    /// Forgets an activity whose command failed before committing.
    pub(crate) fn abandon(&self, id: ActivityId) {
        let mut state = self.lock();
        if let Some(tracker) = state.activities.remove(&id) {
            for seq in &tracker.pending {
                if let Some(ids) = state.by_record.get_mut(seq) {
                    ids.retain(|other| *other != id);
                }
            }
        }
    }

    /// Delivers the terminal result of `seq` to every attached activity.
    /// Returns how many activities were waiting on it.
    pub(crate) fn record_finished(&self, seq: i64, result: ActivityResult) -> usize {
        let mut state = self.lock();
        let ids = state.by_record.remove(&seq).unwrap_or_default();
        for id in &ids {
            state.settle(*id, Some(seq), result.clone());
        }
        ids.len()
    }

    /// Releases one activity from a record other activities still wait on.
    pub(crate) fn detach(&self, id: ActivityId, seq: i64, result: ActivityResult) {
        let mut state = self.lock();
        if let Some(ids) = state.by_record.get_mut(&seq) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                state.by_record.remove(&seq);
            }
        }
        state.settle(id, Some(seq), result);
    }

    pub(crate) fn records_of(&self, id: ActivityId) -> Vec<i64> {
        self.lock()
            .activities
            .get(&id)
            .map(|tracker| tracker.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn activities_of(&self, seq: i64) -> Vec<ActivityId> {
        self.lock().by_record.get(&seq).cloned().unwrap_or_default()
    }

    /// True when `seq` has waiters and every one of them asked to cancel.
    pub(crate) fn all_cancelled(&self, seq: i64) -> bool {
        let state = self.lock();
        let Some(ids) = state.by_record.get(&seq) else {
            return false;
        };
        !ids.is_empty()
            && ids.iter().all(|id| {
                state
                    .activities
                    .get(id)
                    .is_some_and(|tracker| tracker.cancel.is_cancelled())
            })
    }

    /// Completes every outstanding activity with `error`.
    pub(crate) fn fail_all(&self, error: ActionError) {
        let mut state = self.lock();
        state.by_record.clear();
        for (_, mut tracker) in state.activities.drain() {
            tracker.pending.clear();
            tracker.sealed = true;
            tracker.error.get_or_insert(error.clone());
            tracker.finish();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activity_completes_after_all_records() {
        let registry = ActivityRegistry::new();
        let ticket = registry.open();
        let id = ticket.id();
        registry.attach(id, 1);
        registry.attach(id, 2);
        registry.seal(id);
        let activity = ticket.into_activity(vec![1, 2], Weak::new());

        assert_eq!(registry.record_finished(1, Ok(ActionOutput::default())), 1);
        assert_eq!(
            activity.progress(),
            Progress {
                total: 2,
                completed: 1,
                finished: false
            }
        );
        registry.record_finished(2, Ok(ActionOutput::default()));
        assert!(activity.progress().finished);
        assert!(activity.wait().await.is_ok());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn first_error_wins() {
        let registry = ActivityRegistry::new();
        let ticket = registry.open();
        let id = ticket.id();
        for seq in [1, 2, 3] {
            registry.attach(id, seq);
        }
        registry.seal(id);
        registry.record_finished(2, Err(ActionError::new(ErrorKind::Conflict, "first")));
        registry.record_finished(1, Ok(ActionOutput::default()));
        registry.record_finished(3, Err(ActionError::new(ErrorKind::NotFound, "second")));

        let err = ticket
            .into_activity(vec![], Weak::new())
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.message, "first");
    }

    #[tokio::test]
    async fn coalesced_record_resolves_every_waiter() {
        let registry = ActivityRegistry::new();
        let first = registry.open();
        let second = registry.open();
        registry.attach(first.id(), 7);
        registry.attach(second.id(), 7);
        registry.seal(first.id());
        registry.seal(second.id());

        assert_eq!(registry.activities_of(7).len(), 2);
        assert_eq!(registry.record_finished(7, Ok(ActionOutput::default())), 2);
        assert!(first.into_activity(vec![7], Weak::new()).wait().await.is_ok());
        assert!(second.into_activity(vec![7], Weak::new()).wait().await.is_ok());
    }

    #[tokio::test]
    async fn record_free_activity_completes_on_seal() {
        let registry = ActivityRegistry::new();
        let ticket = registry.open();
        registry.complete_immediately(ticket.id(), Ok(ActionOutput::default()));
        assert_eq!(registry.len(), 1);
        registry.seal(ticket.id());
        assert!(ticket.into_activity(vec![], Weak::new()).wait().await.is_ok());
    }

    #[tokio::test]
    async fn detach_leaves_other_waiters_attached() {
        let registry = ActivityRegistry::new();
        let first = registry.open();
        let second = registry.open();
        registry.attach(first.id(), 3);
        registry.attach(second.id(), 3);
        registry.seal(first.id());
        registry.seal(second.id());

        registry.detach(first.id(), 3, Err(ActionError::cancelled()));
        assert_eq!(registry.activities_of(3), vec![second.id()]);
        let err = first
            .into_activity(vec![3], Weak::new())
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn dropped_registry_reports_closed() {
        let registry = ActivityRegistry::new();
        let ticket = registry.open();
        registry.attach(ticket.id(), 1);
        drop(registry);
        let err = ticket
            .into_activity(vec![1], Weak::new())
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Closed);
    }

    #[test]
    fn progress_fraction() {
        let progress = Progress {
            total: 4,
            completed: 1,
            finished: false,
        };
        assert_eq!(progress.fraction(), 0.25);
        assert_eq!(Progress::default().fraction(), 0.0);
    }
}
