use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use cloudmirror_core::Connection;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::now_millis;
use super::record::{ActionKind, RecordPayload, RecordState, SyncRecord};
use super::vault::{Vault, VaultStatus};
use crate::activity::{ActivityId, ActivityRegistry};
use crate::config::CoreConfig;
use crate::core::CoreDelegate;
use crate::error::{ActionError, CoreError, ErrorKind};

#[path = "scheduler_apply.rs"]
mod apply;

/// Executes queued sync records against the connection and settles their
/// results into the vault.
pub struct SyncScheduler {
    vault: Arc<Vault>,
    connection: Arc<dyn Connection>,
    activities: Arc<ActivityRegistry>,
    delegate: RwLock<Option<Weak<dyn CoreDelegate>>>,
    backoff: Backoff,
    max_attempts: u32,
    action_timeout: Duration,
    poll_interval: Duration,
    drain_timeout: Duration,
    limiter: Arc<Semaphore>,
    wake: Notify,
    running: Mutex<HashMap<i64, CancellationToken>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(
        vault: Arc<Vault>,
        connection: Arc<dyn Connection>,
        activities: Arc<ActivityRegistry>,
        config: &CoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            vault,
            connection,
            activities,
            delegate: RwLock::new(None),
            backoff: config.backoff(),
            max_attempts: config.max_attempts.max(1),
            action_timeout: config.action_timeout,
            poll_interval: config.worker_poll_interval,
            drain_timeout: config.drain_timeout,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_actions.max(1))),
            wake: Notify::new(),
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    /// Registers the delegate without keeping it alive. `None` unregisters.
    pub fn set_delegate(&self, delegate: Option<&Arc<dyn CoreDelegate>>) {
        let mut slot = self.delegate.write().unwrap_or_else(PoisonError::into_inner);
        *slot = delegate.map(Arc::downgrade);
    }

    fn delegate(&self) -> Option<Arc<dyn CoreDelegate>> {
        self.delegate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn notify_error(&self, error: &ActionError) {
        if let Some(delegate) = self.delegate() {
            delegate.handle_error(error);
        }
    }

    pub(crate) fn notify_attention(&self, record: &SyncRecord) {
        if let Some(delegate) = self.delegate() {
            delegate.record_needs_attention(record);
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<i64, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of records currently claimed by this scheduler.
    pub fn in_flight(&self) -> usize {
        self.running().len()
    }

    /// Asks the worker to look for eligible records now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Spawns the background worker. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let this = Arc::clone(self);
        *worker = Some(tokio::spawn(this.worker_loop()));
    }

    /// Stops claiming new records and waits (up to the drain timeout) for the
    /// ones in flight. Records cut off by the timeout resume on next open.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker
            && let Err(err) = worker.await
        {
            warn!(error = %err, "sync worker ended abnormally");
        }
    }

    /// Claims and executes one eligible record inline. Returns `false` when
    /// nothing is due.
    pub async fn run_once(&self) -> Result<bool, CoreError> {
        let Some((record, token)) = self.claim_next().await? else {
            return Ok(false);
        };
        self.execute_claimed(record, token).await;
        Ok(true)
    }

    /// Runs records inline until none is due. Returns how many ran.
    pub async fn run_until_idle(&self) -> Result<usize, CoreError> {
        let mut executed = 0;
        while self.run_once().await? {
            executed += 1;
        }
        Ok(executed)
    }

    async fn worker_loop(self: Arc<Self>) {
        info!(bookmark = %self.vault.bookmark(), "sync worker started");
        let mut tasks = JoinSet::new();
        loop {
            while let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() {
                if self.shutdown.is_cancelled() {
                    break;
                }
                match self.claim_next().await {
                    Ok(Some((record, token))) => {
                        let this = Arc::clone(&self);
                        tasks.spawn(async move {
                            let _permit = permit;
                            this.execute_claimed(record, token).await;
                        });
                    }
                    Ok(None) => break,
                    Err(err) => {
                        if err.is_corruption() {
                            self.storage_corrupted(&err).await;
                        } else if err.kind() != ErrorKind::Closed {
                            warn!(error = %err, "failed to claim sync record");
                        }
                        break;
                    }
                }
            }
            if self.shutdown.is_cancelled()
                || matches!(
                    self.vault.status(),
                    VaultStatus::Closed | VaultStatus::Corrupted
                )
            {
                break;
            }

            let idle = self.idle_delay().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined
                        && err.is_panic()
                    {
                        error!("sync task panicked");
                    }
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "drain timed out; unfinished records resume on next open"
            );
            tasks.abort_all();
        }
        info!(bookmark = %self.vault.bookmark(), "sync worker stopped");
    }

    /// Sleep until the earliest retry is due, bounded by the poll interval.
    async fn idle_delay(&self) -> Duration {
        let next = match self.vault.read().await {
            Ok(mut read) => read.queue().next_retry_at().await.ok().flatten(),
            Err(_) => None,
        };
        match next {
            Some(at) => {
                let wait = u64::try_from(at.saturating_sub(now_millis())).unwrap_or(0);
                Duration::from_millis(wait).min(self.poll_interval)
            }
            None => self.poll_interval,
        }
    }

    /// Marks the next eligible record `scheduled` and registers its
    /// cancellation token before the claim becomes visible.
    async fn claim_next(&self) -> Result<Option<(SyncRecord, CancellationToken)>, CoreError> {
        if matches!(
            self.vault.status(),
            VaultStatus::Closed | VaultStatus::Corrupted
        ) {
            return Ok(None);
        }
        let mut txn = self.vault.write().await?;
        let Some(record) = txn.queue().dequeue_next(now_millis()).await? else {
            return Ok(None);
        };
        let token = CancellationToken::new();
        if self.activities.all_cancelled(record.seq) {
            token.cancel();
        }
        self.running().insert(record.seq, token.clone());
        if let Err(err) = txn.commit().await {
            self.running().remove(&record.seq);
            return Err(err.into());
        }
        debug!(seq = record.seq, kind = %record.kind, path = %record.path, "claimed sync record");
        Ok(Some((record, token)))
    }

    async fn execute_claimed(&self, record: SyncRecord, token: CancellationToken) {
        if let Err(err) = self.process(&record, &token).await {
            self.handle_internal_error(&record, err).await;
        }
        self.running().remove(&record.seq);
    }

    async fn process(&self, record: &SyncRecord, token: &CancellationToken) -> Result<(), CoreError> {
        if token.is_cancelled() {
            return self.settle_cancelled(record).await;
        }
        let mut txn = self.vault.write().await?;
        txn.queue()
            .mark_state(record.seq, RecordState::Executing)
            .await?;
        txn.commit().await?;
        info!(
            seq = record.seq,
            kind = %record.kind,
            path = %record.path,
            attempt = record.attempt,
            "executing sync record"
        );

        if record.interrupted {
            match self.probe_applied(record).await {
                Ok(Some(outcome)) => {
                    info!(seq = record.seq, path = %record.path, "interrupted record already applied on the server");
                    return self.apply_success(record, outcome).await;
                }
                Ok(None) => {}
                Err(err) => return self.apply_failure(record, err).await,
            }
        }
        let item = if record.kind == ActionKind::SetOfflineAvailable {
            self.current_item(record).await?
        } else {
            None
        };
        match self.perform(record, item.as_ref(), token).await {
            Ok(outcome) => self.apply_success(record, outcome).await,
            Err(err) => self.apply_failure(record, err).await,
        }
    }

    /// Cancels the records of activity `id`. Waiting records are dropped and
    /// their optimistic changes undone; running ones get their token
    /// cancelled and finish however the connection decides.
    pub(crate) async fn cancel_activity(&self, id: ActivityId) -> Result<(), CoreError> {
        for seq in self.activities.records_of(id) {
            if self.activities.activities_of(seq).len() > 1 {
                self.activities
                    .detach(id, seq, Err(ActionError::cancelled()));
                continue;
            }
            let mut txn = self.vault.write().await?;
            let running = self.running().get(&seq).cloned();
            if let Some(token) = running {
                debug!(seq, "cancelling running sync record");
                token.cancel();
                continue;
            }
            let Some(record) = txn.queue().get(seq).await? else {
                continue;
            };
            if !record.state.is_waiting() {
                continue;
            }
            self.revert_optimistic(&mut txn, &record).await?;
            txn.queue().remove(seq).await?;
            txn.commit().await?;
            discard_staged(&self.vault, &record.payload).await;
            self.activities
                .record_finished(seq, Err(ActionError::cancelled()));
            info!(seq, kind = %record.kind, path = %record.path, "sync record cancelled before execution");
        }
        Ok(())
    }

    async fn settle_cancelled(&self, record: &SyncRecord) -> Result<(), CoreError> {
        let mut txn = self.vault.write().await?;
        self.revert_optimistic(&mut txn, record).await?;
        txn.queue().remove(record.seq).await?;
        txn.commit().await?;
        discard_staged(&self.vault, &record.payload).await;
        self.activities
            .record_finished(record.seq, Err(ActionError::cancelled()));
        info!(seq = record.seq, kind = %record.kind, path = %record.path, "sync record cancelled");
        Ok(())
    }

    async fn handle_internal_error(&self, record: &SyncRecord, err: CoreError) {
        if err.is_corruption() {
            self.storage_corrupted(&err).await;
            return;
        }
        if err.kind() == ErrorKind::Closed {
            debug!(seq = record.seq, "vault closed while settling; record resumes on next open");
            return;
        }
        error!(seq = record.seq, kind = %record.kind, error = %err, "failed to settle sync record");
        let retry_at = now_millis() + delay_millis(self.backoff.delay(record.attempt));
        let requeued = async {
            let mut txn = self.vault.write().await?;
            txn.queue()
                .schedule_retry(
                    record.seq,
                    record.attempt + 1,
                    retry_at,
                    err.kind(),
                    &err.to_string(),
                )
                .await?;
            txn.commit().await?;
            Ok::<(), CoreError>(())
        }
        .await;
        if let Err(requeue_err) = requeued {
            error!(seq = record.seq, error = %requeue_err, "failed to requeue sync record");
        }
    }

    pub(crate) async fn storage_corrupted(&self, err: &CoreError) {
        self.vault.mark_corrupted().await;
        let error = ActionError::new(ErrorKind::StorageCorruption, err.to_string());
        self.activities.fail_all(error.clone());
        self.notify_error(&error);
    }
}

fn delay_millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

/// Removes a staged upload copy. Sources outside the staging area belong to
/// the caller and are left alone.
pub(crate) async fn discard_staged(vault: &Vault, payload: &RecordPayload) {
    if let RecordPayload::Upload { source, .. } = payload {
        remove_staged(vault.staging_root(), source).await;
    }
}

pub(crate) async fn remove_staged(staging_root: &Path, source: &Path) {
    if !source.starts_with(staging_root) {
        return;
    }
    if let Err(err) = tokio::fs::remove_file(source).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %source.display(), error = %err, "failed to remove staged upload");
    }
}

/// Deletes a cached download (file or folder tree).
pub(crate) async fn remove_cached(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "failed to remove cached file");
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
