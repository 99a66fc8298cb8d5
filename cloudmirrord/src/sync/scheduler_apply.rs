use std::path::PathBuf;

use cloudmirror_core::{
    ConnectionError, ErrorClass, RemoteAction, RemoteResponse, ServerItem, ShareOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SyncScheduler, delay_millis, discard_staged, remove_cached};
use crate::activity::ActionOutput;
use crate::error::{ActionError, CoreError, ErrorKind};
use crate::sync::action_queue::QueueError;
use crate::sync::item_store::{Item, ItemStore, StoreError};
use crate::sync::now_millis;
use crate::sync::paths::cache_path_for;
use crate::sync::record::{ActionKind, NewRecord, RecordPayload, RecordState, SyncRecord};
use crate::sync::vault::WriteTxn;

const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

pub(super) enum Outcome {
    Remote(RemoteResponse),
    /// A copied folder together with its new contents.
    Copied {
        response: RemoteResponse,
        tree: Vec<ServerItem>,
    },
    /// Nothing to send; the record only changes local state.
    Local,
}

/// Finds the item a record acts on: by local id, else at the path it has
/// once the record ran.
pub(crate) async fn locate(
    mut items: ItemStore<'_>,
    record: &SyncRecord,
) -> Result<Option<Item>, StoreError> {
    if let Some(local_id) = record.local_id.as_deref()
        && let Some(item) = items.lookup_by_local_id(local_id).await?
    {
        return Ok(Some(item));
    }
    items.lookup(record.effective_path()).await
}

fn identity(payload: &RecordPayload) -> (Option<String>, Option<String>) {
    match payload {
        RecordPayload::Move {
            file_id,
            expected_etag,
        }
        | RecordPayload::Delete {
            file_id,
            expected_etag,
        } => (file_id.clone(), expected_etag.clone()),
        _ => (None, None),
    }
}

impl SyncScheduler {
    pub(super) async fn current_item(&self, record: &SyncRecord) -> Result<Option<Item>, CoreError> {
        let mut read = self.vault.read().await?;
        Ok(locate(read.items(), record).await?)
    }

    fn download_target(&self, path: &str) -> Result<PathBuf, ConnectionError> {
        cache_path_for(self.vault.files_root(), path)
            .map_err(|err| ConnectionError::LocalIo(err.to_string()))
    }

    fn remote_action(
        &self,
        record: &SyncRecord,
        item: Option<&Item>,
    ) -> Result<Option<RemoteAction>, ConnectionError> {
        let path = record.path.clone();
        let destination = || {
            record.dest_path.clone().ok_or_else(|| {
                ConnectionError::LocalIo(format!("record #{} has no destination", record.seq))
            })
        };
        let action = match (record.kind, &record.payload) {
            (ActionKind::CreateFolder, _) => RemoteAction::CreateFolder { path },
            (ActionKind::CreateFile, _) => RemoteAction::CreateFile { path },
            (ActionKind::Rename | ActionKind::Move, payload) => {
                let (file_id, expected_etag) = identity(payload);
                RemoteAction::Move {
                    file_id,
                    from: path,
                    to: destination()?,
                    expected_etag,
                }
            }
            (ActionKind::Copy, payload) => RemoteAction::Copy {
                from: path,
                to: destination()?,
                overwrite: matches!(payload, RecordPayload::Copy { overwrite: true }),
            },
            (ActionKind::Delete, payload) => {
                let (file_id, expected_etag) = identity(payload);
                RemoteAction::Delete {
                    file_id,
                    path,
                    expected_etag,
                }
            }
            (
                ActionKind::Upload,
                RecordPayload::Upload {
                    source,
                    checksum,
                    expected_etag,
                },
            ) => RemoteAction::Upload {
                source: source.clone(),
                path,
                expected_etag: expected_etag.clone(),
                checksum: checksum.clone(),
            },
            (ActionKind::Upload, _) => {
                return Err(ConnectionError::LocalIo(format!(
                    "upload record #{} has no source",
                    record.seq
                )));
            }
            (ActionKind::Download, _) => RemoteAction::Download {
                target: self.download_target(&path)?,
                path,
            },
            (ActionKind::RetrieveThumbnail, payload) => RemoteAction::Thumbnail {
                path,
                max_size: match payload {
                    RecordPayload::Thumbnail { max_size } => *max_size,
                    _ => DEFAULT_THUMBNAIL_SIZE,
                },
            },
            (ActionKind::ShareCreate, payload) => RemoteAction::Share {
                path,
                options: match payload {
                    RecordPayload::Share { options } => options.clone(),
                    _ => ShareOptions::public_link(),
                },
            },
            (ActionKind::SetOfflineAvailable, _) => match item {
                Some(item) if !item.is_folder() => RemoteAction::Download {
                    target: self.download_target(&item.path)?,
                    path: item.path.clone(),
                },
                _ => return Ok(None),
            },
            (ActionKind::ClearOfflineAvailable, _) => return Ok(None),
        };
        Ok(Some(action))
    }

    pub(super) async fn perform(
        &self,
        record: &SyncRecord,
        item: Option<&Item>,
        token: &CancellationToken,
    ) -> Result<Outcome, ConnectionError> {
        let Some(action) = self.remote_action(record, item)? else {
            return Ok(Outcome::Local);
        };
        debug!(seq = record.seq, action = action.name(), target = action.target_path(), "sending request");
        let response = match tokio::time::timeout(
            self.action_timeout,
            self.connection.execute(&action, token),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let copied_folder = response
            .item()
            .filter(|item| record.kind == ActionKind::Copy && item.is_folder())
            .map(|item| item.path.clone());
        if let Some(root) = copied_folder {
            match self.connection.list_tree(&root).await {
                Ok(tree) => return Ok(Outcome::Copied { response, tree }),
                Err(err) => {
                    warn!(seq = record.seq, path = %root, error = %err, "copied folder contents not listed; they appear after the next reconciliation");
                }
            }
        }
        Ok(Outcome::Remote(response))
    }

    /// Checks whether an interrupted record already took effect on the server
    /// so that it is not issued twice. A failed lookup counts as a failed
    /// attempt; the record is never re-issued blind.
    pub(super) async fn probe_applied(
        &self,
        record: &SyncRecord,
    ) -> Result<Option<Outcome>, ConnectionError> {
        if !record.kind.leaves_server_trace() {
            return Ok(None);
        }
        let current = self.connection.item_at(record.effective_path()).await?;
        let (file_id, _) = identity(&record.payload);
        let applied = match (record.kind, current.as_ref()) {
            (ActionKind::CreateFolder, Some(item)) => item.is_folder(),
            (ActionKind::CreateFile, Some(item)) => !item.is_folder(),
            (ActionKind::Rename | ActionKind::Move, Some(item)) => {
                file_id.as_deref() == Some(item.file_id.as_str())
            }
            (ActionKind::Copy, Some(_)) => true,
            (ActionKind::Upload, Some(item)) => matches!(
                &record.payload,
                RecordPayload::Upload { checksum, .. }
                    if item.checksum.as_deref() == Some(checksum.as_str())
            ),
            (ActionKind::Delete, None) => true,
            (ActionKind::Delete, Some(item)) => {
                file_id.as_deref().is_some_and(|id| id != item.file_id)
            }
            _ => false,
        };
        if !applied {
            return Ok(None);
        }
        let response = match current {
            Some(item) if record.kind != ActionKind::Delete => RemoteResponse::Item(item),
            _ => RemoteResponse::Removed,
        };
        Ok(Some(Outcome::Remote(response)))
    }

    /// Commits the result of a successful record and completes it.
    pub(super) async fn apply_success(
        &self,
        record: &SyncRecord,
        outcome: Outcome,
    ) -> Result<(), CoreError> {
        let mut stale = Vec::new();
        let mut txn = self.vault.write().await?;
        let output = match outcome {
            Outcome::Remote(response) => {
                self.apply_response(&mut txn, record, response, &[], &mut stale)
                    .await?
            }
            Outcome::Copied { response, tree } => {
                self.apply_response(&mut txn, record, response, &tree, &mut stale)
                    .await?
            }
            Outcome::Local => self.apply_local(&mut txn, record, &mut stale).await?,
        };
        txn.queue().complete(record.seq).await?;
        txn.commit().await?;

        for path in &stale {
            remove_cached(path).await;
        }
        discard_staged(&self.vault, &record.payload).await;
        self.activities.record_finished(record.seq, Ok(output));
        info!(seq = record.seq, kind = %record.kind, path = %record.path, "sync record done");
        self.wake();
        Ok(())
    }

    async fn apply_response(
        &self,
        txn: &mut WriteTxn<'_>,
        record: &SyncRecord,
        response: RemoteResponse,
        tree: &[ServerItem],
        stale: &mut Vec<PathBuf>,
    ) -> Result<ActionOutput, CoreError> {
        // a copy is a new entry; everything else is the record's own item
        let adopt = match record.kind {
            ActionKind::Copy => None,
            _ => record.local_id.as_deref(),
        };
        match response {
            RemoteResponse::Removed => {
                let found = locate(txn.items(), record).await?;
                let path = found.map(|item| item.path).unwrap_or_else(|| record.path.clone());
                txn.items().remove_items(&[&path]).await?;
                stale.push(cache_path_for(self.vault.files_root(), &path)?);
                Ok(ActionOutput::default())
            }
            RemoteResponse::Item(server) => {
                let item = txn.items().apply_server_item(&server, adopt).await?;
                for entry in tree {
                    txn.items().apply_server_item(entry, None).await?;
                }
                Ok(ActionOutput::with_item(item))
            }
            RemoteResponse::Downloaded {
                item: server,
                local,
            } => {
                let mut item = txn.items().apply_server_item(&server, adopt).await?;
                txn.items()
                    .set_downloaded_etag(&item.local_id, Some(&server.etag))
                    .await?;
                item.downloaded_etag = Some(server.etag);
                Ok(ActionOutput {
                    item: Some(item),
                    local_path: Some(local),
                    ..ActionOutput::default()
                })
            }
            RemoteResponse::Thumbnail { item: server, data } => {
                let item = txn.items().apply_server_item(&server, adopt).await?;
                Ok(ActionOutput {
                    item: Some(item),
                    thumbnail: Some(data),
                    ..ActionOutput::default()
                })
            }
            RemoteResponse::Shared {
                item: server,
                share,
            } => {
                let item = txn.items().apply_server_item(&server, adopt).await?;
                Ok(ActionOutput {
                    item: Some(item),
                    share: Some(share),
                    ..ActionOutput::default()
                })
            }
        }
    }

    async fn apply_local(
        &self,
        txn: &mut WriteTxn<'_>,
        record: &SyncRecord,
        stale: &mut Vec<PathBuf>,
    ) -> Result<ActionOutput, CoreError> {
        let Some(item) = locate(txn.items(), record).await? else {
            return Ok(ActionOutput::default());
        };
        match record.kind {
            ActionKind::SetOfflineAvailable => {
                txn.items().set_offline(&item.path, true).await?;
                let mut queued = 0;
                for entry in txn.items().list_subtree(&item.path).await? {
                    let current = entry.downloaded_etag.is_some() && entry.downloaded_etag == entry.etag;
                    if entry.is_folder() || entry.local_only || current {
                        continue;
                    }
                    let download =
                        NewRecord::new(ActionKind::Download, &entry.path).local_id(&entry.local_id);
                    match txn.queue().enqueue(download).await {
                        Ok(_) => queued += 1,
                        Err(QueueError::Conflict { seq, .. }) => {
                            debug!(path = %entry.path, blocking = seq, "offline download left to the pending record");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                debug!(path = %item.path, queued, "queued downloads for offline folder");
            }
            ActionKind::ClearOfflineAvailable => {
                txn.items().set_offline(&item.path, false).await?;
                let mut entries = txn.items().list_subtree(&item.path).await?;
                entries.push(item.clone());
                for entry in entries {
                    if entry.downloaded_etag.is_none() {
                        continue;
                    }
                    txn.items()
                        .set_downloaded_etag(&entry.local_id, None)
                        .await?;
                    if !entry.is_folder() {
                        stale.push(cache_path_for(self.vault.files_root(), &entry.path)?);
                    }
                }
            }
            _ => {}
        }
        let item = txn
            .items()
            .lookup_by_local_id(&item.local_id)
            .await?
            .unwrap_or(item);
        Ok(ActionOutput::with_item(item))
    }

    /// Routes a connection failure: retry with backoff, give up, or treat
    /// as done.
    pub(super) async fn apply_failure(
        &self,
        record: &SyncRecord,
        err: ConnectionError,
    ) -> Result<(), CoreError> {
        match err.class() {
            ErrorClass::Cancelled => self.settle_cancelled(record).await,
            ErrorClass::NotFound if record.kind == ActionKind::Delete => {
                debug!(seq = record.seq, path = %record.path, "already gone on the server");
                self.apply_success(record, Outcome::Remote(RemoteResponse::Removed))
                    .await
            }
            ErrorClass::Transient => {
                let attempt = record.attempt + 1;
                if attempt >= self.max_attempts {
                    let error = ActionError::new(
                        ErrorKind::from(&err),
                        format!("gave up after {attempt} attempts: {err}"),
                    );
                    return self.settle_needs_attention(record, error).await;
                }
                let delay = self.backoff.delay(record.attempt);
                let mut txn = self.vault.write().await?;
                txn.queue()
                    .schedule_retry(
                        record.seq,
                        attempt,
                        now_millis() + delay_millis(delay),
                        ErrorKind::from(&err),
                        &err.to_string(),
                    )
                    .await?;
                txn.commit().await?;
                warn!(
                    seq = record.seq,
                    kind = %record.kind,
                    path = %record.path,
                    attempt,
                    delay_ms = delay_millis(delay),
                    error = %err,
                    "transient failure; retrying later"
                );
                self.wake();
                Ok(())
            }
            _ => {
                self.settle_needs_attention(record, ActionError::from(&err))
                    .await
            }
        }
    }

    /// Parks a record for the user, undoing or correcting its optimistic
    /// change, and cascades to the records waiting on it.
    pub(super) async fn settle_needs_attention(
        &self,
        record: &SyncRecord,
        error: ActionError,
    ) -> Result<(), CoreError> {
        let mut txn = self.vault.write().await?;
        match &error.server_item {
            Some(current) => self.adopt_server_state(&mut txn, record, current).await?,
            None => self.revert_optimistic(&mut txn, record).await?,
        }
        txn.queue()
            .mark_needs_attention(record.seq, error.kind, &error.message)
            .await?;
        let cascaded = txn.queue().cascade_dependents(record, error.kind).await?;
        for dependent in &cascaded {
            self.revert_optimistic(&mut txn, dependent).await?;
        }
        txn.commit().await?;

        warn!(
            seq = record.seq,
            kind = %record.kind,
            path = %record.path,
            error = %error,
            cascaded = cascaded.len(),
            "sync record needs attention"
        );
        let mut parked = record.clone();
        parked.state = RecordState::NeedsUserAttention;
        parked.error_kind = Some(error.kind);
        parked.last_error = Some(error.message.clone());
        let waiting = self
            .activities
            .record_finished(record.seq, Err(error.clone()));
        if waiting == 0 {
            self.notify_error(&error);
        }
        self.notify_attention(&parked);
        for dependent in &cascaded {
            let message = dependent.last_error.clone().unwrap_or_default();
            self.activities.record_finished(
                dependent.seq,
                Err(ActionError::new(error.kind, message)),
            );
            self.notify_attention(dependent);
        }
        Ok(())
    }

    /// Replaces the optimistic state with what the server reported.
    async fn adopt_server_state(
        &self,
        txn: &mut WriteTxn<'_>,
        record: &SyncRecord,
        current: &ServerItem,
    ) -> Result<(), CoreError> {
        let (file_id, _) = identity(&record.payload);
        let same_entry = record.kind.creates_entry()
            || file_id.as_deref() == Some(current.file_id.as_str());
        if record.kind == ActionKind::Copy || !same_entry {
            self.revert_optimistic(txn, record).await?;
            txn.items().apply_server_item(current, None).await?;
        } else {
            txn.items()
                .apply_server_item(current, record.local_id.as_deref())
                .await?;
        }
        Ok(())
    }

    /// Undoes the change a command applied to the item store when it queued
    /// `record`.
    pub(super) async fn revert_optimistic(
        &self,
        txn: &mut WriteTxn<'_>,
        record: &SyncRecord,
    ) -> Result<(), CoreError> {
        match record.kind {
            kind if kind.creates_entry() => {
                let found = locate(txn.items(), record).await?;
                if let Some(item) = found
                    && item.local_only
                {
                    txn.items().remove_items(&[&item.path]).await?;
                }
            }
            ActionKind::Rename | ActionKind::Move => {
                let (Some(local_id), Some(dest)) =
                    (record.local_id.as_deref(), record.dest_path.as_deref())
                else {
                    return Ok(());
                };
                let Some(item) = txn.items().lookup_by_local_id(local_id).await? else {
                    return Ok(());
                };
                let origin_free = txn.items().lookup(&record.path).await?.is_none();
                if self.vault.case().eq(&item.path, dest) && origin_free {
                    txn.items().move_subtree(dest, &record.path).await?;
                }
            }
            ActionKind::SetOfflineAvailable | ActionKind::ClearOfflineAvailable => {
                let found = locate(txn.items(), record).await?;
                if let Some(item) = found {
                    let restore = record.kind == ActionKind::ClearOfflineAvailable;
                    txn.items().set_offline(&item.path, restore).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
