//! Caller-facing façade over one bookmark's vault.
//!
//! Every command validates its input, applies its optimistic change and
//! queues its sync records in a single write transaction, then hands back an
//! [`Activity`] that completes once those records are settled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloudmirror_core::{Bookmark, Connection, ItemType, ShareOptions};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{
    ActionOutput, Activity, ActivityId, ActivityRegistry, ActivityResult, ActivityTicket,
};
use crate::config::CoreConfig;
use crate::error::{ActionError, CoreError, ErrorKind};
use crate::query::{Query, QueryEngine, QueryHandle, QueryId};
use crate::sync::action_queue::{ActionQueue, Disposition};
use crate::sync::item_store::{Item, ItemStore};
use crate::sync::paths::{
    file_name, is_same_or_descendant, join, normalize_remote_path, parent_path, validate_name,
};
use crate::sync::record::{ActionKind, NewRecord, RecordPayload, SyncRecord};
use crate::sync::scheduler::{SyncScheduler, discard_staged, remove_staged};
use crate::sync::vault::{Vault, WriteTxn};

/// Receives notifications nobody else is waiting for.
pub trait CoreDelegate: Send + Sync {
    /// A failure with no activity left to report it, such as a background
    /// reconciliation or a retried record.
    fn handle_error(&self, error: &ActionError);

    fn record_needs_attention(&self, record: &SyncRecord);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Replace an entry already at the destination.
    pub overwrite_existing: bool,
    /// Name at the destination; defaults to the source name.
    pub new_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Remote name; defaults to the source file name.
    pub name: Option<String>,
    pub replace_existing: bool,
}

pub struct Core {
    vault: Arc<Vault>,
    connection: Arc<dyn Connection>,
    activities: Arc<ActivityRegistry>,
    scheduler: Arc<SyncScheduler>,
    queries: QueryEngine,
    config: CoreConfig,
}

impl Core {
    /// Opens the persistent vault of `bookmark` under `config.vault_root`.
    /// Records interrupted by an earlier shutdown resume once the core is
    /// started.
    pub async fn open(
        bookmark: &Bookmark,
        connection: Arc<dyn Connection>,
        config: CoreConfig,
    ) -> Result<Self, CoreError> {
        let vault = Vault::open(&config.vault_root, bookmark, config.path_case()).await?;
        Ok(Self::assemble(vault, connection, config))
    }

    pub async fn open_in_memory(
        bookmark: &Bookmark,
        connection: Arc<dyn Connection>,
        config: CoreConfig,
    ) -> Result<Self, CoreError> {
        let vault = Vault::open_in_memory(bookmark, config.path_case()).await?;
        Ok(Self::assemble(vault, connection, config))
    }

    fn assemble(vault: Vault, connection: Arc<dyn Connection>, config: CoreConfig) -> Self {
        let vault = Arc::new(vault);
        let activities = Arc::new(ActivityRegistry::new());
        let scheduler = SyncScheduler::new(
            Arc::clone(&vault),
            Arc::clone(&connection),
            Arc::clone(&activities),
            &config,
        );
        let queries = QueryEngine::new(Arc::clone(&vault));
        Self {
            vault,
            connection,
            activities,
            scheduler,
            queries,
            config,
        }
    }

    /// Starts executing queued records in the background.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Refuses new commands, stops every query, drains the scheduler and
    /// closes the vault. Activities still outstanding complete with
    /// `Closed`; their records stay queued for the next open.
    pub async fn close(&self) {
        self.vault.begin_drain();
        self.queries.stop_all();
        self.scheduler.shutdown().await;
        self.activities.fail_all(ActionError::new(
            ErrorKind::Closed,
            "core closed before the activity completed",
        ));
        self.vault.close().await;
        info!(bookmark = %self.vault.bookmark(), "core closed");
    }

    pub fn bookmark(&self) -> &Bookmark {
        self.vault.bookmark()
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Registers the delegate without keeping it alive; `None` unregisters.
    pub fn set_delegate(&self, delegate: Option<&Arc<dyn CoreDelegate>>) {
        self.scheduler.set_delegate(delegate);
    }

    pub async fn create_folder(&self, parent: &str, name: &str) -> Result<Activity, CoreError> {
        self.create_entry(parent, name, ItemType::Folder).await
    }

    pub async fn create_empty_file(&self, parent: &str, name: &str) -> Result<Activity, CoreError> {
        self.create_entry(parent, name, ItemType::File).await
    }

    async fn create_entry(
        &self,
        parent: &str,
        name: &str,
        item_type: ItemType,
    ) -> Result<Activity, CoreError> {
        validate_name(name)?;
        let parent = normalize_remote_path(parent)?;
        let path = join(&parent, name);
        let kind = match item_type {
            ItemType::Folder => ActionKind::CreateFolder,
            ItemType::File => ActionKind::CreateFile,
        };

        let mut batch = CommandBatch::begin(self).await?;
        require_folder(batch.items(), &parent).await?;
        require_vacant(batch.items(), &path).await?;
        let placeholder = Item::placeholder(&path, item_type);
        batch.items().upsert_item(&placeholder).await?;
        batch
            .enqueue(NewRecord::new(kind, &path).local_id(&placeholder.local_id))
            .await?;
        info!(path = %path, kind = %kind, "create queued");
        batch.commit().await
    }

    pub async fn rename(&self, path: &str, new_name: &str) -> Result<Activity, CoreError> {
        validate_name(new_name)?;
        let path = normalize_remote_path(path)?;
        let Some(parent) = parent_path(&path) else {
            return Err(CoreError::validation("the root folder cannot be renamed"));
        };
        let dest = join(&parent, new_name);
        self.relocate(ActionKind::Rename, path, dest).await
    }

    /// Moves `path` into the folder `new_parent`, keeping its name.
    pub async fn move_item(&self, path: &str, new_parent: &str) -> Result<Activity, CoreError> {
        let path = normalize_remote_path(path)?;
        let new_parent = normalize_remote_path(new_parent)?;
        if path == "/" {
            return Err(CoreError::validation("the root folder cannot be moved"));
        }
        let dest = join(&new_parent, file_name(&path));
        self.relocate(ActionKind::Move, path, dest).await
    }

    async fn relocate(
        &self,
        kind: ActionKind,
        from: String,
        dest: String,
    ) -> Result<Activity, CoreError> {
        let case = self.vault.case();
        let mut batch = CommandBatch::begin(self).await?;
        let item = require_item(batch.items(), &from).await?;
        if dest == item.path {
            batch.complete_now(Ok(ActionOutput::with_item(item)));
            return batch.commit().await;
        }
        if is_same_or_descendant(&dest, &item.path, case) && !case.eq(&dest, &item.path) {
            return Err(CoreError::validation(format!(
                "cannot move {} into itself",
                item.path
            )));
        }
        if let Some(parent) = parent_path(&dest) {
            require_folder(batch.items(), &parent).await?;
        }
        let occupant = batch.items().lookup(&dest).await?;
        if occupant.is_some_and(|other| other.local_id != item.local_id) {
            return Err(CoreError::validation(format!("{dest} already exists")));
        }
        // queued records below the item still name its current location
        let related = batch.queue().open_records_related_to(&item.path).await?;
        if let Some(blocking) = related.iter().find(|record| {
            record.paths().any(|target| {
                is_same_or_descendant(target, &item.path, case) && !case.eq(target, &item.path)
            })
        }) {
            return Err(CoreError::Conflict {
                seq: blocking.seq,
                kind: blocking.kind,
                path: blocking.path.clone(),
            });
        }

        let record = NewRecord::new(kind, &item.path)
            .dest(&dest)
            .local_id(&item.local_id)
            .payload(RecordPayload::Move {
                file_id: item.file_id.clone(),
                expected_etag: item.etag.clone(),
            });
        batch.enqueue(record).await?;
        batch.items().move_subtree(&item.path, &dest).await?;
        info!(from = %item.path, to = %dest, kind = %kind, "move queued");
        batch.commit().await
    }

    /// Copies `path` into the folder `dest_parent`. The copy shows up once
    /// the server created it.
    pub async fn copy_item(
        &self,
        path: &str,
        dest_parent: &str,
        options: CopyOptions,
    ) -> Result<Activity, CoreError> {
        let path = normalize_remote_path(path)?;
        if path == "/" {
            return Err(CoreError::validation("the root folder cannot be copied"));
        }
        let dest_parent = normalize_remote_path(dest_parent)?;
        let name = match &options.new_name {
            Some(name) => name.clone(),
            None => file_name(&path).to_string(),
        };
        validate_name(&name)?;
        let dest = join(&dest_parent, &name);
        if is_same_or_descendant(&dest, &path, self.vault.case()) {
            return Err(CoreError::validation(format!("cannot copy {path} into itself")));
        }

        let mut batch = CommandBatch::begin(self).await?;
        let item = require_item(batch.items(), &path).await?;
        require_folder(batch.items(), &dest_parent).await?;
        if !options.overwrite_existing {
            require_vacant(batch.items(), &dest).await?;
        }
        let record = NewRecord::new(ActionKind::Copy, &item.path)
            .dest(&dest)
            .local_id(&item.local_id)
            .payload(RecordPayload::Copy {
                overwrite: options.overwrite_existing,
            });
        batch.enqueue(record).await?;
        info!(from = %item.path, to = %dest, "copy queued");
        batch.commit().await
    }

    pub async fn delete(&self, path: &str) -> Result<Activity, CoreError> {
        self.delete_items(&[path]).await
    }

    /// Deletes several entries under one activity. Entries the server never
    /// saw are dropped locally together with their queued creation.
    pub async fn delete_items(&self, paths: &[&str]) -> Result<Activity, CoreError> {
        if paths.is_empty() {
            return Err(CoreError::validation("nothing to delete"));
        }
        let case = self.vault.case();
        let mut requested = paths
            .iter()
            .map(|path| normalize_remote_path(path))
            .collect::<Result<Vec<_>, _>>()?;
        if requested.iter().any(|path| path == "/") {
            return Err(CoreError::validation("the root folder cannot be deleted"));
        }
        // ancestors first, so nested entries fold into them
        requested.sort_by_key(String::len);
        let mut targets: Vec<String> = Vec::with_capacity(requested.len());
        for path in requested {
            if !targets
                .iter()
                .any(|target| is_same_or_descendant(&path, target, case))
            {
                targets.push(path);
            }
        }

        let mut batch = CommandBatch::begin(self).await?;
        for path in &targets {
            let item = require_item(batch.items(), path).await?;
            if item.local_only {
                batch.discard_local(&item).await?;
                continue;
            }
            let record = NewRecord::new(ActionKind::Delete, &item.path)
                .local_id(&item.local_id)
                .payload(RecordPayload::Delete {
                    file_id: item.file_id.clone(),
                    expected_etag: item.etag.clone(),
                });
            batch.enqueue(record).await?;
        }
        info!(count = targets.len(), "delete queued");
        batch.commit().await
    }

    /// Uploads the file at `source` into the folder `parent`. The content is
    /// staged inside the vault first, so later changes to `source` do not
    /// affect the queued upload.
    pub async fn upload(
        &self,
        source: &Path,
        parent: &str,
        options: UploadOptions,
    ) -> Result<Activity, CoreError> {
        let name = match options.name.clone() {
            Some(name) => name,
            None => source
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    CoreError::validation(format!("{} has no usable file name", source.display()))
                })?,
        };
        validate_name(&name)?;
        let parent = normalize_remote_path(parent)?;
        let path = join(&parent, &name);
        self.vault.ensure_accepting()?;

        let content = tokio::fs::read(source).await.map_err(|err| {
            CoreError::validation(format!("cannot read {}: {err}", source.display()))
        })?;
        let checksum = format!("{:x}", md5::compute(&content));
        let staged = self.vault.staging_root().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(self.vault.staging_root()).await?;
        tokio::fs::write(&staged, &content).await?;

        let queued = self
            .queue_upload(
                &parent,
                &path,
                StagedUpload {
                    source: staged.clone(),
                    checksum,
                    size: i64::try_from(content.len()).unwrap_or(i64::MAX),
                },
                options.replace_existing,
            )
            .await;
        if queued.is_err() {
            remove_staged(self.vault.staging_root(), &staged).await;
        }
        queued
    }

    async fn queue_upload(
        &self,
        parent: &str,
        path: &str,
        staged: StagedUpload,
        replace_existing: bool,
    ) -> Result<Activity, CoreError> {
        let mut batch = CommandBatch::begin(self).await?;
        require_folder(batch.items(), parent).await?;
        let (local_id, expected_etag) = match batch.items().lookup(path).await? {
            Some(item) if item.is_folder() => {
                return Err(CoreError::validation(format!("{path} is a folder")));
            }
            Some(_) if !replace_existing => {
                return Err(CoreError::validation(format!("{path} already exists")));
            }
            Some(item) => (item.local_id, item.etag),
            None => {
                let mut placeholder = Item::placeholder(path, ItemType::File);
                placeholder.size = Some(staged.size);
                placeholder.checksum = Some(staged.checksum.clone());
                batch.items().upsert_item(&placeholder).await?;
                (placeholder.local_id, None)
            }
        };
        let record = NewRecord::new(ActionKind::Upload, path)
            .local_id(&local_id)
            .payload(RecordPayload::Upload {
                source: staged.source,
                checksum: staged.checksum,
                expected_etag,
            });
        batch.enqueue(record).await?;
        info!(path, bytes = staged.size, "upload queued");
        batch.commit().await
    }

    /// Fetches the file into the vault's download area. The local path is
    /// reported through [`ActionOutput::local_path`].
    pub async fn download(&self, path: &str) -> Result<Activity, CoreError> {
        let path = normalize_remote_path(path)?;
        let mut batch = CommandBatch::begin(self).await?;
        let item = require_file(batch.items(), &path).await?;
        batch
            .enqueue(NewRecord::new(ActionKind::Download, &item.path).local_id(&item.local_id))
            .await?;
        batch.commit().await
    }

    pub async fn retrieve_thumbnail(&self, path: &str, max_size: u32) -> Result<Activity, CoreError> {
        if max_size == 0 {
            return Err(CoreError::validation("thumbnail size must be positive"));
        }
        let path = normalize_remote_path(path)?;
        let mut batch = CommandBatch::begin(self).await?;
        let item = require_file(batch.items(), &path).await?;
        let record = NewRecord::new(ActionKind::RetrieveThumbnail, &item.path)
            .local_id(&item.local_id)
            .payload(RecordPayload::Thumbnail { max_size });
        batch.enqueue(record).await?;
        batch.commit().await
    }

    pub async fn share(&self, path: &str, options: ShareOptions) -> Result<Activity, CoreError> {
        let path = normalize_remote_path(path)?;
        let mut batch = CommandBatch::begin(self).await?;
        let item = require_item(batch.items(), &path).await?;
        let record = NewRecord::new(ActionKind::ShareCreate, &item.path)
            .local_id(&item.local_id)
            .payload(RecordPayload::Share { options });
        batch.enqueue(record).await?;
        batch.commit().await
    }

    /// Keeps a local copy of the item (and, for folders, everything below
    /// it) in the download area.
    pub async fn set_offline_available(&self, path: &str) -> Result<Activity, CoreError> {
        self.mark_offline(path, true).await
    }

    pub async fn clear_offline_available(&self, path: &str) -> Result<Activity, CoreError> {
        self.mark_offline(path, false).await
    }

    async fn mark_offline(&self, path: &str, offline: bool) -> Result<Activity, CoreError> {
        let path = normalize_remote_path(path)?;
        let kind = if offline {
            ActionKind::SetOfflineAvailable
        } else {
            ActionKind::ClearOfflineAvailable
        };
        let mut batch = CommandBatch::begin(self).await?;
        let item = require_item(batch.items(), &path).await?;
        batch.items().set_offline(&item.path, offline).await?;
        batch
            .enqueue(NewRecord::new(kind, &item.path).local_id(&item.local_id))
            .await?;
        batch.commit().await
    }

    /// Reconciles the item store with the full server listing in the
    /// background. Failures reach the activity and the delegate.
    pub fn synchronize_with_server(&self) -> Result<Activity, CoreError> {
        self.vault.ensure_accepting()?;
        let ticket = self.activities.open();
        let id = ticket.id();
        let cancel = ticket.cancel_token();
        let vault = Arc::clone(&self.vault);
        let connection = Arc::clone(&self.connection);
        let activities = Arc::clone(&self.activities);
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move {
            match crate::sync::reconcile(&vault, connection.as_ref(), &activities, id, &cancel).await {
                Ok(report) => {
                    activities.complete_immediately(id, Ok(ActionOutput::default()));
                    if report.repairs > 0 {
                        scheduler.wake();
                    }
                }
                Err(err) if err.is_corruption() => scheduler.storage_corrupted(&err).await,
                Err(err) => {
                    let error = err.to_action_error();
                    if error.kind != ErrorKind::Cancelled {
                        warn!(activity = %id, error = %error, "reconciliation failed");
                        scheduler.notify_error(&error);
                    }
                    activities.complete_immediately(id, Err(error));
                }
            }
            activities.seal(id);
        });
        Ok(ticket.into_activity(Vec::new(), Arc::downgrade(&self.scheduler)))
    }

    pub async fn start_query(&self, query: Query) -> Result<QueryHandle, CoreError> {
        self.vault.ensure_accepting()?;
        self.queries.start_query(query).await
    }

    pub fn stop_query(&self, id: QueryId) {
        self.queries.stop_query(id);
    }

    pub async fn item_at(&self, path: &str) -> Result<Option<Item>, CoreError> {
        let path = normalize_remote_path(path)?;
        let mut read = self.vault.read().await?;
        Ok(read.items().lookup(&path).await?)
    }

    pub async fn list_folder(&self, path: &str) -> Result<Vec<Item>, CoreError> {
        let path = normalize_remote_path(path)?;
        let mut read = self.vault.read().await?;
        Ok(read.items().list_children(&path).await?)
    }

    /// Every record still in the queue, including the ones that need
    /// attention.
    pub async fn sync_records(&self) -> Result<Vec<SyncRecord>, CoreError> {
        let mut read = self.vault.read().await?;
        Ok(read.queue().list().await?)
    }

    pub async fn records_needing_attention(&self) -> Result<Vec<SyncRecord>, CoreError> {
        let mut read = self.vault.read().await?;
        Ok(read.queue().list_needing_attention().await?)
    }

    /// Puts a record that needs attention back in the queue with a fresh
    /// retry budget.
    pub async fn retry_record(&self, seq: i64) -> Result<SyncRecord, CoreError> {
        self.vault.ensure_accepting()?;
        let mut txn = self.vault.write().await?;
        let record = txn
            .queue()
            .retry(seq)
            .await?
            .ok_or(CoreError::RecordNotFound(seq))?;
        txn.commit().await?;
        info!(seq, kind = %record.kind, path = %record.path, "sync record re-armed");
        self.scheduler.wake();
        Ok(record)
    }

    /// Drops a record that needs attention.
    pub async fn dismiss_record(&self, seq: i64) -> Result<SyncRecord, CoreError> {
        let mut txn = self.vault.write().await?;
        let record = txn
            .queue()
            .dismiss(seq)
            .await?
            .ok_or(CoreError::RecordNotFound(seq))?;
        txn.commit().await?;
        discard_staged(&self.vault, &record.payload).await;
        info!(seq, kind = %record.kind, path = %record.path, "sync record dismissed");
        Ok(record)
    }
}

struct StagedUpload {
    source: PathBuf,
    checksum: String,
    size: i64,
}

/// Forgets the activity of a command that never committed.
struct AbandonOnDrop<'c> {
    registry: &'c ActivityRegistry,
    id: ActivityId,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.abandon(self.id);
        }
    }
}

/// One command's write transaction together with the activity its records
/// report to.
///
/// Records are attached to the activity while the writer lock is held, so
/// the scheduler cannot settle them before anyone listens.
struct CommandBatch<'c> {
    core: &'c Core,
    txn: WriteTxn<'c>,
    ticket: ActivityTicket,
    guard: AbandonOnDrop<'c>,
    records: Vec<i64>,
    superseded: Vec<SyncRecord>,
    annulled: Vec<SyncRecord>,
    immediate: Vec<ActivityResult>,
    discard: Vec<RecordPayload>,
}

impl<'c> CommandBatch<'c> {
    async fn begin(core: &'c Core) -> Result<Self, CoreError> {
        core.vault.ensure_accepting()?;
        let txn = core.vault.write().await?;
        let ticket = core.activities.open();
        let guard = AbandonOnDrop {
            registry: &core.activities,
            id: ticket.id(),
            armed: true,
        };
        Ok(Self {
            core,
            txn,
            ticket,
            guard,
            records: Vec::new(),
            superseded: Vec::new(),
            annulled: Vec::new(),
            immediate: Vec::new(),
            discard: Vec::new(),
        })
    }

    fn items(&mut self) -> ItemStore<'_> {
        self.txn.items()
    }

    fn queue(&mut self) -> ActionQueue<'_> {
        self.txn.queue()
    }

    async fn enqueue(&mut self, record: NewRecord) -> Result<SyncRecord, CoreError> {
        let id = self.ticket.id();
        let outcome = self.txn.queue().enqueue(record.activity(id)).await?;
        match outcome.disposition {
            Disposition::Annulled => {
                self.immediate.push(Ok(ActionOutput::default()));
                self.annulled.push(outcome.record.clone());
            }
            Disposition::Inserted | Disposition::Coalesced => {
                self.core.activities.attach(id, outcome.record.seq);
                if !self.records.contains(&outcome.record.seq) {
                    self.records.push(outcome.record.seq);
                }
            }
        }
        self.superseded.extend(outcome.superseded);
        self.discard.extend(outcome.replaced_payload);
        Ok(outcome.record)
    }

    fn complete_now(&mut self, result: ActivityResult) {
        self.immediate.push(result);
    }

    /// Drops an entry the server never saw, together with the waiting
    /// records that would have created it.
    async fn discard_local(&mut self, item: &Item) -> Result<(), CoreError> {
        let case = self.core.vault.case();
        let related = self.queue().open_records_related_to(&item.path).await?;
        // an entry moved in from elsewhere would be lost with the folder
        if let Some(blocking) = related.iter().find(|record| {
            !is_same_or_descendant(&record.path, &item.path, case)
                && record
                    .paths()
                    .any(|target| is_same_or_descendant(target, &item.path, case))
        }) {
            return Err(CoreError::Conflict {
                seq: blocking.seq,
                kind: blocking.kind,
                path: blocking.path.clone(),
            });
        }
        let mut entries = self.items().list_subtree(&item.path).await?;
        entries.push(item.clone());
        for entry in &entries {
            let removed = self.queue().supersede_path(&entry.path).await?;
            self.superseded.extend(removed);
        }
        self.items().remove_items(&[&item.path]).await?;
        debug!(path = %item.path, entries = entries.len(), "dropped local-only entry");
        self.complete_now(Ok(ActionOutput::default()));
        Ok(())
    }

    async fn commit(self) -> Result<Activity, CoreError> {
        let CommandBatch {
            core,
            txn,
            ticket,
            mut guard,
            records,
            superseded,
            annulled,
            immediate,
            discard,
        } = self;
        txn.commit().await?;
        guard.armed = false;

        let id = ticket.id();
        for record in &superseded {
            core.activities
                .record_finished(record.seq, Err(ActionError::cancelled()));
            discard_staged(&core.vault, &record.payload).await;
            debug!(seq = record.seq, kind = %record.kind, path = %record.path, "sync record superseded");
        }
        for record in &annulled {
            core.activities
                .record_finished(record.seq, Ok(ActionOutput::default()));
        }
        for payload in &discard {
            discard_staged(&core.vault, payload).await;
        }
        for result in immediate {
            core.activities.complete_immediately(id, result);
        }
        core.activities.seal(id);
        if !records.is_empty() {
            core.scheduler.wake();
        }
        Ok(ticket.into_activity(records, Arc::downgrade(&core.scheduler)))
    }
}

async fn require_item(mut items: ItemStore<'_>, path: &str) -> Result<Item, CoreError> {
    items
        .lookup(path)
        .await?
        .ok_or_else(|| CoreError::NotFound(path.to_string()))
}

async fn require_file(items: ItemStore<'_>, path: &str) -> Result<Item, CoreError> {
    let item = require_item(items, path).await?;
    if item.is_folder() {
        return Err(CoreError::validation(format!("{path} is a folder")));
    }
    Ok(item)
}

async fn require_folder(mut items: ItemStore<'_>, path: &str) -> Result<(), CoreError> {
    if path == "/" {
        return Ok(());
    }
    match items.lookup(path).await? {
        Some(item) if item.is_folder() => Ok(()),
        Some(_) => Err(CoreError::validation(format!("{path} is not a folder"))),
        None => Err(CoreError::NotFound(path.to_string())),
    }
}

async fn require_vacant(mut items: ItemStore<'_>, path: &str) -> Result<(), CoreError> {
    if items.lookup(path).await?.is_some() {
        return Err(CoreError::validation(format!("{path} already exists")));
    }
    Ok(())
}

#[cfg(test)]
#[path = "core_tests.rs"]
mod tests;
