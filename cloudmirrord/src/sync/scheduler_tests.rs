use std::sync::Mutex as StdMutex;

use cloudmirror_core::{Bookmark, ConnectionError, ItemType, MemoryServer, ServerItem};

use super::*;
use crate::activity::ActionOutput;
use crate::core::CoreDelegate;
use crate::sync::item_store::Item;
use crate::sync::paths::PathCase;
use crate::sync::record::NewRecord;

struct Harness {
    server: Arc<MemoryServer>,
    vault: Arc<Vault>,
    activities: Arc<ActivityRegistry>,
    scheduler: Arc<SyncScheduler>,
}

fn test_config() -> CoreConfig {
    CoreConfig {
        max_attempts: 3,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        backoff_jitter: false,
        ..CoreConfig::default()
    }
}

async fn harness() -> Harness {
    harness_with(test_config()).await
}

async fn harness_with(config: CoreConfig) -> Harness {
    let server = Arc::new(MemoryServer::new());
    let vault = Arc::new(
        Vault::open_in_memory(&Bookmark::new("test"), PathCase::Sensitive)
            .await
            .unwrap(),
    );
    let activities = Arc::new(ActivityRegistry::new());
    let connection: Arc<dyn Connection> = server.clone();
    let scheduler = SyncScheduler::new(
        Arc::clone(&vault),
        connection,
        Arc::clone(&activities),
        &config,
    );
    Harness {
        server,
        vault,
        activities,
        scheduler,
    }
}

impl Harness {
    async fn mirror(&self, server: &ServerItem) -> Item {
        let mut txn = self.vault.write().await.unwrap();
        let item = txn.items().apply_server_item(server, None).await.unwrap();
        txn.commit().await.unwrap();
        item
    }

    /// Adds a placeholder and the record creating it, as a command would.
    async fn queue_create(&self, path: &str, item_type: ItemType) -> (Item, SyncRecord) {
        let kind = match item_type {
            ItemType::Folder => ActionKind::CreateFolder,
            ItemType::File => ActionKind::CreateFile,
        };
        let placeholder = Item::placeholder(path, item_type);
        let mut txn = self.vault.write().await.unwrap();
        txn.items().upsert_item(&placeholder).await.unwrap();
        let outcome = txn
            .queue()
            .enqueue(NewRecord::new(kind, path).local_id(&placeholder.local_id))
            .await
            .unwrap();
        txn.commit().await.unwrap();
        (placeholder, outcome.record)
    }

    async fn queue(&self, record: NewRecord) -> SyncRecord {
        let mut txn = self.vault.write().await.unwrap();
        let outcome = txn.queue().enqueue(record).await.unwrap();
        txn.commit().await.unwrap();
        outcome.record
    }

    async fn item(&self, path: &str) -> Option<Item> {
        let mut read = self.vault.read().await.unwrap();
        read.items().lookup(path).await.unwrap()
    }

    async fn record(&self, seq: i64) -> Option<SyncRecord> {
        let mut read = self.vault.read().await.unwrap();
        read.queue().get(seq).await.unwrap()
    }

    fn watch(&self, seq: i64) -> crate::activity::Activity {
        let ticket = self.activities.open();
        self.activities.attach(ticket.id(), seq);
        self.activities.seal(ticket.id());
        ticket.into_activity(vec![seq], Arc::downgrade(&self.scheduler))
    }
}

#[derive(Default)]
struct RecordingDelegate {
    errors: StdMutex<Vec<ActionError>>,
    parked: StdMutex<Vec<i64>>,
}

impl CoreDelegate for RecordingDelegate {
    fn handle_error(&self, error: &ActionError) {
        self.errors.lock().unwrap().push(error.clone());
    }

    fn record_needs_attention(&self, record: &SyncRecord) {
        self.parked.lock().unwrap().push(record.seq);
    }
}

#[tokio::test]
async fn create_adopts_the_placeholder_identity() {
    let h = harness().await;
    let (placeholder, record) = h.queue_create("/Docs", ItemType::Folder).await;
    let activity = h.watch(record.seq);

    assert_eq!(h.scheduler.run_until_idle().await.unwrap(), 1);

    let item = h.item("/Docs").await.unwrap();
    assert_eq!(item.local_id, placeholder.local_id);
    assert!(!item.local_only);
    assert_eq!(
        item.file_id.as_deref(),
        h.server.item("/Docs").map(|s| s.file_id).as_deref()
    );
    assert!(h.record(record.seq).await.is_none());
    let output = activity.wait().await.unwrap();
    assert_eq!(output.item.unwrap().local_id, placeholder.local_id);
}

#[tokio::test]
async fn transient_failures_retry_until_budget_is_spent() {
    let h = harness().await;
    for _ in 0..3 {
        h.server
            .fail_next(ConnectionError::TransientNetwork("link down".into()));
    }
    let (_, record) = h.queue_create("/Docs", ItemType::Folder).await;
    let activity = h.watch(record.seq);

    assert_eq!(h.scheduler.run_until_idle().await.unwrap(), 3);

    let parked = h.record(record.seq).await.unwrap();
    assert_eq!(parked.state, RecordState::NeedsUserAttention);
    assert_eq!(parked.error_kind, Some(ErrorKind::TransientNetwork));
    assert!(parked.last_error.unwrap().contains("gave up after 3 attempts"));
    assert!(h.item("/Docs").await.is_none(), "placeholder must be reverted");
    assert!(h.server.item("/Docs").is_none());
    // retries look for the earlier attempt's effect first
    assert_eq!(
        h.server.requests(),
        vec!["create_folder /Docs", "stat /Docs", "stat /Docs"]
    );
    assert_eq!(activity.wait().await.unwrap_err().kind, ErrorKind::TransientNetwork);
}

#[tokio::test]
async fn transient_failure_then_success() {
    let h = harness().await;
    h.server.fail_next(ConnectionError::Timeout);
    let (_, record) = h.queue_create("/a.txt", ItemType::File).await;

    assert_eq!(h.scheduler.run_until_idle().await.unwrap(), 2);
    assert!(h.record(record.seq).await.is_none());
    assert!(h.server.item("/a.txt").is_some());
    assert!(!h.item("/a.txt").await.unwrap().local_only);
}

#[tokio::test]
async fn timeout_after_the_server_committed_is_not_reissued() {
    let h = harness_with(CoreConfig {
        action_timeout: Duration::from_millis(100),
        ..test_config()
    })
    .await;
    let _gate = h.server.hold_next_commit();
    let (placeholder, record) = h.queue_create("/Docs", ItemType::Folder).await;
    let activity = h.watch(record.seq);

    assert_eq!(h.scheduler.run_until_idle().await.unwrap(), 2);

    assert_eq!(h.server.requests(), vec!["create_folder /Docs", "stat /Docs"]);
    assert!(h.record(record.seq).await.is_none());
    let item = h.item("/Docs").await.unwrap();
    assert_eq!(item.local_id, placeholder.local_id);
    assert!(!item.local_only);
    let output = activity.wait().await.unwrap();
    assert_eq!(output.item.unwrap().local_id, placeholder.local_id);
}

#[tokio::test]
async fn retry_after_a_lost_response_adopts_the_moved_entry() {
    let h = harness_with(CoreConfig {
        action_timeout: Duration::from_millis(100),
        ..test_config()
    })
    .await;
    let server_item = h.server.insert_folder("/a");
    let item = h.mirror(&server_item).await;
    let record = h
        .queue(
            NewRecord::new(ActionKind::Rename, "/a")
                .dest("/b")
                .local_id(&item.local_id)
                .payload(RecordPayload::Move {
                    file_id: item.file_id.clone(),
                    expected_etag: item.etag.clone(),
                }),
        )
        .await;
    {
        let mut txn = h.vault.write().await.unwrap();
        txn.items().move_subtree("/a", "/b").await.unwrap();
        txn.commit().await.unwrap();
    }
    let _gate = h.server.hold_next_commit();
    let activity = h.watch(record.seq);

    assert_eq!(h.scheduler.run_until_idle().await.unwrap(), 2);

    assert_eq!(h.server.paths(), vec!["/b".to_string()]);
    assert!(h.record(record.seq).await.is_none());
    let moved = h.item("/b").await.unwrap();
    assert_eq!(moved.local_id, item.local_id);
    assert!(activity.wait().await.is_ok());
}

#[tokio::test]
async fn delete_of_an_entry_already_gone_succeeds() {
    let h = harness().await;
    let server_item = h.server.insert_file("/gone.txt", b"x");
    let item = h.mirror(&server_item).await;
    h.server.remove("/gone.txt");

    let record = h
        .queue(
            NewRecord::new(ActionKind::Delete, "/gone.txt")
                .local_id(&item.local_id)
                .payload(RecordPayload::Delete {
                    file_id: item.file_id.clone(),
                    expected_etag: item.etag.clone(),
                }),
        )
        .await;
    let activity = h.watch(record.seq);

    h.scheduler.run_until_idle().await.unwrap();
    assert!(h.item("/gone.txt").await.is_none());
    assert_eq!(activity.wait().await.unwrap(), ActionOutput::default());
}

#[tokio::test]
async fn conflicting_rename_adopts_the_server_location() {
    let h = harness().await;
    let server_item = h.server.insert_folder("/a");
    let item = h.mirror(&server_item).await;
    // another client moved it first
    h.server.rename_remote("/a", "/x").unwrap();

    let mut txn = h.vault.write().await.unwrap();
    let record = txn
        .queue()
        .enqueue(
            NewRecord::new(ActionKind::Rename, "/a")
                .dest("/b")
                .local_id(&item.local_id)
                .payload(RecordPayload::Move {
                    file_id: item.file_id.clone(),
                    expected_etag: item.etag.clone(),
                }),
        )
        .await
        .unwrap()
        .record;
    txn.items().move_subtree("/a", "/b").await.unwrap();
    txn.commit().await.unwrap();
    let activity = h.watch(record.seq);

    h.scheduler.run_until_idle().await.unwrap();

    assert!(h.item("/b").await.is_none());
    assert_eq!(h.item("/x").await.unwrap().local_id, item.local_id);
    let parked = h.record(record.seq).await.unwrap();
    assert_eq!(parked.state, RecordState::NeedsUserAttention);
    assert_eq!(parked.error_kind, Some(ErrorKind::Conflict));
    let err = activity.wait().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
    assert_eq!(err.server_item.unwrap().path, "/x");
}

#[tokio::test]
async fn permanent_failure_cascades_to_dependent_records() {
    let h = harness().await;
    h.server.fail_next(ConnectionError::QuotaExceeded);
    let (_, parent) = h.queue_create("/a", ItemType::Folder).await;
    let (_, child) = h.queue_create("/a/b", ItemType::Folder).await;
    let child_activity = h.watch(child.seq);

    assert_eq!(h.scheduler.run_until_idle().await.unwrap(), 1);

    for seq in [parent.seq, child.seq] {
        let record = h.record(seq).await.unwrap();
        assert_eq!(record.state, RecordState::NeedsUserAttention);
        assert_eq!(record.error_kind, Some(ErrorKind::QuotaExceeded));
    }
    assert!(h.item("/a").await.is_none());
    assert!(h.item("/a/b").await.is_none());
    assert_eq!(
        child_activity.wait().await.unwrap_err().kind,
        ErrorKind::QuotaExceeded
    );
    assert!(h.server.paths().is_empty());
}

#[tokio::test]
async fn cancelling_a_waiting_record_undoes_it() {
    let h = harness().await;
    let (_, record) = h.queue_create("/Docs", ItemType::Folder).await;
    let activity = h.watch(record.seq);

    h.scheduler.cancel_activity(activity.id()).await.unwrap();

    assert!(h.record(record.seq).await.is_none());
    assert!(h.item("/Docs").await.is_none());
    assert_eq!(activity.wait().await.unwrap_err().kind, ErrorKind::Cancelled);
    assert_eq!(h.scheduler.run_until_idle().await.unwrap(), 0);
    assert!(h.server.requests().is_empty());
}

#[tokio::test]
async fn interrupted_create_is_not_issued_twice() {
    let h = harness().await;
    let (placeholder, record) = h.queue_create("/Docs", ItemType::Folder).await;
    {
        // the previous process sent the request and died before settling
        let mut txn = h.vault.write().await.unwrap();
        txn.queue().dequeue_next(i64::MAX).await.unwrap().unwrap();
        txn.queue()
            .mark_state(record.seq, RecordState::Executing)
            .await
            .unwrap();
        txn.queue().recover_interrupted().await.unwrap();
        txn.commit().await.unwrap();
    }
    h.server.insert_folder("/Docs");

    assert_eq!(h.scheduler.run_until_idle().await.unwrap(), 1);

    assert!(
        !h.server
            .requests()
            .iter()
            .any(|request| request.starts_with("create_folder"))
    );
    let item = h.item("/Docs").await.unwrap();
    assert_eq!(item.local_id, placeholder.local_id);
    assert!(!item.local_only);
}

#[tokio::test]
async fn unattended_failure_reaches_the_delegate() {
    let h = harness().await;
    let recorder = Arc::new(RecordingDelegate::default());
    let delegate: Arc<dyn CoreDelegate> = recorder.clone();
    h.scheduler.set_delegate(Some(&delegate));
    h.server.set_authorized(false);
    let (_, record) = h.queue_create("/Docs", ItemType::Folder).await;

    h.scheduler.run_until_idle().await.unwrap();

    let errors = recorder.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::Unauthorized);
    assert_eq!(*recorder.parked.lock().unwrap(), vec![record.seq]);
}

#[tokio::test]
async fn dropped_delegate_is_not_called() {
    let h = harness().await;
    let recorder = Arc::new(RecordingDelegate::default());
    {
        let delegate: Arc<dyn CoreDelegate> = recorder.clone();
        h.scheduler.set_delegate(Some(&delegate));
    }
    h.server.set_authorized(false);
    h.queue_create("/Docs", ItemType::Folder).await;

    h.scheduler.run_until_idle().await.unwrap();
    assert!(recorder.errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn records_on_related_paths_run_in_order() {
    let h = harness().await;
    h.queue_create("/a", ItemType::Folder).await;
    h.queue_create("/a/b.txt", ItemType::File).await;
    h.queue_create("/c", ItemType::Folder).await;

    assert_eq!(h.scheduler.run_until_idle().await.unwrap(), 3);
    assert_eq!(
        h.server.requests(),
        vec!["create_folder /a", "create_file /a/b.txt", "create_folder /c"]
    );
}

#[tokio::test]
async fn background_worker_drains_the_queue() {
    let h = harness().await;
    h.scheduler.start();
    let (_, record) = h.queue_create("/Docs", ItemType::Folder).await;
    let activity = h.watch(record.seq);
    h.scheduler.wake();

    let result = tokio::time::timeout(Duration::from_secs(5), activity.wait())
        .await
        .unwrap();
    assert!(result.is_ok());
    h.scheduler.shutdown().await;
    assert_eq!(h.scheduler.in_flight(), 0);
    assert!(h.server.item("/Docs").is_some());
}
