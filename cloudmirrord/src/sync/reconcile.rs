use std::collections::HashSet;

use cloudmirror_core::{Connection, ConnectionError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::action_queue::QueueError;
use super::paths::{cache_path_for, is_same_or_descendant, paths_related};
use super::record::{ActionKind, NewRecord, SyncRecord};
use super::scheduler::remove_cached;
use super::vault::Vault;
use crate::activity::{ActivityId, ActivityRegistry};
use crate::error::{ActionError, CoreError, ErrorKind};

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub moved: usize,
    pub removed: usize,
    /// Entries left alone because a queued record still targets them.
    pub skipped: usize,
    /// Downloads queued to refresh stale offline copies.
    pub repairs: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Diffs the full server listing against the item store and repairs drift in
/// one transaction. Repair downloads are attached to `activity`.
pub(crate) async fn reconcile(
    vault: &Vault,
    connection: &dyn Connection,
    activities: &ActivityRegistry,
    activity: ActivityId,
    cancel: &CancellationToken,
) -> Result<ReconcileReport, CoreError> {
    if cancel.is_cancelled() {
        return Err(ConnectionError::Cancelled.into());
    }
    let mut listing = tokio::select! {
        _ = cancel.cancelled() => return Err(ConnectionError::Cancelled.into()),
        listing = connection.list_tree("/") => listing?,
    };
    // parents before children so folder moves carry their contents first
    listing.sort_by(|a, b| a.path.cmp(&b.path));

    let case = vault.case();
    let mut report = ReconcileReport::default();
    let mut stale = Vec::new();
    let mut txn = vault.write().await?;
    let open = txn.queue().list_non_terminal().await?;
    let claimed_by_record = |path: &str| {
        open.iter()
            .any(|record| record.paths().any(|target| is_same_or_descendant(path, target, case)))
    };

    let mut seen: HashSet<String> = HashSet::new();
    for server in &listing {
        let known = txn.items().lookup_by_file_id(&server.file_id).await?;
        if claimed_by_record(&server.path)
            || known.as_ref().is_some_and(|item| claimed_by_record(&item.path))
        {
            report.skipped += 1;
            if let Some(item) = known {
                seen.insert(item.local_id);
            } else if let Some(item) = txn.items().lookup(&server.path).await? {
                seen.insert(item.local_id);
            }
            continue;
        }
        match known {
            Some(existing) => {
                if !existing.differs_from(server) {
                    seen.insert(existing.local_id);
                    continue;
                }
                let moved = !case.eq(&existing.path, &server.path);
                let item = txn
                    .items()
                    .apply_server_item(server, Some(&existing.local_id))
                    .await?;
                if moved {
                    debug!(from = %existing.path, to = %server.path, "item moved on the server");
                    report.moved += 1;
                } else {
                    report.updated += 1;
                }
                seen.insert(item.local_id);
            }
            None => {
                let item = txn.items().apply_server_item(server, None).await?;
                report.inserted += 1;
                seen.insert(item.local_id);
            }
        }
    }

    let listed: HashSet<&str> = listing.iter().map(|item| item.file_id.as_str()).collect();
    for item in txn.items().list_all().await? {
        if item.local_only || seen.contains(&item.local_id) {
            continue;
        }
        if item
            .file_id
            .as_deref()
            .is_some_and(|file_id| listed.contains(file_id))
        {
            continue;
        }
        if open
            .iter()
            .any(|record| record.paths().any(|target| paths_related(&item.path, target, case)))
        {
            report.skipped += 1;
            continue;
        }
        let removed = txn.items().remove_items(&[&item.path]).await?;
        if removed > 0 {
            report.removed += removed as usize;
            stale.push(cache_path_for(vault.files_root(), &item.path)?);
        }
    }

    let mut repairs = Vec::new();
    for item in txn.items().list_all().await? {
        if !item.offline || item.is_folder() || item.local_only {
            continue;
        }
        if item.downloaded_etag.is_some() && item.downloaded_etag == item.etag {
            continue;
        }
        if claimed_by_record(&item.path) {
            continue;
        }
        let download = NewRecord::new(ActionKind::Download, &item.path)
            .local_id(&item.local_id)
            .activity(activity);
        match txn.queue().enqueue(download).await {
            Ok(outcome) => repairs.push(outcome.record),
            Err(QueueError::Conflict { seq, .. }) => {
                debug!(path = %item.path, blocking = seq, "repair download deferred");
                report.skipped += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
    report.repairs = repairs.len();
    for record in &repairs {
        activities.attach(activity, record.seq);
    }
    if let Err(err) = txn.commit().await {
        detach_repairs(activities, activity, &repairs);
        return Err(err.into());
    }

    for path in &stale {
        remove_cached(path).await;
    }
    info!(
        bookmark = %vault.bookmark(),
        inserted = report.inserted,
        updated = report.updated,
        moved = report.moved,
        removed = report.removed,
        skipped = report.skipped,
        repairs = report.repairs,
        "reconciliation finished"
    );
    Ok(report)
}

fn detach_repairs(activities: &ActivityRegistry, activity: ActivityId, repairs: &[SyncRecord]) {
    for record in repairs {
        activities.detach(
            activity,
            record.seq,
            Err(ActionError::new(
                ErrorKind::Storage,
                "reconciliation was rolled back",
            )),
        );
    }
}
