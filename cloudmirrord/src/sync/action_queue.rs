use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use thiserror::Error;
use tracing::debug;

use super::item_store::StoreError;
use super::now_millis;
use super::paths::{PathCase, paths_related};
use super::record::{ActionKind, NewRecord, RecordPayload, RecordState, SyncRecord};
use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("conflicts with sync record #{seq} ({kind}) on {path}")]
    Conflict {
        seq: i64,
        kind: ActionKind,
        path: String,
    },
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Store(StoreError::Sqlx(err))
    }
}

impl QueueError {
    fn conflict(existing: &SyncRecord) -> Self {
        QueueError::Conflict {
            seq: existing.seq,
            kind: existing.kind,
            path: existing.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inserted,
    /// Merged into an existing record, which stays queued.
    Coalesced,
    /// Cancelled out an existing record; nothing is left to execute.
    Annulled,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    /// The record that will carry out the intent. For `Annulled` this is the
    /// removed record.
    pub record: SyncRecord,
    pub disposition: Disposition,
    /// Records removed because the new one made them pointless.
    pub superseded: Vec<SyncRecord>,
    /// Payload replaced by a coalesced upload.
    pub replaced_payload: Option<RecordPayload>,
}

impl EnqueueOutcome {
    fn new(record: SyncRecord, disposition: Disposition) -> Self {
        Self {
            record,
            disposition,
            superseded: Vec::new(),
            replaced_payload: None,
        }
    }
}

enum Merge {
    Attach,
    Supersede,
    ReplacePayload,
    ReplaceKind,
    Retarget,
}

const RECORD_COLUMNS: &str = "seq, kind, path, dest_path, local_id, state, attempt, retry_at, last_error, error_kind, payload, activity_id, interrupted, created_at, updated_at";

fn record_from_row(row: &SqliteRow) -> Result<SyncRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let payload: String = row.try_get("payload")?;
    let attempt: i64 = row.try_get("attempt")?;
    Ok(SyncRecord {
        seq: row.try_get("seq")?,
        kind: ActionKind::parse(&kind)?,
        path: row.try_get("path")?,
        dest_path: row.try_get("dest_path")?,
        local_id: row.try_get("local_id")?,
        state: RecordState::parse(&state)?,
        attempt: attempt.max(0) as u32,
        retry_at: row.try_get("retry_at")?,
        last_error: row.try_get("last_error")?,
        error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
        payload: serde_json::from_str(&payload)?,
        activity_id: row.try_get("activity_id")?,
        interrupted: row.try_get("interrupted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Sync record table view bound to an open transaction.
pub struct ActionQueue<'t> {
    conn: &'t mut SqliteConnection,
    case: PathCase,
}

impl<'t> ActionQueue<'t> {
    pub(crate) fn new(conn: &'t mut SqliteConnection, case: PathCase) -> Self {
        Self { conn, case }
    }

    /// Queues `new`, merging it with a waiting record on the same path when
    /// the two kinds combine. Fails with `Conflict` when they do not, or
    /// when the existing record is already claimed by the scheduler.
    pub async fn enqueue(&mut self, new: NewRecord) -> Result<EnqueueOutcome, QueueError> {
        let open = self.list_non_terminal().await?;
        let key = self.case.key(&new.path);
        let same_item = |record: &SyncRecord| {
            record.local_id.is_some() && record.local_id == new.local_id
        };

        if new.kind.is_move_like()
            && let Some(dest) = new.dest_path.as_deref()
            && let Some(existing) = open.iter().find(|record| {
                record.kind.is_move_like()
                    && same_item(record)
                    && record
                        .dest_path
                        .as_deref()
                        .is_some_and(|previous| self.case.key(previous) == key)
            })
        {
            if !existing.state.is_waiting() {
                return Err(QueueError::conflict(existing));
            }
            // later records addressing the intermediate location still need the item there
            if let Some(dependent) = open.iter().find(|other| {
                other.seq != existing.seq
                    && other
                        .paths()
                        .any(|path| paths_related(path, &new.path, self.case))
            }) {
                return Err(QueueError::conflict(dependent));
            }
            if self.case.eq(dest, &existing.path) {
                self.delete(existing.seq).await?;
                debug!(seq = existing.seq, path = %existing.path, "move returned to origin; record annulled");
                return Ok(EnqueueOutcome::new(existing.clone(), Disposition::Annulled));
            }
            let mut merged = existing.clone();
            merged.dest_path = Some(dest.to_string());
            if merged.kind != new.kind {
                merged.kind = ActionKind::Move;
            }
            self.update_record(&merged).await?;
            debug!(seq = merged.seq, dest, "coalesced chained move");
            return Ok(EnqueueOutcome::new(merged, Disposition::Coalesced));
        }

        let Some(existing) = open
            .iter()
            .find(|record| self.case.key(&record.path) == key)
            .cloned()
        else {
            let record = self.insert(&new).await?;
            debug!(seq = record.seq, kind = %record.kind, path = %record.path, "sync record queued");
            return Ok(EnqueueOutcome::new(record, Disposition::Inserted));
        };

        if !existing.state.is_waiting() {
            return Err(QueueError::conflict(&existing));
        }
        let merge = match (existing.kind, new.kind) {
            (ActionKind::Delete, ActionKind::Delete) => Merge::Attach,
            (ActionKind::Rename | ActionKind::Move, ActionKind::Delete) => {
                return Err(QueueError::conflict(&existing));
            }
            (_, ActionKind::Delete) => Merge::Supersede,
            (ActionKind::Upload, ActionKind::Upload) => Merge::ReplacePayload,
            (
                a @ (ActionKind::Download
                | ActionKind::RetrieveThumbnail
                | ActionKind::SetOfflineAvailable
                | ActionKind::ClearOfflineAvailable),
                b,
            ) if a == b => Merge::Attach,
            (ActionKind::SetOfflineAvailable, ActionKind::ClearOfflineAvailable)
            | (ActionKind::ClearOfflineAvailable, ActionKind::SetOfflineAvailable) => {
                Merge::ReplaceKind
            }
            (a, b)
                if a.creates_entry()
                    && b.is_move_like()
                    && same_item(&existing)
                    && !open.iter().any(|other| {
                        other.seq != existing.seq
                            && other.is_related_to(&existing, self.case)
                    }) =>
            {
                Merge::Retarget
            }
            _ => return Err(QueueError::conflict(&existing)),
        };

        let mut merged = existing.clone();
        let mut outcome = match merge {
            Merge::Attach => EnqueueOutcome::new(merged, Disposition::Coalesced),
            Merge::Supersede => {
                self.delete(existing.seq).await?;
                let record = self.insert(&new).await?;
                debug!(superseded = existing.seq, seq = record.seq, path = %record.path, "record superseded by delete");
                let mut outcome = EnqueueOutcome::new(record, Disposition::Inserted);
                outcome.superseded.push(existing.clone());
                outcome
            }
            Merge::ReplacePayload => {
                let previous = std::mem::replace(&mut merged.payload, new.payload.clone());
                self.update_record(&merged).await?;
                let mut outcome = EnqueueOutcome::new(merged, Disposition::Coalesced);
                outcome.replaced_payload = Some(previous);
                outcome
            }
            Merge::ReplaceKind => {
                merged.kind = new.kind;
                self.update_record(&merged).await?;
                EnqueueOutcome::new(merged, Disposition::Coalesced)
            }
            Merge::Retarget => {
                merged.path = new.dest_path.clone().unwrap_or_else(|| new.path.clone());
                self.update_record(&merged).await?;
                EnqueueOutcome::new(merged, Disposition::Coalesced)
            }
        };
        if outcome.disposition == Disposition::Coalesced {
            debug!(seq = outcome.record.seq, kind = %new.kind, "coalesced into existing record");
        }
        outcome.record.updated_at = now_millis();
        Ok(outcome)
    }

    async fn insert(&mut self, new: &NewRecord) -> Result<SyncRecord, QueueError> {
        let now = now_millis();
        let payload = serde_json::to_string(&new.payload).map_err(StoreError::from)?;
        let seq = sqlx::query(
            "
            INSERT INTO sync_records (
                kind, path, path_key, dest_path, dest_key, local_id, state, attempt,
                payload, activity_id, interrupted, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, 0, ?9, ?9)
            ",
        )
        .bind(new.kind.as_str())
        .bind(&new.path)
        .bind(self.case.key(&new.path))
        .bind(&new.dest_path)
        .bind(new.dest_path.as_deref().map(|dest| self.case.key(dest)))
        .bind(&new.local_id)
        .bind(payload)
        .bind(&new.activity_id)
        .bind(now)
        .execute(&mut *self.conn)
        .await?
        .last_insert_rowid();
        self.get(seq)
            .await?
            .ok_or_else(|| QueueError::Store(StoreError::InvalidValue(format!("record #{seq} vanished"))))
    }

    async fn update_record(&mut self, record: &SyncRecord) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&record.payload).map_err(StoreError::from)?;
        sqlx::query(
            "UPDATE sync_records SET kind = ?1, path = ?2, path_key = ?3, dest_path = ?4, dest_key = ?5, payload = ?6, updated_at = ?7 WHERE seq = ?8",
        )
        .bind(record.kind.as_str())
        .bind(&record.path)
        .bind(self.case.key(&record.path))
        .bind(&record.dest_path)
        .bind(record.dest_path.as_deref().map(|dest| self.case.key(dest)))
        .bind(payload)
        .bind(now_millis())
        .bind(record.seq)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn delete(&mut self, seq: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_records WHERE seq = ?1")
            .bind(seq)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn get(&mut self, seq: i64) -> Result<Option<SyncRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE seq = ?1"
        ))
        .bind(seq)
        .fetch_optional(&mut *self.conn)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list(&mut self) -> Result<Vec<SyncRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records ORDER BY seq"
        ))
        .fetch_all(&mut *self.conn)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_non_terminal(&mut self) -> Result<Vec<SyncRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE state NOT IN ('done', 'needs_user_attention') ORDER BY seq"
        ))
        .fetch_all(&mut *self.conn)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_needing_attention(&mut self) -> Result<Vec<SyncRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE state = 'needs_user_attention' ORDER BY seq"
        ))
        .fetch_all(&mut *self.conn)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Non-terminal records touching `path`, an ancestor or a descendant.
    pub async fn open_records_related_to(
        &mut self,
        path: &str,
    ) -> Result<Vec<SyncRecord>, StoreError> {
        let case = self.case;
        Ok(self
            .list_non_terminal()
            .await?
            .into_iter()
            .filter(|record| record.paths().any(|mine| paths_related(mine, path, case)))
            .collect())
    }

    /// Claims the lowest-seq record that is due and does not depend on an
    /// earlier unfinished record, marking it `scheduled`.
    pub async fn dequeue_next(&mut self, now: i64) -> Result<Option<SyncRecord>, StoreError> {
        let open = self.list_non_terminal().await?;
        for (index, record) in open.iter().enumerate() {
            let due = match record.state {
                RecordState::Pending => true,
                RecordState::Failed => record.retry_at.is_none_or(|at| at <= now),
                _ => false,
            };
            if !due {
                continue;
            }
            if open[..index]
                .iter()
                .any(|earlier| earlier.is_related_to(record, self.case))
            {
                continue;
            }
            self.mark_state(record.seq, RecordState::Scheduled).await?;
            let mut claimed = record.clone();
            claimed.state = RecordState::Scheduled;
            return Ok(Some(claimed));
        }
        Ok(None)
    }

    /// Earliest `retry_at` among records waiting out a backoff.
    pub async fn next_retry_at(&mut self) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            "SELECT MIN(retry_at) AS next FROM sync_records WHERE state = 'failed'",
        )
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row.try_get("next")?)
    }

    pub async fn mark_state(&mut self, seq: i64, state: RecordState) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_records SET state = ?1, updated_at = ?2 WHERE seq = ?3")
            .bind(state.as_str())
            .bind(now_millis())
            .bind(seq)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    /// Parks a record until `retry_at`. The failed attempt may have reached
    /// the server, so the next one checks for its effect first.
    pub async fn schedule_retry(
        &mut self,
        seq: i64,
        attempt: u32,
        retry_at: i64,
        kind: ErrorKind,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_records SET state = 'failed', attempt = ?1, retry_at = ?2, error_kind = ?3, last_error = ?4, interrupted = 1, updated_at = ?5 WHERE seq = ?6",
        )
        .bind(i64::from(attempt))
        .bind(retry_at)
        .bind(kind.as_str())
        .bind(message)
        .bind(now_millis())
        .bind(seq)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn mark_needs_attention(
        &mut self,
        seq: i64,
        kind: ErrorKind,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_records SET state = 'needs_user_attention', retry_at = NULL, error_kind = ?1, last_error = ?2, updated_at = ?3 WHERE seq = ?4",
        )
        .bind(kind.as_str())
        .bind(message)
        .bind(now_millis())
        .bind(seq)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    /// Finishes a record. Done records leave the table in the same
    /// transaction that applied their result.
    pub async fn complete(&mut self, seq: i64) -> Result<(), StoreError> {
        self.delete(seq).await
    }

    /// Drops a record that never reached the server.
    pub async fn remove(&mut self, seq: i64) -> Result<(), StoreError> {
        self.delete(seq).await
    }

    /// Moves every later waiting record that depends on `failed` to
    /// `needs_user_attention`.
    pub async fn cascade_dependents(
        &mut self,
        failed: &SyncRecord,
        kind: ErrorKind,
    ) -> Result<Vec<SyncRecord>, StoreError> {
        let message = format!("blocked by sync record #{} that needs attention", failed.seq);
        let dependents: Vec<SyncRecord> = self
            .list_non_terminal()
            .await?
            .into_iter()
            .filter(|record| {
                record.seq > failed.seq
                    && record.state.is_waiting()
                    && record.is_related_to(failed, self.case)
            })
            .collect();
        let mut cascaded = Vec::with_capacity(dependents.len());
        for mut record in dependents {
            self.mark_needs_attention(record.seq, kind, &message).await?;
            record.state = RecordState::NeedsUserAttention;
            record.error_kind = Some(kind);
            record.last_error = Some(message.clone());
            cascaded.push(record);
        }
        Ok(cascaded)
    }

    /// Removes waiting records whose primary path is `path`. Fails when one
    /// of them is already claimed.
    pub async fn supersede_path(&mut self, path: &str) -> Result<Vec<SyncRecord>, QueueError> {
        let key = self.case.key(path);
        let matching: Vec<SyncRecord> = self
            .list_non_terminal()
            .await?
            .into_iter()
            .filter(|record| self.case.key(&record.path) == key)
            .collect();
        if let Some(active) = matching.iter().find(|record| !record.state.is_waiting()) {
            return Err(QueueError::conflict(active));
        }
        for record in &matching {
            self.delete(record.seq).await?;
        }
        Ok(matching)
    }

    /// Resets records a previous process left claimed. Returns how many.
    pub async fn recover_interrupted(&mut self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sync_records SET state = 'pending', interrupted = 1, updated_at = ?1 WHERE state IN ('scheduled', 'executing')",
        )
        .bind(now_millis())
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Re-arms a record that needs attention.
    pub async fn retry(&mut self, seq: i64) -> Result<Option<SyncRecord>, QueueError> {
        let Some(record) = self.get(seq).await? else {
            return Ok(None);
        };
        if record.state != RecordState::NeedsUserAttention {
            return Ok(None);
        }
        let key = self.case.key(&record.path);
        if let Some(blocking) = self
            .list_non_terminal()
            .await?
            .iter()
            .find(|other| self.case.key(&other.path) == key)
        {
            return Err(QueueError::conflict(blocking));
        }
        sqlx::query(
            "UPDATE sync_records SET state = 'pending', attempt = 0, retry_at = NULL, error_kind = NULL, last_error = NULL, updated_at = ?1 WHERE seq = ?2",
        )
        .bind(now_millis())
        .bind(seq)
        .execute(&mut *self.conn)
        .await?;
        Ok(self.get(seq).await?)
    }

    /// Drops a record that needs attention.
    pub async fn dismiss(&mut self, seq: i64) -> Result<Option<SyncRecord>, StoreError> {
        let Some(record) = self.get(seq).await? else {
            return Ok(None);
        };
        if record.state != RecordState::NeedsUserAttention {
            return Ok(None);
        }
        self.delete(seq).await?;
        Ok(Some(record))
    }

    pub async fn count_by_state(&mut self) -> Result<Vec<(RecordState, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS total FROM sync_records GROUP BY state ORDER BY state",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        rows.iter()
            .map(|row| -> Result<(RecordState, i64), StoreError> {
                let state: String = row.try_get("state")?;
                Ok((RecordState::parse(&state)?, row.try_get("total")?))
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "action_queue_tests.rs"]
mod tests;
