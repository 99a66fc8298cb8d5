use std::fmt;
use std::path::PathBuf;

use cloudmirror_core::ShareOptions;
use serde::{Deserialize, Serialize};

use super::item_store::StoreError;
use super::paths::{PathCase, paths_related};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateFolder,
    CreateFile,
    Rename,
    Move,
    Copy,
    Delete,
    Upload,
    Download,
    RetrieveThumbnail,
    ShareCreate,
    SetOfflineAvailable,
    ClearOfflineAvailable,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateFolder => "create_folder",
            ActionKind::CreateFile => "create_file",
            ActionKind::Rename => "rename",
            ActionKind::Move => "move",
            ActionKind::Copy => "copy",
            ActionKind::Delete => "delete",
            ActionKind::Upload => "upload",
            ActionKind::Download => "download",
            ActionKind::RetrieveThumbnail => "retrieve_thumbnail",
            ActionKind::ShareCreate => "share_create",
            ActionKind::SetOfflineAvailable => "set_offline_available",
            ActionKind::ClearOfflineAvailable => "clear_offline_available",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        Ok(match value {
            "create_folder" => ActionKind::CreateFolder,
            "create_file" => ActionKind::CreateFile,
            "rename" => ActionKind::Rename,
            "move" => ActionKind::Move,
            "copy" => ActionKind::Copy,
            "delete" => ActionKind::Delete,
            "upload" => ActionKind::Upload,
            "download" => ActionKind::Download,
            "retrieve_thumbnail" => ActionKind::RetrieveThumbnail,
            "share_create" => ActionKind::ShareCreate,
            "set_offline_available" => ActionKind::SetOfflineAvailable,
            "clear_offline_available" => ActionKind::ClearOfflineAvailable,
            other => return Err(StoreError::InvalidValue(format!("action kind {other}"))),
        })
    }

    pub fn is_move_like(&self) -> bool {
        matches!(self, ActionKind::Rename | ActionKind::Move)
    }

    /// Kinds whose effect can be recognised from the entry at the record's
    /// resulting path.
    pub fn leaves_server_trace(&self) -> bool {
        matches!(
            self,
            ActionKind::CreateFolder
                | ActionKind::CreateFile
                | ActionKind::Upload
                | ActionKind::Rename
                | ActionKind::Move
                | ActionKind::Copy
                | ActionKind::Delete
        )
    }

    /// Kinds that create a new entry on the server at the record's path.
    pub fn creates_entry(&self) -> bool {
        matches!(
            self,
            ActionKind::CreateFolder | ActionKind::CreateFile | ActionKind::Upload
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    Pending,
    Scheduled,
    Executing,
    Done,
    Failed,
    NeedsUserAttention,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Scheduled => "scheduled",
            RecordState::Executing => "executing",
            RecordState::Done => "done",
            RecordState::Failed => "failed",
            RecordState::NeedsUserAttention => "needs_user_attention",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        Ok(match value {
            "pending" => RecordState::Pending,
            "scheduled" => RecordState::Scheduled,
            "executing" => RecordState::Executing,
            "done" => RecordState::Done,
            "failed" => RecordState::Failed,
            "needs_user_attention" => RecordState::NeedsUserAttention,
            other => return Err(StoreError::InvalidValue(format!("record state {other}"))),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordState::Done | RecordState::NeedsUserAttention)
    }

    /// Not yet claimed by the scheduler; may still be coalesced or cancelled.
    pub fn is_waiting(&self) -> bool {
        matches!(self, RecordState::Pending | RecordState::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RecordState::Scheduled | RecordState::Executing)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action-specific data persisted as JSON next to the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordPayload {
    #[default]
    None,
    Move {
        file_id: Option<String>,
        expected_etag: Option<String>,
    },
    Copy {
        overwrite: bool,
    },
    Delete {
        file_id: Option<String>,
        expected_etag: Option<String>,
    },
    Upload {
        source: PathBuf,
        checksum: String,
        expected_etag: Option<String>,
    },
    Thumbnail {
        max_size: u32,
    },
    Share {
        options: ShareOptions,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub seq: i64,
    pub kind: ActionKind,
    pub path: String,
    pub dest_path: Option<String>,
    pub local_id: Option<String>,
    pub state: RecordState,
    pub attempt: u32,
    pub retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub payload: RecordPayload,
    pub activity_id: Option<String>,
    pub interrupted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncRecord {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.path.as_str()).chain(self.dest_path.as_deref())
    }

    /// True when either record touches a path equal to, above or below one of
    /// the other's paths.
    pub fn is_related_to(&self, other: &SyncRecord, case: PathCase) -> bool {
        self.paths()
            .any(|mine| other.paths().any(|theirs| paths_related(mine, theirs, case)))
    }

    /// Path of the entry once the record has executed.
    pub fn effective_path(&self) -> &str {
        match self.kind {
            ActionKind::Rename | ActionKind::Move | ActionKind::Copy => {
                self.dest_path.as_deref().unwrap_or(&self.path)
            }
            _ => &self.path,
        }
    }
}

/// Input to `ActionQueue::enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub kind: ActionKind,
    pub path: String,
    pub dest_path: Option<String>,
    pub local_id: Option<String>,
    pub payload: RecordPayload,
    pub activity_id: Option<String>,
}

impl NewRecord {
    pub fn new(kind: ActionKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            dest_path: None,
            local_id: None,
            payload: RecordPayload::None,
            activity_id: None,
        }
    }

    pub fn dest(mut self, dest: impl Into<String>) -> Self {
        self.dest_path = Some(dest.into());
        self
    }

    pub fn local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    pub fn payload(mut self, payload: RecordPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn activity(mut self, activity_id: impl ToString) -> Self {
        self.activity_id = Some(activity_id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: i64, kind: ActionKind, path: &str, dest: Option<&str>) -> SyncRecord {
        SyncRecord {
            seq,
            kind,
            path: path.into(),
            dest_path: dest.map(str::to_string),
            local_id: None,
            state: RecordState::Pending,
            attempt: 0,
            retry_at: None,
            last_error: None,
            error_kind: None,
            payload: RecordPayload::None,
            activity_id: None,
            interrupted: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn relation_considers_destination() {
        let rename = record(1, ActionKind::Rename, "/a", Some("/b"));
        let child = record(2, ActionKind::CreateFile, "/b/x.txt", None);
        let unrelated = record(3, ActionKind::CreateFile, "/c", None);
        assert!(rename.is_related_to(&child, PathCase::Sensitive));
        assert!(!rename.is_related_to(&unrelated, PathCase::Sensitive));
    }

    #[test]
    fn payload_json_is_tagged() {
        let payload = RecordPayload::Copy { overwrite: true };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"type":"copy","overwrite":true}"#);
        let back: RecordPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn kind_strings_parse_back() {
        for kind in [ActionKind::SetOfflineAvailable, ActionKind::RetrieveThumbnail] {
            assert_eq!(ActionKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ActionKind::parse("teleport").is_err());
        assert!(RecordState::NeedsUserAttention.is_terminal());
        assert!(RecordState::Failed.is_waiting());
    }
}
