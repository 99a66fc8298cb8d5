use std::fmt;

use cloudmirror_core::{ConnectionError, ServerItem};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::action_queue::QueueError;
use crate::sync::item_store::StoreError;
use crate::sync::paths::PathError;
use crate::sync::record::ActionKind;
use crate::sync::vault::VaultError;

/// Caller-visible error taxonomy shared by activities, sync records and the
/// delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Unauthorized,
    QuotaExceeded,
    TransientNetwork,
    /// Local database or file system fault short of corruption.
    Storage,
    Cancelled,
    StorageCorruption,
    Closed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Storage => "storage",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StorageCorruption => "storage_corruption",
            ErrorKind::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "validation" => ErrorKind::Validation,
            "conflict" => ErrorKind::Conflict,
            "not_found" => ErrorKind::NotFound,
            "unauthorized" => ErrorKind::Unauthorized,
            "quota_exceeded" => ErrorKind::QuotaExceeded,
            "transient_network" => ErrorKind::TransientNetwork,
            "storage" => ErrorKind::Storage,
            "cancelled" => ErrorKind::Cancelled,
            "storage_corruption" => ErrorKind::StorageCorruption,
            "closed" => ErrorKind::Closed,
            _ => return None,
        })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientNetwork | ErrorKind::Storage)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ConnectionError> for ErrorKind {
    fn from(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::Unauthorized => ErrorKind::Unauthorized,
            ConnectionError::NotFound(_) => ErrorKind::NotFound,
            ConnectionError::Conflict { .. } => ErrorKind::Conflict,
            ConnectionError::QuotaExceeded => ErrorKind::QuotaExceeded,
            ConnectionError::TransientNetwork(_) | ConnectionError::Timeout => {
                ErrorKind::TransientNetwork
            }
            ConnectionError::Cancelled => ErrorKind::Cancelled,
            ConnectionError::LocalIo(_) => ErrorKind::Validation,
        }
    }
}

/// Error delivered through an activity or the delegate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Server state reported alongside a conflict.
    pub server_item: Option<ServerItem>,
}

impl ActionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            server_item: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn with_server_item(mut self, item: Option<ServerItem>) -> Self {
        self.server_item = item;
        self
    }
}

impl From<&ConnectionError> for ActionError {
    fn from(err: &ConnectionError) -> Self {
        ActionError::new(ErrorKind::from(err), err.to_string())
            .with_server_item(err.current_item().cloned())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid path: {0}")]
    Path(#[from] PathError),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("item not found: {0}")]
    NotFound(String),
    #[error("conflicts with sync record #{seq} ({kind}) on {path}")]
    Conflict {
        seq: i64,
        kind: ActionKind,
        path: String,
    },
    #[error("sync record #{0} not found")]
    RecordNotFound(i64),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<QueueError> for CoreError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Store(err) => CoreError::Store(err),
            QueueError::Conflict { seq, kind, path } => CoreError::Conflict { seq, kind, path },
        }
    }
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Path(_) | CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) | CoreError::RecordNotFound(_) => ErrorKind::NotFound,
            CoreError::Conflict { .. } => ErrorKind::Conflict,
            CoreError::Vault(err) => err.kind(),
            CoreError::Store(err) if err.is_corruption() => ErrorKind::StorageCorruption,
            CoreError::Store(_) | CoreError::Io(_) => ErrorKind::Storage,
            CoreError::Connection(err) => ErrorKind::from(err),
        }
    }

    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::StorageCorruption
    }

    pub fn to_action_error(&self) -> ActionError {
        match self {
            CoreError::Connection(err) => ActionError::from(err),
            other => ActionError::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_round_trips_through_storage_form() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Conflict,
            ErrorKind::NotFound,
            ErrorKind::Unauthorized,
            ErrorKind::QuotaExceeded,
            ErrorKind::TransientNetwork,
            ErrorKind::Storage,
            ErrorKind::Cancelled,
            ErrorKind::StorageCorruption,
            ErrorKind::Closed,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("bogus"), None);
    }

    #[test]
    fn conflict_keeps_server_state() {
        let current = ServerItem {
            file_id: "f1".into(),
            path: "/b".into(),
            item_type: cloudmirror_core::ItemType::Folder,
            size: None,
            modified: None,
            etag: "v2".into(),
            checksum: None,
            permissions: cloudmirror_core::Permissions::ALL,
        };
        let err = ActionError::from(&ConnectionError::conflict("/a", Some(current.clone())));
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.server_item, Some(current));
    }

    #[test]
    fn local_faults_are_storage_errors() {
        let err = CoreError::Io(std::io::Error::other("disk full"));
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.kind().is_retryable());
        let vault = CoreError::Vault(VaultError::Io(std::io::Error::other("read-only")));
        assert_eq!(vault.kind(), ErrorKind::Storage);
        assert_eq!(
            CoreError::Vault(VaultError::Corrupted("bad page".into())).kind(),
            ErrorKind::StorageCorruption
        );
    }

    #[test]
    fn only_network_errors_retry() {
        assert!(ErrorKind::from(&ConnectionError::Timeout).is_retryable());
        assert!(!ErrorKind::from(&ConnectionError::QuotaExceeded).is_retryable());
        assert_eq!(
            ErrorKind::from(&ConnectionError::Cancelled),
            ErrorKind::Cancelled
        );
    }
}
