use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{RemoteAction, RemoteResponse, ServerItem};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("not authorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict at {path}")]
    Conflict {
        path: String,
        current: Option<Box<ServerItem>>,
    },
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("network error: {0}")]
    TransientNetwork(String),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("local I/O error: {0}")]
    LocalIo(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    Conflict,
    NotFound,
    Quota,
    Transient,
    Cancelled,
    Permanent,
}

impl ConnectionError {
    pub fn conflict(path: impl Into<String>, current: Option<ServerItem>) -> Self {
        ConnectionError::Conflict {
            path: path.into(),
            current: current.map(Box::new),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ConnectionError::Unauthorized => ErrorClass::Auth,
            ConnectionError::NotFound(_) => ErrorClass::NotFound,
            ConnectionError::Conflict { .. } => ErrorClass::Conflict,
            ConnectionError::QuotaExceeded => ErrorClass::Quota,
            ConnectionError::TransientNetwork(_) | ConnectionError::Timeout => {
                ErrorClass::Transient
            }
            ConnectionError::Cancelled => ErrorClass::Cancelled,
            ConnectionError::LocalIo(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Server state carried by a conflict response, if any.
    pub fn current_item(&self) -> Option<&ServerItem> {
        match self {
            ConnectionError::Conflict { current, .. } => current.as_deref(),
            _ => None,
        }
    }
}

/// The server-facing collaborator. Implementations must honour the token
/// until the point where the server has committed the change.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn execute(
        &self,
        action: &RemoteAction,
        cancel: &CancellationToken,
    ) -> Result<RemoteResponse, ConnectionError>;

    async fn item_at(&self, path: &str) -> Result<Option<ServerItem>, ConnectionError>;

    /// Every entry below `root`, excluding `root` itself.
    async fn list_tree(&self, root: &str) -> Result<Vec<ServerItem>, ConnectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_are_retryable() {
        assert!(ConnectionError::TransientNetwork("reset".into()).is_retryable());
        assert!(ConnectionError::Timeout.is_retryable());
        assert!(!ConnectionError::Unauthorized.is_retryable());
        assert!(!ConnectionError::conflict("/a", None).is_retryable());
        assert_eq!(
            ConnectionError::LocalIo("gone".into()).class(),
            ErrorClass::Permanent
        );
    }
}
