use std::ops::BitOr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque identity of one server + account pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bookmark(String);

impl Bookmark {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe form of the bookmark, used to name the vault directory.
    pub fn storage_key(&self) -> String {
        let key: String = self
            .0
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        if key.is_empty() || key.chars().all(|ch| ch == '.') {
            format!("bookmark-{}", key.len())
        } else {
            key
        }
    }
}

impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Folder,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Folder => "folder",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(ItemType::File),
            "folder" => Some(ItemType::Folder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u16);

impl Permissions {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(1 << 1);
    pub const DELETE: Self = Self(1 << 2);
    pub const RENAME: Self = Self(1 << 3);
    pub const MOVE: Self = Self(1 << 4);
    pub const SHARE: Self = Self(1 << 5);
    pub const CREATE: Self = Self(1 << 6);
    pub const ALL: Self = Self(0x7f);

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Authoritative metadata of one entry as the server reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerItem {
    pub file_id: String,
    pub path: String,
    pub item_type: ItemType,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<i64>,
    pub etag: String,
    #[serde(default)]
    pub checksum: Option<String>,
    pub permissions: Permissions,
}

impl ServerItem {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == ItemType::Folder
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum ShareKind {
    PublicLink,
    User(String),
    Group(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareOptions {
    pub kind: ShareKind,
    pub permissions: Permissions,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl ShareOptions {
    pub fn public_link() -> Self {
        Self {
            kind: ShareKind::PublicLink,
            permissions: Permissions::READ,
            password: None,
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub id: String,
    pub path: String,
    pub kind: ShareKind,
    pub url: Option<String>,
    pub permissions: Permissions,
    pub expires_at: Option<i64>,
}

/// One request against the server. `expected_etag` carries the version the
/// client last saw; a mismatch is answered with a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteAction {
    CreateFolder {
        path: String,
    },
    CreateFile {
        path: String,
    },
    Move {
        file_id: Option<String>,
        from: String,
        to: String,
        expected_etag: Option<String>,
    },
    Copy {
        from: String,
        to: String,
        overwrite: bool,
    },
    Delete {
        file_id: Option<String>,
        path: String,
        expected_etag: Option<String>,
    },
    Upload {
        source: PathBuf,
        path: String,
        expected_etag: Option<String>,
        checksum: String,
    },
    Download {
        path: String,
        target: PathBuf,
    },
    Thumbnail {
        path: String,
        max_size: u32,
    },
    Share {
        path: String,
        options: ShareOptions,
    },
}

impl RemoteAction {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteAction::CreateFolder { .. } => "create_folder",
            RemoteAction::CreateFile { .. } => "create_file",
            RemoteAction::Move { .. } => "move",
            RemoteAction::Copy { .. } => "copy",
            RemoteAction::Delete { .. } => "delete",
            RemoteAction::Upload { .. } => "upload",
            RemoteAction::Download { .. } => "download",
            RemoteAction::Thumbnail { .. } => "thumbnail",
            RemoteAction::Share { .. } => "share",
        }
    }

    /// Path the action produces or mutates on the server.
    pub fn target_path(&self) -> &str {
        match self {
            RemoteAction::CreateFolder { path }
            | RemoteAction::CreateFile { path }
            | RemoteAction::Delete { path, .. }
            | RemoteAction::Upload { path, .. }
            | RemoteAction::Download { path, .. }
            | RemoteAction::Thumbnail { path, .. }
            | RemoteAction::Share { path, .. } => path,
            RemoteAction::Move { to, .. } | RemoteAction::Copy { to, .. } => to,
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            RemoteAction::Download { .. } | RemoteAction::Thumbnail { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteResponse {
    Item(ServerItem),
    Removed,
    Downloaded { item: ServerItem, local: PathBuf },
    Thumbnail { item: ServerItem, data: Vec<u8> },
    Shared { item: ServerItem, share: Share },
}

impl RemoteResponse {
    pub fn item(&self) -> Option<&ServerItem> {
        match self {
            RemoteResponse::Item(item)
            | RemoteResponse::Downloaded { item, .. }
            | RemoteResponse::Thumbnail { item, .. }
            | RemoteResponse::Shared { item, .. } => Some(item),
            RemoteResponse::Removed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_replaces_unsafe_characters() {
        let bookmark = Bookmark::new("https://cloud.example.com/alice");
        assert_eq!(bookmark.storage_key(), "https___cloud.example.com_alice");
        assert_eq!(Bookmark::new("..").storage_key(), "bookmark-2");
    }

    #[test]
    fn permissions_compose() {
        let perms = Permissions::READ | Permissions::WRITE;
        assert!(perms.contains(Permissions::READ));
        assert!(!perms.contains(Permissions::DELETE));
        assert_eq!(Permissions::from_bits(0xffff), Permissions::ALL);
    }

    #[test]
    fn server_item_name_is_last_component() {
        let item = ServerItem {
            file_id: "1".into(),
            path: "/Docs/A.txt".into(),
            item_type: ItemType::File,
            size: Some(1),
            modified: None,
            etag: "e1".into(),
            checksum: None,
            permissions: Permissions::ALL,
        };
        assert_eq!(item.name(), "A.txt");
    }

    #[test]
    fn share_kind_serializes_with_tag() {
        let json = serde_json::to_string(&ShareKind::User("bob".into())).unwrap();
        assert_eq!(json, r#"{"type":"user","name":"bob"}"#);
    }
}
