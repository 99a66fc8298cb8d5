use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use cloudmirror_core::{ItemType, Permissions, ServerItem};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::paths::{PathCase, file_name, parent_path, rebase};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Errors that mean the vault file can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        match self {
            StoreError::Sqlx(err) => is_corruption_error(err),
            StoreError::InvalidValue(_) | StoreError::Json(_) => true,
        }
    }
}

pub(crate) fn is_corruption_error(err: &sqlx::Error) -> bool {
    match err {
        // SQLITE_CORRUPT and SQLITE_NOTADB, including extended codes
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 11 | 26)),
        _ => false,
    }
}

/// One mirrored entry of the remote tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Item {
    /// Stable across renames, moves and the placeholder to server transition.
    pub local_id: String,
    pub file_id: Option<String>,
    pub path: String,
    pub name: String,
    pub item_type: ItemType,
    pub size: Option<i64>,
    pub modified: Option<i64>,
    pub etag: Option<String>,
    pub checksum: Option<String>,
    pub permissions: Permissions,
    pub offline: bool,
    /// Created locally and not confirmed by the server yet.
    pub local_only: bool,
    pub downloaded_etag: Option<String>,
}

impl Item {
    pub fn placeholder(path: &str, item_type: ItemType) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            file_id: None,
            path: path.to_string(),
            name: file_name(path).to_string(),
            item_type,
            size: (item_type == ItemType::File).then_some(0),
            modified: None,
            etag: None,
            checksum: None,
            permissions: Permissions::ALL,
            offline: false,
            local_only: true,
            downloaded_etag: None,
        }
    }

    /// Merges server metadata over `base`, keeping the local identity and the
    /// attributes the server does not know about.
    pub fn from_server(server: &ServerItem, base: Option<&Item>) -> Self {
        Self {
            local_id: base
                .map(|item| item.local_id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            file_id: Some(server.file_id.clone()),
            path: server.path.clone(),
            name: server.name().to_string(),
            item_type: server.item_type,
            size: server.size.map(|size| size as i64),
            modified: server.modified,
            etag: Some(server.etag.clone()),
            checksum: server.checksum.clone(),
            permissions: server.permissions,
            offline: base.is_some_and(|item| item.offline),
            local_only: false,
            downloaded_etag: base.and_then(|item| item.downloaded_etag.clone()),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == ItemType::Folder
    }

    pub fn parent_path(&self) -> Option<String> {
        parent_path(&self.path)
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Whether the server entry differs from what this item recorded.
    pub fn differs_from(&self, server: &ServerItem) -> bool {
        self.etag.as_deref() != Some(server.etag.as_str())
            || self.path != server.path
            || self.item_type != server.item_type
            || self.permissions != server.permissions
    }
}

const ITEM_COLUMNS: &str = "local_id, file_id, path, name, item_type, size, modified, etag, checksum, permissions, offline, local_only, downloaded_etag";

fn item_from_row(row: &SqliteRow) -> Result<Item, StoreError> {
    let item_type: String = row.try_get("item_type")?;
    let permissions: i64 = row.try_get("permissions")?;
    Ok(Item {
        local_id: row.try_get("local_id")?,
        file_id: row.try_get("file_id")?,
        path: row.try_get("path")?,
        name: row.try_get("name")?,
        item_type: ItemType::parse(&item_type)
            .ok_or_else(|| StoreError::InvalidValue(format!("item type {item_type}")))?,
        size: row.try_get("size")?,
        modified: row.try_get("modified")?,
        etag: row.try_get("etag")?,
        checksum: row.try_get("checksum")?,
        permissions: Permissions::from_bits(permissions as u16),
        offline: row.try_get("offline")?,
        local_only: row.try_get("local_only")?,
        downloaded_etag: row.try_get("downloaded_etag")?,
    })
}

fn subtree_prefix(key: &str) -> String {
    if key == "/" {
        "/".to_string()
    } else {
        format!("{key}/")
    }
}

/// Item table view bound to an open transaction.
pub struct ItemStore<'t> {
    conn: &'t mut SqliteConnection,
    case: PathCase,
    dirty: Option<&'t mut bool>,
}

impl<'t> ItemStore<'t> {
    pub(crate) fn new(
        conn: &'t mut SqliteConnection,
        case: PathCase,
        dirty: Option<&'t mut bool>,
    ) -> Self {
        Self { conn, case, dirty }
    }

    fn touch(&mut self) {
        if let Some(dirty) = self.dirty.as_deref_mut() {
            *dirty = true;
        }
    }

    pub async fn upsert_items(&mut self, items: &[Item]) -> Result<(), StoreError> {
        for item in items {
            self.upsert_item(item).await?;
        }
        Ok(())
    }

    /// Inserts or replaces `item`. Rows holding the same path or server id
    /// under another identity are evicted.
    pub async fn upsert_item(&mut self, item: &Item) -> Result<(), StoreError> {
        let path_key = self.case.key(&item.path);
        let parent = item.parent_path();
        let parent_key = parent.as_deref().map(|parent| self.case.key(parent));

        let evicted = sqlx::query(
            "DELETE FROM items WHERE local_id != ?1 AND (path_key = ?2 OR (file_id IS NOT NULL AND file_id = ?3))",
        )
        .bind(&item.local_id)
        .bind(&path_key)
        .bind(&item.file_id)
        .execute(&mut *self.conn)
        .await?
        .rows_affected();
        if evicted > 0 {
            debug!(path = %item.path, evicted, "evicted stale item rows");
        }

        sqlx::query(
            "
            INSERT INTO items (
                local_id, file_id, path, path_key, parent_path, parent_key, name, item_type,
                size, modified, etag, checksum, permissions, offline, local_only, downloaded_etag
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(local_id) DO UPDATE SET
                file_id = excluded.file_id,
                path = excluded.path,
                path_key = excluded.path_key,
                parent_path = excluded.parent_path,
                parent_key = excluded.parent_key,
                name = excluded.name,
                item_type = excluded.item_type,
                size = excluded.size,
                modified = excluded.modified,
                etag = excluded.etag,
                checksum = excluded.checksum,
                permissions = excluded.permissions,
                offline = excluded.offline,
                local_only = excluded.local_only,
                downloaded_etag = excluded.downloaded_etag
            ",
        )
        .bind(&item.local_id)
        .bind(&item.file_id)
        .bind(&item.path)
        .bind(&path_key)
        .bind(&parent)
        .bind(&parent_key)
        .bind(&item.name)
        .bind(item.item_type.as_str())
        .bind(item.size)
        .bind(item.modified)
        .bind(&item.etag)
        .bind(&item.checksum)
        .bind(i64::from(item.permissions.bits()))
        .bind(item.offline)
        .bind(item.local_only)
        .bind(&item.downloaded_etag)
        .execute(&mut *self.conn)
        .await?;
        self.touch();
        Ok(())
    }

    /// Removes every listed path together with its descendants.
    pub async fn remove_items(&mut self, paths: &[&str]) -> Result<u64, StoreError> {
        let mut removed = 0;
        for path in paths {
            let key = self.case.key(path);
            removed += sqlx::query(
                "DELETE FROM items WHERE path_key = ?1 OR substr(path_key, 1, length(?2)) = ?2",
            )
            .bind(&key)
            .bind(subtree_prefix(&key))
            .execute(&mut *self.conn)
            .await?
            .rows_affected();
        }
        if removed > 0 {
            self.touch();
        }
        Ok(removed)
    }

    pub async fn lookup(&mut self, path: &str) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE path_key = ?1"))
            .bind(self.case.key(path))
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    pub async fn lookup_by_local_id(&mut self, local_id: &str) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE local_id = ?1"))
            .bind(local_id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    pub async fn lookup_by_file_id(&mut self, file_id: &str) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE file_id = ?1"))
            .bind(file_id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    pub async fn list_children(&mut self, path: &str) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE parent_key = ?1 ORDER BY path_key"
        ))
        .bind(self.case.key(path))
        .fetch_all(&mut *self.conn)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Every descendant of `path`, excluding `path` itself.
    pub async fn list_subtree(&mut self, path: &str) -> Result<Vec<Item>, StoreError> {
        let key = self.case.key(path);
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE path_key != ?1 AND substr(path_key, 1, length(?2)) = ?2 ORDER BY path_key"
        ))
        .bind(&key)
        .bind(subtree_prefix(&key))
        .fetch_all(&mut *self.conn)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn list_all(&mut self) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY path_key"))
            .fetch_all(&mut *self.conn)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn count(&mut self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM items")
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(row.try_get("total")?)
    }

    /// Re-paths the item at `from` and all its descendants to live under
    /// `to`. Returns the number of rows moved.
    pub async fn move_subtree(&mut self, from: &str, to: &str) -> Result<usize, StoreError> {
        let Some(top) = self.lookup(from).await? else {
            return Ok(0);
        };
        let descendants = if top.is_folder() {
            self.list_subtree(&top.path).await?
        } else {
            Vec::new()
        };
        let top_path = top.path.clone();
        let mut moved = 0;
        for mut item in std::iter::once(top).chain(descendants) {
            let Some(path) = rebase(&item.path, &top_path, to) else {
                warn!(path = %item.path, from = %top_path, "descendant path does not share the moved prefix");
                continue;
            };
            item.name = file_name(&path).to_string();
            item.path = path;
            self.upsert_item(&item).await?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Records authoritative server state. `adopt_local_id` names the local
    /// entry the server item corresponds to (a placeholder or a moved item);
    /// otherwise the entry is matched by server id.
    pub async fn apply_server_item(
        &mut self,
        server: &ServerItem,
        adopt_local_id: Option<&str>,
    ) -> Result<Item, StoreError> {
        let mut base = match adopt_local_id {
            Some(local_id) => self.lookup_by_local_id(local_id).await?,
            None => None,
        };
        if base.is_none() {
            base = self.lookup_by_file_id(&server.file_id).await?;
        }
        if let Some(existing) = &base
            && existing.is_folder()
            && existing.path != server.path
        {
            self.move_subtree(&existing.path, &server.path).await?;
        }
        let item = Item::from_server(server, base.as_ref());
        self.upsert_item(&item).await?;
        Ok(item)
    }

    /// Sets the offline flag on the item and, for folders, on every
    /// descendant.
    pub async fn set_offline(&mut self, path: &str, offline: bool) -> Result<u64, StoreError> {
        let key = self.case.key(path);
        let updated = sqlx::query(
            "UPDATE items SET offline = ?1 WHERE path_key = ?2 OR substr(path_key, 1, length(?3)) = ?3",
        )
        .bind(offline)
        .bind(&key)
        .bind(subtree_prefix(&key))
        .execute(&mut *self.conn)
        .await?
        .rows_affected();
        if updated > 0 {
            self.touch();
        }
        Ok(updated)
    }

    pub async fn set_downloaded_etag(
        &mut self,
        local_id: &str,
        etag: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE items SET downloaded_etag = ?1 WHERE local_id = ?2")
            .bind(etag)
            .bind(local_id)
            .execute(&mut *self.conn)
            .await?;
        self.touch();
        Ok(())
    }
}

#[cfg(test)]
#[path = "item_store_tests.rs"]
mod tests;
