use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionError};
use crate::model::{
    ItemType, Permissions, RemoteAction, RemoteResponse, ServerItem, Share, ShareKind,
};

/// Pauses the next mutating request right after the server committed it.
///
/// `committed()` resolves once the change is visible on the server; the
/// request does not return to the caller until `release()` is called.
#[derive(Debug, Clone, Default)]
pub struct CommitGate {
    committed: Arc<Notify>,
    release: Arc<Notify>,
}

impl CommitGate {
    pub async fn committed(&self) {
        self.committed.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Debug, Clone)]
struct Node {
    file_id: String,
    item_type: ItemType,
    content: Vec<u8>,
    modified: i64,
    etag: String,
    permissions: Permissions,
}

#[derive(Debug)]
struct ServerState {
    nodes: BTreeMap<String, Node>,
    next_id: u64,
    next_version: u64,
    shares: Vec<Share>,
    failures: VecDeque<ConnectionError>,
    authorized: bool,
    quota: Option<u64>,
    latency: Option<Duration>,
    commit_gate: Option<CommitGate>,
    requests: Vec<String>,
}

type Applied = (RemoteResponse, Option<(PathBuf, Vec<u8>)>);

/// In-process server holding a whole remote tree in memory.
///
/// Follows the conflict rules a real file-hosting server applies: version
/// tags are checked on move, delete and overwrite, moves are tracked by file
/// id, and every change bumps the version tag of the touched entry.
#[derive(Debug)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                file_id: "root".into(),
                item_type: ItemType::Folder,
                content: Vec::new(),
                modified: now_secs(),
                etag: "v0".into(),
                permissions: Permissions::ALL,
            },
        );
        Self {
            state: Mutex::new(ServerState {
                nodes,
                next_id: 1,
                next_version: 1,
                shares: Vec::new(),
                failures: VecDeque::new(),
                authorized: true,
                quota: None,
                latency: None,
                commit_gate: None,
                requests: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a folder (and any missing ancestors) as another client would.
    pub fn insert_folder(&self, path: &str) -> ServerItem {
        let mut state = self.lock();
        state.ensure_folder_chain(path);
        state.item(path).unwrap_or_else(|| state.root_item())
    }

    /// Creates or overwrites a file as another client would.
    pub fn insert_file(&self, path: &str, content: &[u8]) -> ServerItem {
        let mut state = self.lock();
        state.ensure_folder_chain(parent_of(path));
        state.write_file(path, content.to_vec());
        state.item(path).unwrap_or_else(|| state.root_item())
    }

    /// Moves an entry as another client would, ignoring version tags.
    pub fn rename_remote(&self, from: &str, to: &str) -> Option<ServerItem> {
        let mut state = self.lock();
        if !state.nodes.contains_key(from) || state.nodes.contains_key(to) {
            return None;
        }
        state.ensure_folder_chain(parent_of(to));
        state.move_subtree(from, to);
        state.item(to)
    }

    pub fn remove(&self, path: &str) -> bool {
        let mut state = self.lock();
        if path == "/" || !state.nodes.contains_key(path) {
            return false;
        }
        state.remove_subtree(path);
        true
    }

    pub fn item(&self, path: &str) -> Option<ServerItem> {
        self.lock().item(path)
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).map(|node| node.content.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock()
            .nodes
            .keys()
            .filter(|path| path.as_str() != "/")
            .cloned()
            .collect()
    }

    pub fn shares(&self) -> Vec<Share> {
        self.lock().shares.clone()
    }

    /// Every request seen so far as `"<action> <target>"`.
    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    /// Fails the next request (of any kind) with `error`. Calls stack up.
    pub fn fail_next(&self, error: ConnectionError) {
        self.lock().failures.push_back(error);
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.lock().authorized = authorized;
    }

    pub fn set_quota(&self, quota: Option<u64>) {
        self.lock().quota = quota;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn hold_next_commit(&self) -> CommitGate {
        let gate = CommitGate::default();
        self.lock().commit_gate = Some(gate.clone());
        gate
    }

    fn admit(&self, request: String) -> Result<Option<Duration>, ConnectionError> {
        let mut state = self.lock();
        state.requests.push(request);
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if !state.authorized {
            return Err(ConnectionError::Unauthorized);
        }
        Ok(state.latency)
    }
}

#[async_trait]
impl Connection for MemoryServer {
    async fn execute(
        &self,
        action: &RemoteAction,
        cancel: &CancellationToken,
    ) -> Result<RemoteResponse, ConnectionError> {
        if cancel.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }
        let latency = self.admit(format!("{} {}", action.name(), action.target_path()))?;
        if let Some(latency) = latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        let upload = match action {
            RemoteAction::Upload { source, .. } => Some(
                tokio::fs::read(source)
                    .await
                    .map_err(|err| ConnectionError::LocalIo(format!("{}: {err}", source.display())))?,
            ),
            _ => None,
        };
        if cancel.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }

        let ((response, write), gate) = {
            let mut state = self.lock();
            let applied = state.apply(action, upload)?;
            let gate = if action.is_mutating() {
                state.commit_gate.take()
            } else {
                None
            };
            (applied, gate)
        };

        if let Some((target, bytes)) = write {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| ConnectionError::LocalIo(err.to_string()))?;
            }
            tokio::fs::write(&target, bytes)
                .await
                .map_err(|err| ConnectionError::LocalIo(err.to_string()))?;
        }
        if let Some(gate) = gate {
            gate.committed.notify_one();
            gate.release.notified().await;
        }
        Ok(response)
    }

    async fn item_at(&self, path: &str) -> Result<Option<ServerItem>, ConnectionError> {
        self.admit(format!("stat {path}"))?;
        Ok(self.item(path))
    }

    async fn list_tree(&self, root: &str) -> Result<Vec<ServerItem>, ConnectionError> {
        self.admit(format!("list {root}"))?;
        let state = self.lock();
        if !state.nodes.contains_key(root) {
            return Err(ConnectionError::NotFound(root.to_string()));
        }
        Ok(state
            .nodes
            .keys()
            .filter(|path| path.as_str() != root && in_subtree(path, root))
            .filter_map(|path| state.item(path))
            .collect())
    }
}

impl ServerState {
    fn apply(
        &mut self,
        action: &RemoteAction,
        upload: Option<Vec<u8>>,
    ) -> Result<Applied, ConnectionError> {
        match action {
            RemoteAction::CreateFolder { path } => {
                self.create(path, ItemType::Folder)?;
                Ok((RemoteResponse::Item(self.require(path)?), None))
            }
            RemoteAction::CreateFile { path } => {
                self.create(path, ItemType::File)?;
                Ok((RemoteResponse::Item(self.require(path)?), None))
            }
            RemoteAction::Move {
                file_id,
                from,
                to,
                expected_etag,
            } => {
                let Some(source) = self.nodes.get(from).cloned() else {
                    if let Some(id) = file_id
                        && let Some(current) = self.find_by_file_id(id)
                    {
                        return Err(ConnectionError::conflict(from.clone(), Some(current)));
                    }
                    return Err(ConnectionError::NotFound(from.clone()));
                };
                self.check_version(from, &source, file_id.as_deref(), expected_etag.as_deref())?;
                if from == "/" || in_subtree(to, from) {
                    return Err(ConnectionError::conflict(to.clone(), None));
                }
                if self.nodes.contains_key(to) {
                    return Err(ConnectionError::conflict(to.clone(), self.item(to)));
                }
                self.require_parent_folder(to)?;
                self.move_subtree(from, to);
                Ok((RemoteResponse::Item(self.require(to)?), None))
            }
            RemoteAction::Copy {
                from,
                to,
                overwrite,
            } => {
                if !self.nodes.contains_key(from) {
                    return Err(ConnectionError::NotFound(from.clone()));
                }
                if in_subtree(to, from) {
                    return Err(ConnectionError::conflict(to.clone(), None));
                }
                if self.nodes.contains_key(to) {
                    if !overwrite {
                        return Err(ConnectionError::conflict(to.clone(), self.item(to)));
                    }
                    self.remove_subtree(to);
                }
                self.require_parent_folder(to)?;
                self.copy_subtree(from, to);
                Ok((RemoteResponse::Item(self.require(to)?), None))
            }
            RemoteAction::Delete {
                file_id,
                path,
                expected_etag,
            } => {
                let Some(node) = self.nodes.get(path).cloned() else {
                    return Err(ConnectionError::NotFound(path.clone()));
                };
                if path == "/" {
                    return Err(ConnectionError::conflict(path.clone(), None));
                }
                self.check_version(path, &node, file_id.as_deref(), expected_etag.as_deref())?;
                self.remove_subtree(path);
                Ok((RemoteResponse::Removed, None))
            }
            RemoteAction::Upload {
                path,
                expected_etag,
                checksum,
                ..
            } => {
                let content = upload.unwrap_or_default();
                if format!("{:x}", md5::compute(&content)) != *checksum {
                    return Err(ConnectionError::LocalIo(format!(
                        "upload source for {path} changed since it was queued"
                    )));
                }
                let replaced = match self.nodes.get(path) {
                    Some(node) if node.item_type == ItemType::Folder => {
                        return Err(ConnectionError::conflict(path.clone(), self.item(path)));
                    }
                    Some(node) => {
                        if expected_etag.as_deref() != Some(node.etag.as_str()) {
                            return Err(ConnectionError::conflict(path.clone(), self.item(path)));
                        }
                        node.content.len() as u64
                    }
                    None => 0,
                };
                if let Some(quota) = self.quota {
                    let used = self.used_bytes().saturating_sub(replaced);
                    if used + content.len() as u64 > quota {
                        return Err(ConnectionError::QuotaExceeded);
                    }
                }
                self.require_parent_folder(path)?;
                self.write_file(path, content);
                Ok((RemoteResponse::Item(self.require(path)?), None))
            }
            RemoteAction::Download { path, target } => {
                let node = self.require_file(path)?;
                let item = self.require(path)?;
                Ok((
                    RemoteResponse::Downloaded {
                        item,
                        local: target.clone(),
                    },
                    Some((target.clone(), node.content)),
                ))
            }
            RemoteAction::Thumbnail { path, max_size } => {
                let node = self.require_file(path)?;
                let data = format!("thumbnail:{}:{max_size}", node.etag).into_bytes();
                Ok((
                    RemoteResponse::Thumbnail {
                        item: self.require(path)?,
                        data,
                    },
                    None,
                ))
            }
            RemoteAction::Share { path, options } => {
                let item = self.require(path)?;
                let id = self.next_id();
                let url = match options.kind {
                    ShareKind::PublicLink => Some(format!("https://share.invalid/s/{id}")),
                    _ => None,
                };
                let share = Share {
                    id: format!("share-{id}"),
                    path: path.clone(),
                    kind: options.kind.clone(),
                    url,
                    permissions: options.permissions,
                    expires_at: options.expires_at,
                };
                self.shares.push(share.clone());
                Ok((RemoteResponse::Shared { item, share }, None))
            }
        }
    }

    fn check_version(
        &self,
        path: &str,
        node: &Node,
        file_id: Option<&str>,
        expected_etag: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let id_mismatch = file_id.is_some_and(|id| id != node.file_id);
        let etag_mismatch = expected_etag.is_some_and(|etag| etag != node.etag);
        if id_mismatch || etag_mismatch {
            return Err(ConnectionError::conflict(path, self.item(path)));
        }
        Ok(())
    }

    fn create(&mut self, path: &str, item_type: ItemType) -> Result<(), ConnectionError> {
        if self.nodes.contains_key(path) {
            return Err(ConnectionError::conflict(path, self.item(path)));
        }
        self.require_parent_folder(path)?;
        let node = self.new_node(item_type, Vec::new());
        self.nodes.insert(path.to_string(), node);
        Ok(())
    }

    fn require(&self, path: &str) -> Result<ServerItem, ConnectionError> {
        self.item(path)
            .ok_or_else(|| ConnectionError::NotFound(path.to_string()))
    }

    fn require_file(&self, path: &str) -> Result<Node, ConnectionError> {
        match self.nodes.get(path) {
            Some(node) if node.item_type == ItemType::File => Ok(node.clone()),
            _ => Err(ConnectionError::NotFound(path.to_string())),
        }
    }

    fn require_parent_folder(&self, path: &str) -> Result<(), ConnectionError> {
        let parent = parent_of(path);
        match self.nodes.get(parent) {
            Some(node) if node.item_type == ItemType::Folder => Ok(()),
            _ => Err(ConnectionError::NotFound(parent.to_string())),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn next_etag(&mut self) -> String {
        let version = self.next_version;
        self.next_version += 1;
        format!("v{version}")
    }

    fn new_node(&mut self, item_type: ItemType, content: Vec<u8>) -> Node {
        let file_id = format!("f{}", self.next_id());
        Node {
            file_id,
            item_type,
            content,
            modified: now_secs(),
            etag: self.next_etag(),
            permissions: Permissions::ALL,
        }
    }

    fn ensure_folder_chain(&mut self, path: &str) {
        if path == "/" || self.nodes.contains_key(path) {
            return;
        }
        self.ensure_folder_chain(parent_of(path));
        let node = self.new_node(ItemType::Folder, Vec::new());
        self.nodes.insert(path.to_string(), node);
    }

    fn write_file(&mut self, path: &str, content: Vec<u8>) {
        let etag = self.next_etag();
        match self.nodes.get_mut(path) {
            Some(node) => {
                node.content = content;
                node.etag = etag;
                node.modified = now_secs();
            }
            None => {
                let mut node = self.new_node(ItemType::File, content);
                node.etag = etag;
                self.nodes.insert(path.to_string(), node);
            }
        }
    }

    fn subtree_paths(&self, root: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|path| in_subtree(path, root))
            .cloned()
            .collect()
    }

    fn move_subtree(&mut self, from: &str, to: &str) {
        for path in self.subtree_paths(from) {
            if let Some(node) = self.nodes.remove(&path) {
                let moved = format!("{to}{}", &path[from.len()..]);
                self.nodes.insert(moved, node);
            }
        }
        let etag = self.next_etag();
        if let Some(node) = self.nodes.get_mut(to) {
            node.etag = etag;
        }
        for share in self.shares.iter_mut() {
            if in_subtree(&share.path, from) {
                share.path = format!("{to}{}", &share.path[from.len()..]);
            }
        }
    }

    fn copy_subtree(&mut self, from: &str, to: &str) {
        for path in self.subtree_paths(from) {
            let Some(source) = self.nodes.get(&path).cloned() else {
                continue;
            };
            let copy = self.new_node(source.item_type, source.content);
            self.nodes
                .insert(format!("{to}{}", &path[from.len()..]), copy);
        }
    }

    fn remove_subtree(&mut self, root: &str) {
        for path in self.subtree_paths(root) {
            self.nodes.remove(&path);
        }
        self.shares.retain(|share| !in_subtree(&share.path, root));
    }

    fn used_bytes(&self) -> u64 {
        self.nodes
            .values()
            .map(|node| node.content.len() as u64)
            .sum()
    }

    fn find_by_file_id(&self, file_id: &str) -> Option<ServerItem> {
        self.nodes
            .iter()
            .find(|(_, node)| node.file_id == file_id)
            .and_then(|(path, _)| self.item(path))
    }

    fn root_item(&self) -> ServerItem {
        ServerItem {
            file_id: "root".into(),
            path: "/".into(),
            item_type: ItemType::Folder,
            size: None,
            modified: None,
            etag: "v0".into(),
            checksum: None,
            permissions: Permissions::ALL,
        }
    }

    fn item(&self, path: &str) -> Option<ServerItem> {
        let node = self.nodes.get(path)?;
        let is_file = node.item_type == ItemType::File;
        Some(ServerItem {
            file_id: node.file_id.clone(),
            path: path.to_string(),
            item_type: node.item_type,
            size: is_file.then_some(node.content.len() as u64),
            modified: Some(node.modified),
            etag: node.etag.clone(),
            checksum: is_file.then(|| format!("{:x}", md5::compute(&node.content))),
            permissions: node.permissions,
        })
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn in_subtree(path: &str, root: &str) -> bool {
    if root == "/" {
        return true;
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
