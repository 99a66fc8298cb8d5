//! Live queries over the item store.
//!
//! Every started query owns one delivery task. The task wakes on each vault
//! change generation, re-evaluates the query against a fresh read snapshot
//! and sends the difference to the previous snapshot. Deliveries of one
//! query are strictly ordered; different queries never wait on each other.

mod changeset;
mod filter;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use changeset::{ChangeSet, MovedItem};
pub use filter::{FilterCondition, QueryFilter, wildcard_match};

use crate::error::{CoreError, ErrorKind};
use crate::sync::item_store::Item;
use crate::sync::paths::normalize_remote_path;
use crate::sync::vault::Vault;

pub type QueryId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// A single item.
    Item(String),
    /// Direct children of a folder.
    Folder(String),
    /// Every descendant of a folder.
    Subtree(String),
}

impl QueryScope {
    fn path(&self) -> &str {
        match self {
            QueryScope::Item(path) | QueryScope::Folder(path) | QueryScope::Subtree(path) => path,
        }
    }

    fn with_path(&self, path: String) -> Self {
        match self {
            QueryScope::Item(_) => QueryScope::Item(path),
            QueryScope::Folder(_) => QueryScope::Folder(path),
            QueryScope::Subtree(_) => QueryScope::Subtree(path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub scope: QueryScope,
    pub filter: QueryFilter,
    /// Deliver snapshots folders first, then by name.
    pub sorted: bool,
}

impl Query {
    pub fn item(path: impl Into<String>) -> Self {
        Self::new(QueryScope::Item(path.into()))
    }

    pub fn folder(path: impl Into<String>) -> Self {
        Self::new(QueryScope::Folder(path.into()))
    }

    pub fn subtree(path: impl Into<String>) -> Self {
        Self::new(QueryScope::Subtree(path.into()))
    }

    fn new(scope: QueryScope) -> Self {
        Self {
            scope,
            filter: QueryFilter::default(),
            sorted: false,
        }
    }

    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sorted(mut self) -> Self {
        self.sorted = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryUpdate {
    Initial(Vec<Item>),
    Changes(ChangeSet),
}

/// Subscriber end of a running query. Dropping it stops the query.
pub struct QueryHandle {
    id: QueryId,
    updates: mpsc::UnboundedReceiver<QueryUpdate>,
    stop: CancellationToken,
}

impl QueryHandle {
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Next update; `None` once the query stopped and its queue is drained.
    pub async fn next_update(&mut self) -> Option<QueryUpdate> {
        self.updates.recv().await
    }

    /// Update already waiting, if any.
    pub fn try_next_update(&mut self) -> Option<QueryUpdate> {
        self.updates.try_recv().ok()
    }

    /// No new delivery starts after this returns; one already sent may
    /// still be received.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Stream for QueryHandle {
    type Item = QueryUpdate;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().updates.poll_recv(cx)
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

type Registry = Arc<Mutex<HashMap<QueryId, CancellationToken>>>;

pub struct QueryEngine {
    vault: Arc<Vault>,
    next_id: AtomicU64,
    running: Registry,
}

impl QueryEngine {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self {
            vault,
            next_id: AtomicU64::new(1),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<QueryId, CancellationToken>> {
        lock_registry(&self.running)
    }

    /// Starts `query`. The initial snapshot is taken before this returns and
    /// is the first update on the handle.
    pub async fn start_query(&self, query: Query) -> Result<QueryHandle, CoreError> {
        let path = normalize_remote_path(query.scope.path())?;
        let query = Query {
            scope: query.scope.with_path(path),
            ..query
        };
        // subscribe first so no commit between snapshot and task start is lost
        let mut generation = self.vault.subscribe();
        generation.borrow_and_update();
        let snapshot = evaluate(&self.vault, &query).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        let (sender, updates) = mpsc::unbounded_channel();
        // receiver is alive, so this cannot fail
        let _ = sender.send(QueryUpdate::Initial(snapshot.clone()));
        self.running().insert(id, stop.clone());
        debug!(query = id, scope = ?query.scope, items = snapshot.len(), "query started");

        tokio::spawn(deliver(
            DeliveryTask {
                id,
                vault: Arc::clone(&self.vault),
                query,
                baseline: snapshot,
                generation,
                sender,
                stop: stop.clone(),
            },
            Arc::clone(&self.running),
        ));
        Ok(QueryHandle { id, updates, stop })
    }

    /// Unregisters a query. Unknown ids are ignored.
    pub fn stop_query(&self, id: QueryId) {
        if let Some(stop) = self.running().remove(&id) {
            stop.cancel();
            debug!(query = id, "query stopped");
        }
    }

    pub fn stop_all(&self) {
        for (_, stop) in self.running().drain() {
            stop.cancel();
        }
    }

    pub fn active(&self) -> usize {
        self.running().len()
    }
}

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<QueryId, CancellationToken>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DeliveryTask {
    id: QueryId,
    vault: Arc<Vault>,
    query: Query,
    baseline: Vec<Item>,
    generation: watch::Receiver<u64>,
    sender: mpsc::UnboundedSender<QueryUpdate>,
    stop: CancellationToken,
}

async fn deliver(mut task: DeliveryTask, registry: Registry) {
    loop {
        tokio::select! {
            biased;
            _ = task.stop.cancelled() => break,
            _ = task.sender.closed() => break,
            changed = task.generation.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        task.generation.borrow_and_update();

        let current = match evaluate(&task.vault, &task.query).await {
            Ok(items) => items,
            Err(err) if matches!(err.kind(), ErrorKind::Closed | ErrorKind::StorageCorruption) => {
                debug!(query = task.id, error = %err, "vault gone; ending query");
                break;
            }
            Err(err) => {
                warn!(query = task.id, error = %err, "query evaluation failed");
                continue;
            }
        };
        let changes = ChangeSet::between(&task.baseline, &current);
        task.baseline = current;
        if changes.is_empty() {
            continue;
        }
        if task.stop.is_cancelled() || task.sender.send(QueryUpdate::Changes(changes)).is_err() {
            break;
        }
    }
    lock_registry(&registry).remove(&task.id);
}

async fn evaluate(vault: &Vault, query: &Query) -> Result<Vec<Item>, CoreError> {
    let mut read = vault.read().await?;
    let mut items = match &query.scope {
        QueryScope::Item(path) => read.items().lookup(path).await?.into_iter().collect(),
        QueryScope::Folder(path) => read.items().list_children(path).await?,
        QueryScope::Subtree(path) => read.items().list_subtree(path).await?,
    };
    drop(read);
    let case = vault.case();
    items.retain(|item| query.filter.matches(item, case));
    if query.sorted {
        items.sort_by(|a, b| {
            b.is_folder()
                .cmp(&a.is_folder())
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.name.cmp(&b.name))
        });
    }
    Ok(items)
}

#[cfg(test)]
#[path = "query_tests.rs"]
mod tests;
