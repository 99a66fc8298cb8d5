use std::collections::{HashMap, HashSet};

use crate::sync::item_store::Item;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedItem {
    pub from: String,
    /// State after the move.
    pub item: Item,
}

/// Difference between two snapshots of a query, keyed by `local_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub inserted: Vec<Item>,
    pub updated: Vec<Item>,
    pub removed: Vec<Item>,
    pub moved: Vec<MovedItem>,
}

impl ChangeSet {
    pub fn between(before: &[Item], after: &[Item]) -> Self {
        let previous: HashMap<&str, &Item> = before
            .iter()
            .map(|item| (item.local_id.as_str(), item))
            .collect();
        let mut changes = ChangeSet::default();
        for item in after {
            match previous.get(item.local_id.as_str()) {
                None => changes.inserted.push(item.clone()),
                Some(old) if old.path != item.path => changes.moved.push(MovedItem {
                    from: old.path.clone(),
                    item: item.clone(),
                }),
                Some(old) if old.fingerprint() != item.fingerprint() => {
                    changes.updated.push(item.clone())
                }
                Some(_) => {}
            }
        }
        let current: HashSet<&str> = after.iter().map(|item| item.local_id.as_str()).collect();
        changes.removed = before
            .iter()
            .filter(|item| !current.contains(item.local_id.as_str()))
            .cloned()
            .collect();
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.moved.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.removed.len() + self.moved.len()
    }

    /// Applies the change set to a previously delivered snapshot.
    pub fn apply_to(&self, items: &mut Vec<Item>) {
        let gone: HashSet<&str> = self
            .removed
            .iter()
            .map(|item| item.local_id.as_str())
            .collect();
        items.retain(|item| !gone.contains(item.local_id.as_str()));
        let replaced = self
            .updated
            .iter()
            .chain(self.moved.iter().map(|moved| &moved.item));
        for change in replaced {
            if let Some(slot) = items.iter_mut().find(|item| item.local_id == change.local_id) {
                *slot = change.clone();
            }
        }
        items.extend(self.inserted.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudmirror_core::ItemType;

    fn moved_to(item: &Item, path: &str) -> Item {
        let mut moved = item.clone();
        moved.path = path.into();
        moved.name = path.rsplit('/').next().unwrap_or_default().into();
        moved
    }

    #[test]
    fn rename_is_a_move_not_remove_insert() {
        let a = Item::placeholder("/a", ItemType::Folder);
        let changes = ChangeSet::between(&[a.clone()], &[moved_to(&a, "/b")]);
        assert!(changes.inserted.is_empty());
        assert!(changes.removed.is_empty());
        assert_eq!(changes.moved.len(), 1);
        assert_eq!(changes.moved[0].from, "/a");
        assert_eq!(changes.moved[0].item.path, "/b");
    }

    #[test]
    fn detects_inserts_updates_and_removals() {
        let keep = Item::placeholder("/keep", ItemType::File);
        let gone = Item::placeholder("/gone", ItemType::File);
        let new = Item::placeholder("/new", ItemType::File);
        let mut touched = keep.clone();
        touched.etag = Some("v2".into());

        let changes = ChangeSet::between(&[keep, gone.clone()], &[touched.clone(), new.clone()]);
        assert_eq!(changes.inserted, vec![new]);
        assert_eq!(changes.updated, vec![touched]);
        assert_eq!(changes.removed, vec![gone]);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn identical_snapshots_produce_nothing() {
        let items = vec![Item::placeholder("/x", ItemType::File)];
        assert!(ChangeSet::between(&items, &items).is_empty());
    }

    #[test]
    fn apply_to_reproduces_the_new_snapshot() {
        let a = Item::placeholder("/a", ItemType::File);
        let b = Item::placeholder("/b", ItemType::File);
        let c = Item::placeholder("/c", ItemType::File);
        let before = vec![a.clone(), b.clone()];
        let after = vec![moved_to(&a, "/z"), c];

        let mut replayed = before.clone();
        ChangeSet::between(&before, &after).apply_to(&mut replayed);
        replayed.sort_by(|x, y| x.path.cmp(&y.path));
        let mut expected = after.clone();
        expected.sort_by(|x, y| x.path.cmp(&y.path));
        assert_eq!(replayed, expected);
    }
}
