/// Merge engine: snapshot + incremental deliveries -> one ordered, duplicate-free collection
use crate::model::{Id, Item};
use crate::normalize::{compare_items, normalize, sort_items};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// A locally sent item awaiting server confirmation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingItem {
    pub key: Uuid,
    pub content: String,
    pub sender_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

/// Collection state for one view instance. Created on mount, dropped on teardown.
#[derive(Debug, Default)]
pub struct MergeEngine {
    items: Vec<Item>,
    seen: HashSet<Id>,
    pending: Vec<PendingItem>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the collection with a snapshot and reset the seen-id set.
    pub fn seed(&mut self, raw: &Value) {
        let mut items = normalize(raw);
        let mut seen = HashSet::with_capacity(items.len());
        // A snapshot can itself repeat an id across page boundaries.
        items.retain(|item| seen.insert(item.id.clone()));
        debug!("Seeded collection with {} items", items.len());
        self.items = items;
        self.seen = seen;
    }

    /// Merge a batch. Returns the newly admitted items, or `None` if nothing changed.
    pub fn merge_incremental(&mut self, raw: &Value) -> Option<Vec<Item>> {
        let mut fresh = Vec::new();
        for item in normalize(raw) {
            if self.seen.contains(&item.id) {
                continue;
            }
            self.seen.insert(item.id.clone());
            self.settle_pending(&item);
            fresh.push(item);
        }

        if fresh.is_empty() {
            return None;
        }

        self.items.extend(fresh.iter().cloned());
        sort_items(&mut self.items);
        debug!("Merged {} fresh items ({} total)", fresh.len(), self.items.len());
        Some(fresh)
    }

    /// Drop the oldest pending entry this delivered item echoes: same sender,
    /// same content. Items without a sender never match.
    fn settle_pending(&mut self, item: &Item) {
        let Some(sender) = &item.sender_id else {
            return;
        };
        let echoed = self.pending.iter().position(|p| {
            p.content.trim() == item.content.trim()
                && p.sender_id
                    .as_ref()
                    .is_some_and(|mine| mine.compare(sender) == Ordering::Equal)
        });
        if let Some(pos) = echoed {
            let settled = self.pending.remove(pos);
            debug!("Feed echoed pending item {} as {}", settled.key, item.id);
        }
    }

    /// Admit one server-confirmed item. Returns false if the id was already seen.
    pub fn admit(&mut self, item: Item) -> bool {
        if !self.seen.insert(item.id.clone()) {
            return false;
        }
        let pos = self
            .items
            .iter()
            .rposition(|existing| compare_items(existing, &item) != Ordering::Greater)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.items.insert(pos, item);
        true
    }

    /// Patch an existing item in place. Unknown ids are ignored.
    pub fn apply_point_update(&mut self, id: &Id, patch: &Map<String, Value>) -> bool {
        match self.items.iter_mut().find(|item| &item.id == id) {
            Some(item) => {
                item.apply_patch(patch);
                true
            }
            None => {
                debug!("Dropping update for unseen item {}", id);
                false
            }
        }
    }

    /// Remove an item if present. The id stays in the seen set.
    pub fn apply_point_removal(&mut self, id: &Id) -> bool {
        let before = self.items.len();
        self.items.retain(|item| &item.id != id);
        before != self.items.len()
    }

    /// Show a locally sent item until the server confirms it.
    pub fn push_pending(&mut self, content: &str, sender_id: Option<Id>) -> Uuid {
        let key = Uuid::new_v4();
        self.pending.push(PendingItem {
            key,
            content: content.to_string(),
            sender_id,
            created_at: Utc::now(),
        });
        key
    }

    /// Swap a pending item for its confirmed copy. Returns whether the
    /// confirmed item was newly admitted (false if the feed beat the response).
    pub fn confirm_pending(&mut self, key: Uuid, item: Item) -> bool {
        self.discard_pending(key);
        self.admit(item)
    }

    pub fn discard_pending(&mut self, key: Uuid) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.key != key);
        before != self.pending.len()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn pending(&self) -> &[PendingItem] {
        &self.pending
    }

    pub fn get(&self, id: &Id) -> Option<&Item> {
        self.items.iter().find(|item| &item.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Latest parseable timestamp in the collection
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        latest_timestamp(&self.items)
    }
}

/// Latest parseable timestamp among `items`
pub fn latest_timestamp(items: &[Item]) -> Option<DateTime<Utc>> {
    items.iter().filter_map(Item::timestamp).max()
}
