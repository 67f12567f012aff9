//! In-memory registry of shared items held by the sharing side.
//!
//! The registry is the only structure mutated from several tasks at once
//! (producer inserts vs. session reads), so every operation runs under one
//! mutex and queries return owned snapshots.

use crate::item::{now_millis, ItemKind, SharedItem};
use std::collections::HashMap;
use std::sync::Mutex;

/// Files larger than this are always presented individually.
pub const GROUP_SIZE_LIMIT: u64 = 10 * 1024 * 1024;

#[derive(Debug, Default)]
struct RegistryState {
    /// Items in insertion/update order
    items: Vec<SharedItem>,
    /// Last timestamp handed out, for strict monotonicity
    last_timestamp: i64,
}

/// Ordered, deduplicated collection of shared items.
#[derive(Debug, Default)]
pub struct ShareRegistry {
    state: Mutex<RegistryState>,
}

impl ShareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an item, replacing any existing item with the same identity.
    ///
    /// The stored copy is re-timestamped and moved to the end of the order.
    /// Returns the stored copy.
    pub fn put(&self, mut item: SharedItem) -> SharedItem {
        let key = item.key();
        let mut state = self.lock();

        state.items.retain(|existing| existing.key() != key);

        let timestamp = now_millis().max(state.last_timestamp + 1);
        state.last_timestamp = timestamp;
        item.timestamp = timestamp;

        state.items.push(item.clone());
        item
    }

    /// Share a file by locator.
    pub fn put_file(
        &self,
        locator: impl Into<String>,
        name: impl Into<String>,
        size: Option<u64>,
        mime_type: Option<String>,
    ) -> SharedItem {
        self.put(SharedItem::file(locator, name, size, mime_type))
    }

    /// Share a text snippet.
    pub fn put_text(&self, text: impl Into<String>) -> SharedItem {
        self.put(SharedItem::text(text))
    }

    /// All items with `timestamp > since`, in insertion/update order.
    pub fn list_since(&self, since: i64) -> Vec<SharedItem> {
        self.lock()
            .items
            .iter()
            .filter(|item| item.timestamp > since)
            .cloned()
            .collect()
    }

    /// Look up an offered item by kind and locator.
    ///
    /// FETCH serves only what this returns: a locator that was never
    /// offered must not be read, however valid it looks.
    pub fn find(&self, kind: ItemKind, locator: &str) -> Option<SharedItem> {
        self.lock()
            .items
            .iter()
            .find(|item| item.is_at(kind, locator))
            .cloned()
    }

    /// Drop every item.
    pub fn clear(&self) {
        self.lock().items.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Files sharing one MIME type, presented as a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemGroup {
    pub mime_type: String,
    pub items: Vec<SharedItem>,
}

/// A batch of items partitioned for presentation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemGroups {
    /// Items shown one by one, in input order
    pub individual: Vec<SharedItem>,
    /// Groups of two or more files, in order of first appearance
    pub groups: Vec<ItemGroup>,
}

impl ItemGroups {
    pub fn is_empty(&self) -> bool {
        self.individual.is_empty() && self.groups.is_empty()
    }

    /// Total number of items across individual entries and groups.
    pub fn item_count(&self) -> usize {
        self.individual.len() + self.groups.iter().map(|g| g.items.len()).sum::<usize>()
    }

    /// Every item, individual entries first, then each group in order.
    pub fn iter(&self) -> impl Iterator<Item = &SharedItem> {
        self.individual
            .iter()
            .chain(self.groups.iter().flat_map(|g| g.items.iter()))
    }
}

/// Groupable items have a known size within the limit and a known MIME type.
fn group_mime(item: &SharedItem) -> Option<&str> {
    if item.kind != ItemKind::File {
        return None;
    }
    match item.size {
        Some(size) if size <= GROUP_SIZE_LIMIT => item.mime_type.as_deref(),
        _ => None,
    }
}

/// Partition items into individual entries and per-MIME-type groups.
///
/// Texts, files of unknown size or MIME type, and files over
/// [`GROUP_SIZE_LIMIT`] stay individual. The rest are bucketed by exact MIME
/// type; single-item buckets are demoted back to individual.
pub fn group_items(items: Vec<SharedItem>) -> ItemGroups {
    let mut individual: Vec<(usize, SharedItem)> = Vec::new();
    let mut buckets: Vec<(String, Vec<(usize, SharedItem)>)> = Vec::new();
    let mut bucket_index: HashMap<String, usize> = HashMap::new();

    for (position, item) in items.into_iter().enumerate() {
        let Some(mime) = group_mime(&item).map(str::to_string) else {
            individual.push((position, item));
            continue;
        };

        match bucket_index.get(&mime) {
            Some(&index) => buckets[index].1.push((position, item)),
            None => {
                bucket_index.insert(mime.clone(), buckets.len());
                buckets.push((mime, vec![(position, item)]));
            }
        }
    }

    let mut groups = Vec::new();
    for (mime_type, mut members) in buckets {
        if members.len() == 1 {
            individual.extend(members.pop());
        } else {
            groups.push(ItemGroup {
                mime_type,
                items: members.into_iter().map(|(_, item)| item).collect(),
            });
        }
    }

    individual.sort_by_key(|(position, _)| *position);

    ItemGroups {
        individual: individual.into_iter().map(|(_, item)| item).collect(),
        groups,
    }
}
