/// Order/dedup normalizer: raw JSON collection -> canonically ordered items
use crate::model::Item;
use serde_json::Value;
use std::cmp::Ordering;
use tracing::warn;

/// Entries of a raw collection: a bare array or a paginated `{results: [...]}`
/// envelope. Anything else yields `None`.
pub fn collection_entries(raw: &Value) -> Option<&Vec<Value>> {
    match raw {
        Value::Array(entries) => Some(entries),
        Value::Object(map) => map.get("results").and_then(Value::as_array),
        _ => None,
    }
}

/// Canonical order: timestamp ascending, ties by id. If either timestamp
/// fails to parse, compare ids only.
pub fn compare_items(a: &Item, b: &Item) -> Ordering {
    match (a.timestamp(), b.timestamp()) {
        (Some(ta), Some(tb)) => ta.cmp(&tb).then_with(|| a.id.compare(&b.id)),
        _ => a.id.compare(&b.id),
    }
}

/// Stable in-place sort by `compare_items`.
///
/// The id fallback makes the comparator non-transitive when well-formed and
/// malformed timestamps are mixed, which `slice::sort_by` may panic on, so this
/// is a plain insertion sort. Merges append a handful of items to an already
/// ordered collection, which keeps it close to linear.
pub fn sort_items(items: &mut [Item]) {
    for i in 1..items.len() {
        let mut j = i;
        while j > 0 && compare_items(&items[j - 1], &items[j]) == Ordering::Greater {
            items.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Decode and order a raw collection. Entries that are not items are dropped.
/// The input is never modified.
pub fn normalize(raw: &Value) -> Vec<Item> {
    let Some(entries) = collection_entries(raw) else {
        if !raw.is_null() {
            warn!("Ignoring collection with unexpected shape");
        }
        return Vec::new();
    };

    let mut items: Vec<Item> = entries
        .iter()
        .filter_map(|entry| match serde_json::from_value::<Item>(entry.clone()) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Dropping malformed item: {}", e);
                None
            }
        })
        .collect();

    sort_items(&mut items);
    items
}
