//! Ordered, keyed mirror of one remote collection.

use std::cmp::Ordering;

use indexmap::IndexMap;
use serde_json::Value;

use crate::types::{CollectionRef, EntityRecord};

/// Where new records land in the cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CacheOrder {
    /// Insertion order.
    #[default]
    Append,
    /// Newest first.
    Prepend,
    /// Kept sorted by a field; records missing the field sort last.
    SortBy { field: String, descending: bool },
}

/// Records keyed by id; an id appears at most once. Updates keep a record's
/// position unless the order is `SortBy`.
#[derive(Debug, Clone)]
pub struct EntityCollectionCache {
    collection: CollectionRef,
    order: CacheOrder,
    records: IndexMap<String, EntityRecord>,
}

impl EntityCollectionCache {
    pub fn new(collection: CollectionRef, order: CacheOrder) -> Self {
        Self {
            collection,
            order,
            records: IndexMap::new(),
        }
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    /// Insert or replace. Returns the previous record with the same id.
    pub fn upsert(&mut self, record: EntityRecord) -> Option<EntityRecord> {
        if let Some(existing) = self.records.get_mut(&record.id) {
            let previous = std::mem::replace(existing, record);
            self.resort();
            return Some(previous);
        }

        match self.order {
            CacheOrder::Prepend => {
                self.records.shift_insert(0, record.id.clone(), record);
            }
            CacheOrder::Append | CacheOrder::SortBy { .. } => {
                self.records.insert(record.id.clone(), record);
            }
        }
        self.resort();
        None
    }

    pub fn remove(&mut self, id: &str) -> Option<EntityRecord> {
        self.records.shift_remove(id)
    }

    /// Replace everything with a snapshot listed in store order.
    pub fn replace_all(&mut self, records: Vec<EntityRecord>) {
        self.records.clear();
        let ordered: Box<dyn Iterator<Item = EntityRecord>> = match self.order {
            CacheOrder::Prepend => Box::new(records.into_iter().rev()),
            _ => Box::new(records.into_iter()),
        };
        for record in ordered {
            self.records.insert(record.id.clone(), record);
        }
        self.resort();
    }

    pub fn get(&self, id: &str) -> Option<&EntityRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    pub fn records(&self) -> Vec<EntityRecord> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn resort(&mut self) {
        let CacheOrder::SortBy { field, descending } = &self.order else {
            return;
        };
        let descending = *descending;
        self.records.sort_by(|_, a, _, b| {
            let ordering = compare_fields(a.get(field), b.get(field));
            if descending {
                // Missing values stay last either way.
                match (a.get(field), b.get(field)) {
                    (Some(_), Some(_)) => ordering.reverse(),
                    _ => ordering,
                }
            } else {
                ordering
            }
        });
    }
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => compare_values(a, b),
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, value: Value) -> EntityRecord {
        EntityRecord::with_id(id, value.as_object().cloned().unwrap())
    }

    fn ids(cache: &EntityCollectionCache) -> Vec<String> {
        cache.iter().map(|r| r.id.clone()).collect()
    }

    fn cache(order: CacheOrder) -> EntityCollectionCache {
        EntityCollectionCache::new(CollectionRef::new("alice", "gastos"), order)
    }

    #[test]
    fn test_append_keeps_insertion_order() {
        let mut cache = cache(CacheOrder::Append);
        cache.upsert(record("a", json!({})));
        cache.upsert(record("b", json!({})));
        cache.upsert(record("c", json!({})));
        assert_eq!(ids(&cache), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_prepend_puts_newest_first() {
        let mut cache = cache(CacheOrder::Prepend);
        cache.upsert(record("a", json!({})));
        cache.upsert(record("b", json!({})));
        assert_eq!(ids(&cache), vec!["b", "a"]);
    }

    #[test]
    fn test_update_keeps_position_and_never_duplicates() {
        let mut cache = cache(CacheOrder::Append);
        cache.upsert(record("a", json!({"valor": 1})));
        cache.upsert(record("b", json!({"valor": 2})));
        let previous = cache.upsert(record("a", json!({"valor": 3})));

        assert_eq!(previous.unwrap().get("valor"), Some(&json!(1)));
        assert_eq!(ids(&cache), vec!["a", "b"]);
        assert_eq!(cache.get("a").unwrap().get("valor"), Some(&json!(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_sort_by_field_descending_with_missing_last() {
        let mut cache = cache(CacheOrder::SortBy {
            field: "data".to_string(),
            descending: true,
        });
        cache.upsert(record("old", json!({"data": "2026-01-01"})));
        cache.upsert(record("none", json!({})));
        cache.upsert(record("new", json!({"data": "2026-03-01"})));
        assert_eq!(ids(&cache), vec!["new", "old", "none"]);

        cache.upsert(record("old", json!({"data": "2026-04-01"})));
        assert_eq!(ids(&cache), vec!["old", "new", "none"]);
    }

    #[test]
    fn test_sort_by_numeric_ascending() {
        let mut cache = cache(CacheOrder::SortBy {
            field: "valor".to_string(),
            descending: false,
        });
        cache.upsert(record("ten", json!({"valor": 10})));
        cache.upsert(record("two", json!({"valor": 2.5})));
        cache.upsert(record("nine", json!({"valor": 9})));
        assert_eq!(ids(&cache), vec!["two", "nine", "ten"]);
    }

    #[test]
    fn test_replace_all_respects_prepend() {
        let mut cache = cache(CacheOrder::Prepend);
        cache.upsert(record("stale", json!({})));
        cache.replace_all(vec![record("first", json!({})), record("second", json!({}))]);
        assert_eq!(ids(&cache), vec!["second", "first"]);
        assert!(!cache.contains("stale"));
    }

    #[test]
    fn test_remove() {
        let mut cache = cache(CacheOrder::Append);
        cache.upsert(record("a", json!({})));
        cache.upsert(record("b", json!({})));
        assert!(cache.remove("a").is_some());
        assert!(cache.remove("a").is_none());
        assert_eq!(ids(&cache), vec!["b"]);
    }
}
