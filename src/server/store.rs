use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;

/// Bounded in-memory item list. Ids are strictly increasing, so lookups can
/// binary search and eviction always drops the oldest item.
pub struct ItemStore {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    items: VecDeque<(u64, Value)>,
    last_id: u64,
}

impl ItemStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                last_id: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Store `fields` as a new item. The generated `id` (epoch milliseconds,
    /// bumped past the previous id on collision) and `createdAt` override any
    /// client-sent values.
    pub fn insert(&self, fields: Map<String, Value>) -> Value {
        let now = chrono::Utc::now();
        let mut inner = self.inner.lock();
        let id = (now.timestamp_millis().max(0) as u64).max(inner.last_id + 1);
        inner.last_id = id;

        let mut item = fields;
        item.insert("id".to_string(), Value::from(id));
        item.insert("createdAt".to_string(), Value::from(now.to_rfc3339()));
        let item = Value::Object(item);

        inner.items.push_back((id, item.clone()));
        while inner.items.len() > self.capacity {
            inner.items.pop_front();
        }
        item
    }

    pub fn get(&self, id: u64) -> Option<Value> {
        let inner = self.inner.lock();
        inner
            .items
            .binary_search_by_key(&id, |(item_id, _)| *item_id)
            .ok()
            .map(|idx| inner.items[idx].1.clone())
    }

    /// All items, oldest first.
    pub fn list(&self) -> Vec<Value> {
        self.inner
            .lock()
            .items
            .iter()
            .map(|(_, item)| item.clone())
            .collect()
    }
}
