use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::util::lock_unpoisoned;

/// Persistent key/value storage, for example the cookies of a session.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value);

    fn delete(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        lock_unpoisoned(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        lock_unpoisoned(&self.values).insert(key.to_owned(), value);
    }

    fn delete(&self, key: &str) {
        lock_unpoisoned(&self.values).remove(key);
    }
}
