use std::collections::HashMap;
use std::sync::Mutex;

/// Best-effort key/value cache shared between requests. Implementations
/// never fail: an unavailable cache behaves like a permanent miss.
pub trait SharedCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// Process-wide cache kept in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SharedCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }
}

/// Cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl SharedCache for NullCache {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn set(&self, _key: &str, _value: &str) {}
}

/// Key layout `resourceloader:<parts joined by ':'>`. `%` and `:` inside a
/// part are percent-escaped so distinct part lists never share a key.
pub fn cache_key(parts: &[&str]) -> String {
    let mut key = String::from("resourceloader");
    for part in parts {
        key.push(':');
        key.push_str(&part.replace('%', "%25").replace(':', "%3A"));
    }
    key
}
