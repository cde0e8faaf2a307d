//! A case-insensitive header multimap
//!
//! Keys are compared without regard to ASCII case. The spelling seen first
//! for a name is the one written back out on the wire, and names keep the
//! order in which they first appeared.

use indexmap::IndexMap;

/// A map of HTTP headers
#[derive(Debug, Clone, Default)]
pub struct HttpHeaders {
    map: IndexMap<String, Entry>
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    values: Vec<String>
}

fn key_of(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl HttpHeaders {
    pub fn new() -> HttpHeaders {
        HttpHeaders { map: IndexMap::new() }
    }

    /// Appends a value, keeping any existing ones
    pub fn add(&mut self, name: &str, value: &str) {
        self.map.entry(key_of(name))
            .or_insert_with(|| Entry { name: name.to_string(), values: Vec::new() })
            .values
            .push(value.to_string());
    }

    /// Replaces every value of `name` with `value`
    pub fn set(&mut self, name: &str, value: &str) {
        let entry = self.map.entry(key_of(name))
            .or_insert_with(|| Entry { name: name.to_string(), values: Vec::new() });
        entry.values.clear();
        entry.values.push(value.to_string());
    }

    /// The first value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&key_of(name))
            .and_then(|e| e.values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        match self.map.get(&key_of(name)) {
            Some(entry) => &entry.values,
            None => &[]
        }
    }

    /// All values of `name` joined with `", "`
    pub fn joined(&self, name: &str) -> Option<String> {
        self.map.get(&key_of(name)).map(|e| e.values.join(", "))
    }

    pub fn has(&self, name: &str) -> bool {
        self.map.contains_key(&key_of(name))
    }

    /// Number of distinct names
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// `(first-seen spelling, values)` in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.map.values().map(|e| (e.name.as_str(), e.values.as_slice()))
    }
}
