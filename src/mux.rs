use std::sync::RwLock;

use rustc_hash::FxHashMap;

use crate::pattern;

/// Backend addresses registered for one URL pattern.
struct PatternEntry {
    pattern: String,
    addresses: Vec<String>,
}

/// Concurrent routing table mapping an HTTP method to an ordered list of
/// URL patterns, each bound to the backend addresses that can serve it.
///
/// Entries are kept in insertion order, and [`match_route`](Self::match_route)
/// returns the first entry whose pattern matches, so more specific patterns
/// must be registered after broader ones that also match.
#[derive(Default)]
pub struct ExchangeMux {
    routes: RwLock<FxHashMap<String, Vec<PatternEntry>>>,
}

impl ExchangeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` as a backend for the method and pattern. Method
    /// tokens are normalized to uppercase. Re-adding an identical
    /// (method, pattern, address) triple is a no-op.
    pub fn add(&self, method: &str, pattern: &str, address: &str) {
        let method = method.to_ascii_uppercase();

        let mut routes = self.routes.write().unwrap();
        let entries = routes.entry(method).or_default();

        if let Some(entry) = entries.iter_mut().find(|entry| entry.pattern == pattern) {
            if !entry.addresses.iter().any(|existing| existing == address) {
                entry.addresses.push(address.to_owned());
            }
            return;
        }

        entries.push(PatternEntry {
            pattern: pattern.to_owned(),
            addresses: vec![address.to_owned()],
        });
    }

    /// Unregisters `address` from the method and pattern, dropping the whole
    /// entry when its last address goes. Unknown entries are ignored.
    pub fn remove(&self, method: &str, pattern: &str, address: &str) {
        let method = method.to_ascii_uppercase();

        let mut routes = self.routes.write().unwrap();
        let Some(entries) = routes.get_mut(&method) else { return };
        let Some(position) = entries.iter().position(|entry| entry.pattern == pattern) else {
            return;
        };

        entries[position].addresses.retain(|existing| existing != address);
        if entries[position].addresses.is_empty() {
            entries.remove(position);
        }
    }

    /// Finds the backend addresses for a request, walking the method's
    /// patterns in insertion order and returning the first match. The address
    /// list is copied out so no lock is held while the caller does I/O.
    pub fn match_route(&self, method: &str, path: &str) -> Option<Vec<String>> {
        let routes = self.routes.read().unwrap();
        let entries = routes.get(method)?;

        entries
            .iter()
            .find(|entry| pattern::matches(&entry.pattern, path))
            .map(|entry| entry.addresses.clone())
    }
}
