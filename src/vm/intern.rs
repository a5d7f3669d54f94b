// Nova String Interning
// Canonicalizes equal-content strings so identity implies equality

use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::value::NovaString;

// Hashes by content (not the precomputed hash) so the set can be probed
// directly with a &str.
struct PoolEntry(Arc<NovaString>);

impl Borrow<str> for PoolEntry {
    fn borrow(&self) -> &str {
        self.0.as_str()
    }
}

impl Hash for PoolEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_str().hash(state);
    }
}

impl PartialEq for PoolEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for PoolEntry {}

/// Per-VM interned string pool. Interned strings live as long as the VM.
#[derive(Default)]
pub struct StringPool {
    pool: FxHashSet<PoolEntry>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical string for `s`, creating it on first sight.
    pub fn intern(&mut self, s: &str) -> Arc<NovaString> {
        if let Some(entry) = self.pool.get(s) {
            return entry.0.clone();
        }
        let string = Arc::new(NovaString::new(s));
        self.pool.insert(PoolEntry(string.clone()));
        string
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}
