//! Weak instance registry
//!
//! Native callbacks arrive carrying only the raw instance key; this registry
//! is how they rediscover the managed wrapper that owns the calling
//! instance. It is process-wide shared state and the one place the bridge
//! takes a lock: lookups run under the read lock, and a lookup that finds a
//! dead weak entry escalates to the write lock to purge it so dead entries
//! do not accumulate.
//!
//! The type is generic because hosts instantiate the same shape for their
//! own naming schemes (e.g. `WeakRegistry<String, Interp>` as the remote
//! lookup backing store).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use selune_vm::VmKey;

use crate::interp::Interp;

/// A concurrent map from keys to non-owning references.
///
/// Storing a value does not keep it alive; `get` returns `None` once every
/// strong reference elsewhere has been dropped.
pub struct WeakRegistry<K, V> {
    entries: RwLock<HashMap<K, Weak<V>>>,
}

impl<K: Eq + Hash, V> WeakRegistry<K, V> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Associate `key` with a non-owning reference to `value`, replacing any
    /// previous association.
    pub fn store(&self, key: K, value: &Arc<V>) {
        self.entries.write().insert(key, Arc::downgrade(value));
    }

    /// Remove the association for `key`, if any.
    pub fn remove(&self, key: &K) {
        self.entries.write().remove(key);
    }

    /// Look up the live value associated with `key`.
    ///
    /// A dead entry is removed on the way out, which requires escalating to
    /// the write lock; the entry is re-checked there since another thread
    /// may have re-stored the key in between.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(weak) => {
                    if let Some(value) = weak.upgrade() {
                        return Some(value);
                    }
                    // dead entry, fall through to purge it
                }
                None => return None,
            }
        }

        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(weak) => match weak.upgrade() {
                Some(value) => Some(value),
                None => {
                    entries.remove(key);
                    None
                }
            },
            None => None,
        }
    }

    /// Number of associations currently stored, dead entries included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry holds no associations.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K: Eq + Hash, V> Default for WeakRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide instance registry, keyed by raw instance identity.
pub(crate) fn instances() -> &'static WeakRegistry<VmKey, Interp> {
    static INSTANCES: Lazy<WeakRegistry<VmKey, Interp>> = Lazy::new(WeakRegistry::new);
    &INSTANCES
}
