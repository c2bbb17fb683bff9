//! Keyed store of live process/channel handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

/// Something the registry can tear down.
///
/// `close` must be idempotent and must tolerate the underlying resource
/// already being gone — it logs rather than fails.
pub trait Handle: Send + Sync {
    fn close(&self);
}

/// Maps a logical process/window id to its live handle.
///
/// The broker routes handshake messages through it; hubs use it to fan
/// event envelopes out to every currently-attached channel.
pub struct ProcessRegistry<H> {
    entries: Mutex<HashMap<String, Arc<H>>>,
}

impl<H: Handle> ProcessRegistry<H> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handle, replacing (and closing) any previous one.
    pub fn set(&self, id: impl Into<String>, handle: Arc<H>) {
        let id = id.into();
        let previous = self.lock().insert(id.clone(), handle);
        if let Some(previous) = previous {
            warn!(%id, "replacing existing handle; closing the old one");
            previous.close();
        } else {
            debug!(%id, "registered handle");
        }
    }

    /// Look up a handle.
    pub fn get(&self, id: &str) -> Option<Arc<H>> {
        self.lock().get(id).cloned()
    }

    /// Whether an id is registered.
    pub fn has(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Every registered (id, handle) pair.
    pub fn all(&self) -> Vec<(String, Arc<H>)> {
        self.lock()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    /// Registered ids.
    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Tear down and remove a handle.
    ///
    /// Idempotent: destroying an unknown id is a logged no-op.
    pub fn destroy(&self, id: &str) {
        let removed = self.lock().remove(id);
        match removed {
            Some(handle) => {
                debug!(%id, "destroying handle");
                handle.close();
            }
            None => debug!(%id, "destroy for unknown id ignored"),
        }
    }

    /// Remove the entry without closing it.
    ///
    /// Used when the handle has already torn itself down (e.g. an engine
    /// whose pump observed EOF).
    pub fn remove(&self, id: &str) -> Option<Arc<H>> {
        self.lock().remove(id)
    }

    /// Tear down every handle.
    pub fn destroy_all(&self) {
        let drained: Vec<(String, Arc<H>)> = self.lock().drain().collect();
        for (id, handle) in drained {
            debug!(%id, "destroying handle");
            handle.close();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<H>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<H: Handle> Default for ProcessRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
