//! Capability-exposure bookkeeping.
//!
//! The serving side walks `Unannounced -> Announcing -> Ready` per channel;
//! the consuming side records announcements in an [`ApiLedger`] and polls it
//! through `wait_for_api`.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Where a relationship stands in the exposure handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureState {
    /// Nothing announced on this channel yet.
    Unannounced,
    /// Announcements are being written.
    Announcing,
    /// Every current namespace has been announced.
    Ready,
}

/// Per-channel record of the counterpart's announced namespaces.
pub struct ApiLedger {
    namespaces: Mutex<HashMap<String, Vec<String>>>,
}

impl ApiLedger {
    pub fn new() -> Self {
        Self {
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Record an announcement. Re-announcements overwrite the method list.
    pub fn record(&self, namespace: impl Into<String>, methods: Vec<String>) {
        let namespace = namespace.into();
        debug!(%namespace, methods = methods.len(), "recorded api announcement");
        self.lock().insert(namespace, methods);
    }

    /// Whether a namespace has been announced.
    pub fn has(&self, namespace: &str) -> bool {
        self.lock().contains_key(namespace)
    }

    /// The announced method list for a namespace.
    pub fn methods_of(&self, namespace: &str) -> Option<Vec<String>> {
        self.lock().get(namespace).cloned()
    }

    /// Every announced namespace.
    pub fn namespaces(&self) -> Vec<String> {
        let mut out: Vec<String> = self.lock().keys().cloned().collect();
        out.sort();
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ApiLedger {
    fn default() -> Self {
        Self::new()
    }
}
