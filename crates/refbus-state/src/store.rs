use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Result, StateError};

/// A single state-change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// The key that changed.
    pub key: String,
    /// The new value.
    pub value: Value,
}

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    /// `None` subscribes to every key (used by the RPC event forwarder).
    keys: Option<Vec<String>>,
    callback: Callback,
}

struct Inner {
    state: HashMap<String, Value>,
    defaults: HashMap<String, Value>,
    /// Registration order is dispatch order.
    listeners: Vec<ListenerEntry>,
    next_listener_id: u64,
    children: Vec<Subscription>,
    disposed: bool,
}

/// Observable key/value state container.
///
/// Cloning a `StateStore` yields another handle to the same state; the store
/// lives as long as any handle does. State mutation and listener bookkeeping
/// are mutex-guarded, but listener callbacks run *outside* the lock so a
/// listener may itself fire the store (runaway recursion is not guarded and
/// will abort via stack exhaustion rather than being swallowed).
#[derive(Clone)]
pub struct StateStore {
    group_id: String,
    inner: Arc<Mutex<Inner>>,
}

impl StateStore {
    /// Create an empty store identified by `group_id`.
    ///
    /// The group id becomes the event-signal prefix when the store is
    /// exposed over RPC.
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            inner: Arc::new(Mutex::new(Inner {
                state: HashMap::new(),
                defaults: HashMap::new(),
                listeners: Vec::new(),
                next_listener_id: 0,
                children: Vec::new(),
                disposed: false,
            })),
        }
    }

    /// Create a store with default values.
    ///
    /// Defaults both seed the initial state and define the "not yet
    /// deviated" baseline that [`StateStore::already`] compares against.
    pub fn with_defaults(group_id: impl Into<String>, defaults: Value) -> Result<Self> {
        let map = as_object(defaults)?;
        let defaults: HashMap<String, Value> = map.into_iter().collect();
        Ok(Self {
            group_id: group_id.into(),
            inner: Arc::new(Mutex::new(Inner {
                state: defaults.clone(),
                defaults,
                listeners: Vec::new(),
                next_listener_id: 0,
                children: Vec::new(),
                disposed: false,
            })),
        })
    }

    /// The group id this store publishes under.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Current value of a key, if set.
    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.lock();
        inner.state.get(key).cloned()
    }

    /// Snapshot of the full state map.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        let inner = self.lock();
        inner.state.clone()
    }

    /// Keys whose current value deviates from their default.
    ///
    /// This is the set a late subscriber has missed; the RPC layer serves it
    /// to remote `already` registrations.
    pub fn deviations(&self) -> Vec<(String, Value)> {
        let inner = self.lock();
        let mut out: Vec<(String, Value)> = inner
            .state
            .iter()
            .filter(|(key, value)| inner.defaults.get(key.as_str()) != Some(value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Apply a patch object and notify listeners of every patched key.
    pub fn fire(&self, patch: Value) -> Result<()> {
        self.apply(patch, false)
    }

    /// Apply a patch object, suppressing notification for unchanged keys.
    ///
    /// Deep equality on the JSON value decides "unchanged"; an equal re-fire
    /// invokes no listener and emits no downstream RPC event.
    pub fn fire_if_changed(&self, patch: Value) -> Result<()> {
        self.apply(patch, true)
    }

    /// Fire a single key as a tick signal.
    ///
    /// The key's previous integer value is incremented (missing or
    /// non-numeric counts as 0), so every tick is a distinct value and is
    /// never suppressed by change detection.
    pub fn tick(&self, key: &str) {
        let mut notifications: Vec<(Callback, ChangeEvent)> = Vec::new();
        {
            let mut inner = self.lock();
            let next = inner
                .state
                .get(key)
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .wrapping_add(1);
            inner.state.insert(key.to_string(), Value::from(next));

            let event = ChangeEvent {
                key: key.to_string(),
                value: Value::from(next),
            };
            for entry in &inner.listeners {
                if entry.watches(key) {
                    notifications.push((Arc::clone(&entry.callback), event.clone()));
                }
            }
        }
        for (callback, event) in notifications {
            callback(&event);
        }
    }

    fn apply(&self, patch: Value, only_if_changed: bool) -> Result<()> {
        let map = as_object(patch)?;

        let mut notifications: Vec<(Callback, ChangeEvent)> = Vec::new();
        {
            let mut inner = self.lock();
            for (key, value) in map {
                if only_if_changed && inner.state.get(&key) == Some(&value) {
                    trace!(group = %self.group_id, %key, "unchanged value suppressed");
                    continue;
                }
                inner.state.insert(key.clone(), value.clone());

                let event = ChangeEvent { key, value };
                for entry in &inner.listeners {
                    if entry.watches(&event.key) {
                        notifications.push((Arc::clone(&entry.callback), event.clone()));
                    }
                }
            }
        }

        // Dispatch outside the lock so listeners can re-enter the store.
        for (callback, event) in notifications {
            callback(&event);
        }
        Ok(())
    }

    /// Register a listener for one or more keys.
    ///
    /// Listeners are invoked in registration order, once per change to a
    /// watched key. The returned [`Subscription`] removes exactly this
    /// registration.
    pub fn on_changed<F>(&self, keys: &[&str], callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.register(
            Some(keys.iter().map(|k| k.to_string()).collect()),
            Arc::new(callback),
        )
    }

    /// Register a listener for every key.
    ///
    /// The RPC layer uses this to forward all of a service's events without
    /// knowing the key set up front.
    pub fn on_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    /// Register a listener, invoking it immediately for keys that have
    /// already deviated from their default.
    ///
    /// Late subscribers use this so state set before they subscribed is not
    /// missed. The immediate invocations happen synchronously, before this
    /// method returns.
    pub fn already<F>(&self, keys: &[&str], callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);

        let missed: Vec<ChangeEvent> = {
            let inner = self.lock();
            keys.iter()
                .filter_map(|key| {
                    let current = inner.state.get(*key)?;
                    if inner.defaults.get(*key) == Some(current) {
                        return None;
                    }
                    Some(ChangeEvent {
                        key: key.to_string(),
                        value: current.clone(),
                    })
                })
                .collect()
        };
        for event in &missed {
            callback(event);
        }

        self.register(
            Some(keys.iter().map(|k| k.to_string()).collect()),
            callback,
        )
    }

    fn register(&self, keys: Option<Vec<String>>, callback: Callback) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push(ListenerEntry { id, keys, callback });
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Adopt a child subscription.
    ///
    /// Adopted subscriptions are unsubscribed when this store is disposed,
    /// modeling owned disposable fields.
    pub fn adopt(&self, child: Subscription) {
        let mut inner = self.lock();
        if inner.disposed {
            drop(inner);
            child.unsubscribe();
        } else {
            inner.children.push(child);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Remove all listeners and unsubscribe adopted children.
    ///
    /// Safe to call more than once; state survives disposal but no further
    /// notifications are delivered.
    pub fn dispose(&self) {
        let children = {
            let mut inner = self.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.listeners.clear();
            std::mem::take(&mut inner.children)
        };
        for child in children {
            child.unsubscribe();
        }
        debug!(group = %self.group_id, "state store disposed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a listener panicked mid-dispatch; state
        // itself is still consistent because mutation completes before
        // dispatch begins.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("StateStore")
            .field("group_id", &self.group_id)
            .field("keys", &inner.state.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

impl ListenerEntry {
    fn watches(&self, key: &str) -> bool {
        match &self.keys {
            None => true,
            Some(keys) => keys.iter().any(|k| k == key),
        }
    }
}

/// Handle to a registered listener.
///
/// Calling [`Subscription::unsubscribe`] removes exactly that registration.
/// Dropping the handle without unsubscribing leaves the listener in place
/// for the store's lifetime.
pub struct Subscription {
    inner: Weak<Mutex<Inner>>,
    id: u64,
}

impl Subscription {
    /// Remove this registration. A no-op if the store is already gone.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.listeners.retain(|entry| entry.id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

fn as_object(patch: Value) -> Result<serde_json::Map<String, Value>> {
    match patch {
        Value::Object(map) => Ok(map),
        Value::Null => Err(StateError::PatchNotObject("null")),
        Value::Bool(_) => Err(StateError::PatchNotObject("a boolean")),
        Value::Number(_) => Err(StateError::PatchNotObject("a number")),
        Value::String(_) => Err(StateError::PatchNotObject("a string")),
        Value::Array(_) => Err(StateError::PatchNotObject("an array")),
    }
}
