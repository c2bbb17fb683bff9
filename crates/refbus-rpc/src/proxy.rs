//! Caller-side stand-in for a remote service.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use refbus_state::ChangeEvent;

use crate::engine::{EventSubscription, PendingReply, RpcEngine, META_STATE};
use crate::envelope::signal;
use crate::error::Result;

/// A typed handle to one namespace on one channel.
///
/// Method calls are turned into call envelopes on the engine's channel;
/// `on_changed`/`already` register against inbound event envelopes instead
/// of sending calls.
pub struct Proxy {
    engine: Arc<RpcEngine>,
    rpc_id: String,
    timeout: Duration,
}

impl Proxy {
    /// Build a proxy for `rpc_id` over `engine`.
    pub fn new(engine: Arc<RpcEngine>, rpc_id: impl Into<String>) -> Self {
        let timeout = engine.config().default_timeout;
        Self {
            engine,
            rpc_id: rpc_id.into(),
            timeout,
        }
    }

    /// Override the blocking-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The namespace this proxy targets.
    pub fn rpc_id(&self) -> &str {
        &self.rpc_id
    }

    /// The method list the counterpart announced for this namespace, if
    /// the announcement has arrived.
    pub fn methods(&self) -> Option<Vec<String>> {
        self.engine.ledger().methods_of(&self.rpc_id)
    }

    /// Invoke a method without blocking; await the result through the
    /// returned [`PendingReply`].
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<PendingReply> {
        self.engine.invoke(&self.rpc_id, method, args)
    }

    /// Invoke a method and block until its reply arrives.
    ///
    /// This is the synchronous escape hatch: a full round trip on the
    /// caller's thread. Prefer [`Proxy::invoke`] anywhere throughput
    /// matters, and never use this from a handler running on the same
    /// channel's pump.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke(method, args)?.wait(self.timeout)
    }

    /// Register a callback for changes to one state key of the remote
    /// service.
    pub fn on_changed<F>(&self, key: &str, callback: F) -> EventSubscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let signal = signal::join(&self.rpc_id, key);
        self.engine.on_event(signal.clone(), move |payload| {
            match change_from_payload(payload) {
                Some(event) => callback(&event),
                None => warn!(%signal, "malformed event payload dropped"),
            }
        })
    }

    /// Register a callback, invoking it immediately if the key has already
    /// deviated from its default on the remote side.
    ///
    /// Fetches the remote deviation snapshot synchronously before
    /// registering, so state set before this subscriber existed is not
    /// missed.
    pub fn already<F>(&self, key: &str, callback: F) -> Result<EventSubscription>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);

        let snapshot = self.invoke(META_STATE, Vec::new())?.wait(self.timeout)?;
        if let Some(value) = snapshot.get(key) {
            callback(&ChangeEvent {
                key: key.to_string(),
                value: value.clone(),
            });
        }

        let registered = Arc::clone(&callback);
        Ok(self.on_changed(key, move |event| registered(event)))
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("rpc_id", &self.rpc_id)
            .field("counterpart", &self.engine.counterpart_id())
            .finish()
    }
}

fn change_from_payload(payload: &Value) -> Option<ChangeEvent> {
    let key = payload.get("key")?.as_str()?;
    let value = payload.get("value")?.clone();
    Some(ChangeEvent {
        key: key.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn change_payload_parses() {
        let event = change_from_payload(&json!({"key": "level", "value": "error"})).unwrap();
        assert_eq!(event.key, "level");
        assert_eq!(event.value, json!("error"));
    }

    #[test]
    fn malformed_payload_rejected() {
        assert!(change_from_payload(&json!({"value": 1})).is_none());
        assert!(change_from_payload(&json!("nope")).is_none());
        assert!(change_from_payload(&json!({"key": 3, "value": 1})).is_none());
    }
}
