//! Built-in services the `serve` command exposes.
//!
//! These are the broker-side collaborators every worker expects to find:
//! a persisted-preference store and a logging sink. Both publish observable
//! state, so remote subscribers see preference changes and log activity as
//! events.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, warn};

use refbus_rpc::{Service, ServiceError};
use refbus_state::StateStore;

/// Key/value preference store, exposed as `preference`.
pub struct PreferenceService {
    store: StateStore,
}

impl PreferenceService {
    pub fn new() -> refbus_state::Result<Self> {
        let store = StateStore::with_defaults(
            "preference",
            json!({
                "theme": "system",
                "language": "en",
                "min_log_level": "info",
            }),
        )?;
        Ok(Self { store })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }
}

impl Service for PreferenceService {
    fn methods(&self) -> Vec<String> {
        vec!["get".to_string(), "set".to_string()]
    }

    fn call(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        match method {
            "get" => {
                let key = str_arg(args, 0)?;
                Ok(self.store.get(&key).unwrap_or(Value::Null))
            }
            "set" => {
                let patch = args
                    .first()
                    .cloned()
                    .ok_or_else(|| ServiceError::failed("set requires a patch object"))?;
                self.store
                    .fire_if_changed(patch)
                    .map_err(|err| ServiceError::failed(err.to_string()))?;
                Ok(Value::Null)
            }
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }

    fn state(&self) -> Option<&StateStore> {
        Some(&self.store)
    }
}

/// Logging sink, exposed as `log`.
///
/// Messages below the `min_log_level` preference are dropped. Accepted
/// messages go to this process's tracing output and fire the service's
/// state, so every attached channel sees the latest entry as an event.
pub struct LogService {
    preferences: Arc<PreferenceService>,
    store: StateStore,
}

impl LogService {
    pub fn new(preferences: Arc<PreferenceService>) -> Self {
        Self {
            preferences,
            store: StateStore::new("log"),
        }
    }

    fn min_level(&self) -> u8 {
        self.preferences
            .get("min_log_level")
            .as_ref()
            .and_then(Value::as_str)
            .map(level_rank)
            .unwrap_or(1)
    }

    fn record(&self, level: &str, args: &[Value]) -> Result<Value, ServiceError> {
        let message = str_arg(args, 0)?;
        let detail = args.get(1).and_then(Value::as_str);
        let source = args.get(2).and_then(Value::as_str).unwrap_or("unknown");

        if level_rank(level) < self.min_level() {
            return Ok(Value::Null);
        }

        match level {
            "warn" => warn!(source, detail, "{message}"),
            "error" => error!(source, detail, "{message}"),
            _ => info!(source, detail, "{message}"),
        }

        self.store
            .fire(json!({
                "level": level,
                "message": message,
                "source": source,
            }))
            .map_err(|err| ServiceError::failed(err.to_string()))?;
        Ok(Value::Null)
    }
}

impl Service for LogService {
    fn methods(&self) -> Vec<String> {
        vec!["info".to_string(), "warn".to_string(), "error".to_string()]
    }

    fn call(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        match method {
            "info" | "warn" | "error" => self.record(method, args),
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }

    fn state(&self) -> Option<&StateStore> {
        Some(&self.store)
    }
}

fn level_rank(level: &str) -> u8 {
    match level {
        "error" => 3,
        "warn" => 2,
        "info" => 1,
        _ => 0,
    }
}

fn str_arg(args: &[Value], index: usize) -> Result<String, ServiceError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::failed(format!("argument {index} must be a string")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preference() -> Arc<PreferenceService> {
        Arc::new(PreferenceService::new().expect("defaults should be an object"))
    }

    #[test]
    fn preference_set_then_get() {
        let service = preference();

        service.call("set", &[json!({"theme": "dark"})]).unwrap();
        let value = service.call("get", &[json!("theme")]).unwrap();

        assert_eq!(value, json!("dark"));
    }

    #[test]
    fn preference_get_unset_key_is_null() {
        let service = preference();
        assert_eq!(service.call("get", &[json!("ghost")]).unwrap(), json!(null));
    }

    #[test]
    fn preference_rejects_unknown_method() {
        let err = preference().call("delete", &[json!("theme")]).unwrap_err();
        assert!(matches!(err, ServiceError::MethodNotFound(_)));
    }

    #[test]
    fn log_fires_state_with_message() {
        let log = LogService::new(preference());

        log.call("info", &[json!("importing feed"), json!(null), json!("feeds")])
            .unwrap();

        assert_eq!(log.store.get("level"), Some(json!("info")));
        assert_eq!(log.store.get("message"), Some(json!("importing feed")));
        assert_eq!(log.store.get("source"), Some(json!("feeds")));
    }

    #[test]
    fn log_below_min_level_is_dropped() {
        let prefs = preference();
        prefs
            .call("set", &[json!({"min_log_level": "warn"})])
            .unwrap();
        let log = LogService::new(Arc::clone(&prefs));

        log.call("info", &[json!("quiet")]).unwrap();
        assert_eq!(log.store.get("message"), None);

        log.call("error", &[json!("loud")]).unwrap();
        assert_eq!(log.store.get("message"), Some(json!("loud")));
    }

    #[test]
    fn log_requires_a_string_message() {
        let log = LogService::new(preference());
        let err = log.call("info", &[json!(42)]).unwrap_err();
        assert!(matches!(err, ServiceError::Failed { .. }));
    }
}
