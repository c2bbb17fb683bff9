//! Hook and command registries.
//!
//! Extensions in other processes register named callbacks here by
//! (extension id, process id, method); any process can later run them by
//! name without knowing who implements them. Hooks form a transform
//! pipeline over an argument list; commands are single named callbacks.
//!
//! Every callback invocation is a nested RPC call raced against a per-hook
//! timeout. A slow or failing hook never stalls the pipeline: the run
//! proceeds with the arguments it had before that hook.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};
use crate::hub::MessageHub;
use crate::service::{Service, ServiceError};

/// Namespace the hook service is conventionally exposed under.
pub const HOOK_SERVICE_ID: &str = "hooks";

/// Where a registered callback lives and how to call it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTarget {
    /// The extension that owns the callback (dispose key).
    pub extension_id: String,
    /// The process hosting the extension.
    pub process_id: String,
    /// The method to call on the extension's namespace.
    pub method: String,
}

/// The hook/command indirection table, itself exposable as a service.
pub struct HookService {
    hub: Weak<MessageHub>,
    hook_timeout: Duration,
    /// Hook name → callbacks in registration order.
    hooks: Mutex<HashMap<String, Vec<CallbackTarget>>>,
    commands: Mutex<HashMap<String, CallbackTarget>>,
}

impl HookService {
    /// Create the service, routing callback invocations through `hub`.
    pub fn new(hub: &Arc<MessageHub>) -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::downgrade(hub),
            hook_timeout: hub.config().hook_timeout,
            hooks: Mutex::new(HashMap::new()),
            commands: Mutex::new(HashMap::new()),
        })
    }

    /// Register a callback at the end of a hook's pipeline.
    pub fn hook_register(&self, name: impl Into<String>, target: CallbackTarget) {
        let name = name.into();
        debug!(hook = %name, extension = %target.extension_id, "hook registered");
        lock(&self.hooks).entry(name).or_default().push(target);
    }

    /// Remove every hook callback owned by an extension.
    ///
    /// Returns the number removed.
    pub fn hook_dispose(&self, extension_id: &str) -> usize {
        let mut hooks = lock(&self.hooks);
        let mut removed = 0;
        for targets in hooks.values_mut() {
            let before = targets.len();
            targets.retain(|target| target.extension_id != extension_id);
            removed += before - targets.len();
        }
        hooks.retain(|_, targets| !targets.is_empty());
        debug!(extension = %extension_id, removed, "hooks disposed");
        removed
    }

    /// Register a command callback. Re-registration replaces the previous
    /// owner.
    pub fn command_register(&self, command_id: impl Into<String>, target: CallbackTarget) {
        let command_id = command_id.into();
        if lock(&self.commands)
            .insert(command_id.clone(), target)
            .is_some()
        {
            warn!(command = %command_id, "command re-registered; previous owner replaced");
        } else {
            debug!(command = %command_id, "command registered");
        }
    }

    /// Remove every command owned by an extension.
    ///
    /// Returns the number removed.
    pub fn command_dispose(&self, extension_id: &str) -> usize {
        let mut commands = lock(&self.commands);
        let before = commands.len();
        commands.retain(|_, target| target.extension_id != extension_id);
        let removed = before - commands.len();
        debug!(extension = %extension_id, removed, "commands disposed");
        removed
    }

    /// Number of callbacks registered for a hook.
    pub fn hook_count(&self, name: &str) -> usize {
        lock(&self.hooks).get(name).map_or(0, Vec::len)
    }

    /// Whether a command is registered.
    pub fn has_command(&self, command_id: &str) -> bool {
        lock(&self.commands).contains_key(command_id)
    }

    /// Feed `args` through every callback registered for `name`, in
    /// registration order.
    ///
    /// Each callback receives the current argument list and must return
    /// the (possibly modified) list as a JSON array. A callback that times
    /// out, fails, or returns a non-array leaves the list untouched; the
    /// pipeline always completes.
    pub fn run_hook(&self, name: &str, args: Vec<Value>) -> Vec<Value> {
        let targets: Vec<CallbackTarget> =
            lock(&self.hooks).get(name).cloned().unwrap_or_default();

        let mut current = args;
        for target in &targets {
            match self.dispatch(target, current.clone()) {
                Ok(Value::Array(next)) => current = next,
                Ok(other) => {
                    warn!(
                        hook = %name,
                        extension = %target.extension_id,
                        got = %value_kind(&other),
                        "hook returned a non-array; keeping previous arguments"
                    );
                }
                Err(err) => {
                    warn!(
                        hook = %name,
                        extension = %target.extension_id,
                        %err,
                        "hook callback failed; keeping previous arguments"
                    );
                }
            }
        }
        current
    }

    /// Run a single named command callback.
    pub fn run_command(&self, command_id: &str, args: Vec<Value>) -> Result<Value> {
        let target = lock(&self.commands)
            .get(command_id)
            .cloned()
            .ok_or_else(|| RpcError::NotFound {
                rpc_id: HOOK_SERVICE_ID.to_string(),
                method: command_id.to_string(),
            })?;
        self.dispatch(&target, args)
    }

    /// Nested RPC call to the callback's owner, raced against the per-hook
    /// timeout.
    fn dispatch(&self, target: &CallbackTarget, args: Vec<Value>) -> Result<Value> {
        let hub = self.hub.upgrade().ok_or(RpcError::ChannelClosed)?;
        let engine = hub
            .engine(&target.process_id)
            .ok_or(RpcError::ChannelClosed)?;
        engine
            .invoke(&target.extension_id, &target.method, args)?
            .wait(self.hook_timeout)
    }
}

impl Service for HookService {
    fn methods(&self) -> Vec<String> {
        [
            "hook_register",
            "hook_dispose",
            "command_register",
            "command_dispose",
            "run_hook",
            "run_command",
        ]
        .iter()
        .map(|m| m.to_string())
        .collect()
    }

    fn call(&self, method: &str, args: &[Value]) -> std::result::Result<Value, ServiceError> {
        match method {
            "hook_register" => {
                self.hook_register(str_arg(args, 0)?, target_from_args(args, 1)?);
                Ok(Value::Null)
            }
            "hook_dispose" => {
                let removed = self.hook_dispose(&str_arg(args, 0)?);
                Ok(Value::from(removed))
            }
            "command_register" => {
                self.command_register(str_arg(args, 0)?, target_from_args(args, 1)?);
                Ok(Value::Null)
            }
            "command_dispose" => {
                let removed = self.command_dispose(&str_arg(args, 0)?);
                Ok(Value::from(removed))
            }
            "run_hook" => {
                let name = str_arg(args, 0)?;
                let hook_args = array_arg(args, 1)?;
                Ok(Value::Array(self.run_hook(&name, hook_args)))
            }
            "run_command" => {
                let command_id = str_arg(args, 0)?;
                let command_args = array_arg(args, 1)?;
                match self.run_command(&command_id, command_args) {
                    Ok(value) => Ok(value),
                    Err(RpcError::NotFound { .. }) => {
                        Err(ServiceError::MethodNotFound(command_id))
                    }
                    Err(err) => Err(ServiceError::failed(err.to_string())),
                }
            }
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }
}

fn str_arg(args: &[Value], index: usize) -> std::result::Result<String, ServiceError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::failed(format!("argument {index} must be a string")))
}

fn array_arg(args: &[Value], index: usize) -> std::result::Result<Vec<Value>, ServiceError> {
    match args.get(index) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(ServiceError::failed(format!(
            "argument {index} must be an array"
        ))),
        None => Ok(Vec::new()),
    }
}

fn target_from_args(
    args: &[Value],
    offset: usize,
) -> std::result::Result<CallbackTarget, ServiceError> {
    Ok(CallbackTarget {
        extension_id: str_arg(args, offset)?,
        process_id: str_arg(args, offset + 1)?,
        method: str_arg(args, offset + 2)?,
    })
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
