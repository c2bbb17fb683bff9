//! The contract an exposed service implements.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use refbus_state::StateStore;

/// The service table a hub shares with every engine it creates.
pub type SharedServices = Arc<RwLock<HashMap<String, Arc<dyn Service>>>>;

/// A service instance callable over RPC.
///
/// The hub registers every name in [`Service::methods`] as a remote-callable
/// handler. Lifecycle and meta operations (state snapshots for `already`,
/// subscription management) are handled by the engine and must not appear
/// in the method list.
///
/// `call` runs on the channel's pump thread, so dispatch is FIFO per
/// channel. A handler that needs to call back into the *same* channel must
/// use the non-blocking `Proxy::invoke` rather than the blocking
/// `Proxy::call`, or it will deadlock waiting for a reply the pump cannot
/// read.
pub trait Service: Send + Sync {
    /// The remotely callable method names.
    fn methods(&self) -> Vec<String>;

    /// Invoke a method with positional arguments.
    fn call(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError>;

    /// The observable state store this service publishes, if any.
    ///
    /// When present, the hub forwards every fired event to every attached
    /// channel.
    fn state(&self) -> Option<&StateStore> {
        None
    }
}

/// Failure from a service method.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The method name is not part of this service.
    #[error("unknown method '{0}'")]
    MethodNotFound(String),

    /// The handler failed.
    #[error("{message}")]
    Failed {
        message: String,
        stack: Option<String>,
    },
}

impl ServiceError {
    /// A plain failure with no stack.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: None,
        }
    }
}

impl From<String> for ServiceError {
    fn from(message: String) -> Self {
        Self::Failed {
            message,
            stack: None,
        }
    }
}

impl From<&str> for ServiceError {
    fn from(message: &str) -> Self {
        Self::failed(message)
    }
}
