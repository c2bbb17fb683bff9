use std::time::Duration;

use crate::envelope::ErrorDescriptor;

/// Errors that can occur in RPC operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The channel closed before or while a call was outstanding.
    ///
    /// Broadcast to every pending call when an engine's channel dies.
    #[error("channel closed")]
    ChannelClosed,

    /// The remote process does not expose the requested rpc id or method.
    #[error("no handler for {rpc_id}.{method}")]
    NotFound { rpc_id: String, method: String },

    /// The remote handler failed; carries its serialized message and stack.
    #[error("remote handler failed: {}", .0.message)]
    Remote(ErrorDescriptor),

    /// `require_api` exhausted its budget waiting for an announcement.
    #[error("namespace '{namespace}' not announced within {timeout:?}")]
    HandshakeTimeout {
        namespace: String,
        timeout: Duration,
    },

    /// A call waited longer than its timeout; the reply will be dropped
    /// if it ever arrives.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// A worker's registration frame was missing or malformed.
    #[error("registration failed: {0}")]
    Registration(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] refbus_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] refbus_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;
