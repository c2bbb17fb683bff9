//! Wire envelope shapes.
//!
//! Four envelope kinds cross a channel, one per frame lane: calls, replies,
//! events, and exposed-API announcements. All payload values are
//! `serde_json::Value` — structural data only, no live references.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A method invocation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallEnvelope {
    /// Unique per originating engine for the channel's lifetime.
    pub call_id: u64,
    /// Target service namespace.
    pub rpc_id: String,
    /// Method name within the namespace.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

/// The single reply to a call envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyEnvelope {
    pub call_id: u64,
    pub ok: bool,
    /// The return value when `ok`, ignored otherwise.
    #[serde(default)]
    pub value: Value,
    /// The failure when not `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl ReplyEnvelope {
    /// A successful reply.
    pub fn success(call_id: u64, value: Value) -> Self {
        Self {
            call_id,
            ok: true,
            value,
            error: None,
        }
    }

    /// A failed reply.
    pub fn failure(call_id: u64, error: ErrorDescriptor) -> Self {
        Self {
            call_id,
            ok: false,
            value: Value::Null,
            error: Some(error),
        }
    }
}

/// What kind of failure a reply carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    /// Unknown rpc id or method.
    NotFound,
    /// The handler threw.
    Remote,
}

/// A serialized handler failure, safe to send across a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub kind: DescriptorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDescriptor {
    /// Descriptor for an unknown rpc id or method.
    pub fn not_found(rpc_id: &str, method: &str) -> Self {
        Self {
            kind: DescriptorKind::NotFound,
            message: format!("no handler for {rpc_id}.{method}"),
            stack: None,
        }
    }

    /// Descriptor for a failed handler.
    pub fn remote(message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            kind: DescriptorKind::Remote,
            message: message.into(),
            stack,
        }
    }
}

/// An unsolicited state-change notification.
///
/// `signal` is `<rpc_id>.<key>`; `payload` is `{"key": .., "value": ..}`.
/// Any number may be sent, FIFO per channel, no reply expected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub signal: String,
    pub payload: Value,
}

impl EventEnvelope {
    /// Build the event for a state change on an exposed service.
    pub fn for_change(rpc_id: &str, key: &str, value: Value) -> Self {
        Self {
            signal: signal::join(rpc_id, key),
            payload: serde_json::json!({ "key": key, "value": value }),
        }
    }
}

/// Announces that a namespace is ready to serve.
///
/// Sent once per namespace per channel, and re-sent to channels attached
/// later; consumers wait for this before constructing proxies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExposeEnvelope {
    pub namespace: String,
    pub methods: Vec<String>,
}

/// Event signal naming: `<rpc_id>.<key>`.
pub mod signal {
    /// Join a namespace and event key into a signal.
    pub fn join(rpc_id: &str, key: &str) -> String {
        format!("{rpc_id}.{key}")
    }

    /// Split a signal into namespace and event key.
    ///
    /// The key may itself contain dots; the split is on the first one.
    pub fn split(signal: &str) -> Option<(&str, &str)> {
        signal.split_once('.')
    }
}
