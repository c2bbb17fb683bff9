//! RPC protocol engine for the refbus process mesh.
//!
//! One [`MessageHub`] per process owns the local service table and one
//! [`RpcEngine`] per channel to a counterpart process. Engines turn method
//! calls into call envelopes, correlate replies through a pending-call
//! table, forward observable-state events, and record exposed-API
//! announcements so consumers can wait for a namespace before building a
//! [`Proxy`].
//!
//! The [`broker`] module implements the privileged control channel the main
//! process runs: workers register with a `hello`, then request private
//! channels to each other through the port handshake.

pub mod broker;
pub mod control;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod expose;
pub mod hooks;
pub mod hub;
pub mod proxy;
pub mod registry;
pub mod service;

pub use broker::{install_port_handler, join, request_channel, Broker, BrokerConfig, BROKER_ID};
pub use control::ControlMessage;
pub use engine::{EngineConfig, EventSubscription, PendingReply, RpcEngine};
pub use envelope::{
    signal, CallEnvelope, DescriptorKind, ErrorDescriptor, EventEnvelope, ExposeEnvelope,
    ReplyEnvelope,
};
pub use error::{Result, RpcError};
pub use expose::{ApiLedger, ExposureState};
pub use hooks::{CallbackTarget, HookService, HOOK_SERVICE_ID};
pub use hub::MessageHub;
pub use proxy::Proxy;
pub use registry::{Handle, ProcessRegistry};
pub use service::{Service, ServiceError, SharedServices};
