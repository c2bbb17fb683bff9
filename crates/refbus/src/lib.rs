//! Broker-mediated RPC substrate for multi-process desktop applications.
//!
//! refbus lets any process call methods on service objects living in any
//! other process, subscribe to state-change events those objects publish,
//! and register named hooks and commands other processes invoke by name —
//! all over framed Unix-domain-socket channels established through a broker.
//!
//! # Crate Structure
//!
//! - [`transport`] — Unix domain socket streams and in-process socket pairs
//! - [`frame`] — Length-prefixed message framing with lane multiplexing
//! - [`state`] — Observable key/value state container with change notification
//! - [`inject`] — Dependency-injection container for the service graph
//! - [`rpc`] — Protocol engine, proxies, process registry, broker handshake

/// Re-export transport types.
pub mod transport {
    pub use refbus_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use refbus_frame::*;
}

/// Re-export observable-state types.
pub mod state {
    pub use refbus_state::*;
}

/// Re-export dependency-injection types.
pub mod inject {
    pub use refbus_inject::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use refbus_rpc::*;
}
