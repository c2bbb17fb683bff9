//! CONTROL-lane messages.
//!
//! Registration, liveness, and the broker port handshake all travel on the
//! CONTROL lane as tagged JSON.

use serde::{Deserialize, Serialize};

/// A control message.
///
/// The port handshake sequence: a worker sends `request-port` naming the
/// counterpart it wants; the broker allocates a fresh socket path and
/// relays it to the destination as `forward-port`; the destination binds
/// the path and acknowledges with `port-ready`; the broker then delivers
/// `response-port` to the requester, which connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Worker registration, read by the broker at accept time.
    Hello { process_id: String },

    /// Liveness probe; the engine answers with `Pong` automatically.
    Ping,
    /// Liveness answer.
    Pong,

    /// "Give me a private channel to talk to `caller_id`."
    RequestPort { caller_id: String },

    /// Broker → destination: bind `endpoint` for a channel from `caller_id`.
    ForwardPort {
        caller_id: String,
        dest_id: String,
        endpoint: String,
    },

    /// Destination → broker: the endpoint is bound and accepting.
    PortReady { endpoint: String },

    /// Broker → requester: connect to `endpoint` to reach `counterpart_id`.
    ResponsePort {
        endpoint: String,
        counterpart_id: String,
    },

    /// Broker → requester: the handshake failed (e.g. unknown destination).
    PortError { dest_id: String, message: String },
}
