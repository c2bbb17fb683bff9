//! Length-prefixed message framing with lane multiplexing for refbus.
//!
//! Every message on a channel is framed with:
//! - A 2-byte magic number ("RB") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian lane ID identifying the envelope kind
//!
//! No partial reads, no buffer management in user code. The lane ID is the
//! wire-level dispatch key: it tells the receiving pump whether the payload
//! is a control message, a call, a reply, an event, or an API announcement.

pub mod codec;
pub mod error;
pub mod lane;
pub mod reader;
pub mod writer;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use lane::{CALL, CONTROL, EVENT, EXPOSE, REPLY};
pub use reader::FrameReader;
pub use writer::FrameWriter;
