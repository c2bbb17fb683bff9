//! Wire lane IDs.
//!
//! Lanes 0-255 are reserved for the protocol engine.
//! Lanes 256-65535 are available for application-defined use.

/// Connection management (registration, ping/pong, port handshake).
pub const CONTROL: u16 = 0;

/// Call envelopes (method invocation requests).
pub const CALL: u16 = 1;

/// Reply envelopes (one per call).
pub const REPLY: u16 = 2;

/// Event envelopes (unsolicited state-change notifications).
pub const EVENT: u16 = 3;

/// Exposed-API announcements.
pub const EXPOSE: u16 = 4;

/// First user-defined lane ID.
pub const USER_LANE_START: u16 = 256;

/// Returns a human-readable name for a lane ID.
pub fn lane_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        CALL => "CALL",
        REPLY => "REPLY",
        EVENT => "EVENT",
        EXPOSE => "EXPOSE",
        5..=255 => "RESERVED",
        _ => "USER",
    }
}

/// Returns true if the lane ID is in the reserved range.
pub fn is_reserved(id: u16) -> bool {
    id < USER_LANE_START
}

/// Returns true if the lane ID is handled by the protocol engine.
pub fn is_builtin(id: u16) -> bool {
    id <= EXPOSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lanes_are_named() {
        assert_eq!(lane_name(CONTROL), "CONTROL");
        assert_eq!(lane_name(CALL), "CALL");
        assert_eq!(lane_name(REPLY), "REPLY");
        assert_eq!(lane_name(EVENT), "EVENT");
        assert_eq!(lane_name(EXPOSE), "EXPOSE");
        assert_eq!(lane_name(42), "RESERVED");
        assert_eq!(lane_name(300), "USER");
    }

    #[test]
    fn reserved_range_boundaries() {
        assert!(is_reserved(0));
        assert!(is_reserved(255));
        assert!(!is_reserved(256));
        assert!(is_builtin(EXPOSE));
        assert!(!is_builtin(5));
    }
}
