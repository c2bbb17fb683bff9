use std::fmt;
use std::io;

use refbus_inject::InjectError;
use refbus_rpc::RpcError;
use refbus_transport::TransportError;

// Exit code constants follow sysexits-style semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Pair(source)
        | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    match err {
        RpcError::Transport(err) => transport_error(context, err),
        RpcError::Frame(err) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        RpcError::Json(err) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        RpcError::Timeout(_) | RpcError::HandshakeTimeout { .. } => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        RpcError::NotFound { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        RpcError::ChannelClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn inject_error(context: &str, err: InjectError) -> CliError {
    // Any container failure is fatal at startup: a broken service graph
    // cannot safely serve an API.
    CliError::new(INTERNAL, format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_timeout_code() {
        let err = rpc_error(
            "call failed",
            RpcError::Timeout(std::time::Duration::from_secs(1)),
        );
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn not_found_maps_to_usage() {
        let err = rpc_error(
            "call failed",
            RpcError::NotFound {
                rpc_id: "log".to_string(),
                method: "nope".to_string(),
            },
        );
        assert_eq!(err.code, USAGE);
        assert!(err.message.contains("log.nope"));
    }

    #[test]
    fn inject_errors_are_internal() {
        let err = inject_error(
            "startup failed",
            InjectError::CyclicDependency {
                id: "log".to_string(),
            },
        );
        assert_eq!(err.code, INTERNAL);
    }
}
