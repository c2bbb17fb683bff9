use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod doctor;
pub mod envinfo;
pub mod serve;
pub mod version;
pub mod watch;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a broker with the built-in services.
    Serve(ServeArgs),
    /// Join a broker and invoke one service method.
    Call(CallArgs),
    /// Join a broker and print a service's state-change events.
    Watch(WatchArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Print build and environment diagnostics.
    Envinfo(EnvinfoArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Watch(args) => watch::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Envinfo(args) => envinfo::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Runtime directory for the control socket and channel endpoints.
    pub runtime_dir: PathBuf,
    /// How long to wait for a worker's registration after accept (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub hello_timeout: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Broker control socket to join.
    pub socket: PathBuf,
    /// Target service namespace.
    pub rpc_id: String,
    /// Method to invoke.
    pub method: String,
    /// Positional arguments; each is parsed as JSON, non-JSON text becomes a string.
    pub args: Vec<String>,
    /// Process hosting the service.
    #[arg(long, default_value = "main")]
    pub to: String,
    /// This process's logical id on the bus.
    #[arg(long)]
    pub process_id: Option<String>,
    /// Call timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// How long to wait for the namespace announcement.
    #[arg(long, default_value = "2s")]
    pub wait_api: String,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Broker control socket to join.
    pub socket: PathBuf,
    /// Service namespace to watch.
    pub rpc_id: String,
    /// State key to watch.
    pub key: String,
    /// Process hosting the service.
    #[arg(long, default_value = "main")]
    pub to: String,
    /// This process's logical id on the bus.
    #[arg(long)]
    pub process_id: Option<String>,
    /// Also report the current value if it already deviates from its default.
    #[arg(long)]
    pub already: bool,
    /// Exit after receiving N events.
    #[arg(long)]
    pub count: Option<usize>,
    /// How long to wait for the namespace announcement.
    #[arg(long, default_value = "2s")]
    pub wait_api: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

#[derive(Args, Debug, Default)]
pub struct EnvinfoArgs {}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

/// Parse a CLI argument as JSON; bare text becomes a JSON string.
pub fn parse_value(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_string()))
}

/// The logical id this CLI invocation registers under.
pub fn process_id_or_default(explicit: &Option<String>, role: &str) -> String {
    explicit
        .clone()
        .unwrap_or_else(|| format!("cli-{role}-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }

    #[test]
    fn parse_value_accepts_json_and_bare_text() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value(r#"{"theme":"dark"}"#), json!({"theme": "dark"}));
        assert_eq!(parse_value("\"quoted\""), json!("quoted"));
        assert_eq!(parse_value("hello world"), json!("hello world"));
    }

    #[test]
    fn process_id_defaults_include_the_role() {
        let id = process_id_or_default(&None, "call");
        assert!(id.starts_with("cli-call-"));

        let explicit = process_id_or_default(&Some("renderer".to_string()), "call");
        assert_eq!(explicit, "renderer");
    }
}
