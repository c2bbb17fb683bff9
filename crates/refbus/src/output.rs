use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    schema_id: &'a str,
    rpc_id: &'a str,
    method: &'a str,
    ok: bool,
    value: &'a Value,
    timestamp: String,
}

pub fn print_reply(rpc_id: &str, method: &str, value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                schema_id: "https://schemas.refbus.dev/cli/v1/call-reply.schema.json",
                rpc_id,
                method,
                ok: true,
                value,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "METHOD", "VALUE"])
                .add_row(vec![
                    rpc_id.to_string(),
                    method.to_string(),
                    value_preview(value),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("{rpc_id}.{method} -> {}", value_preview(value));
        }
        OutputFormat::Raw => {
            println!("{}", value_preview(value));
        }
    }
}

#[derive(Serialize)]
struct EventOutput<'a> {
    schema_id: &'a str,
    signal: &'a str,
    key: &'a str,
    value: &'a Value,
    timestamp: String,
}

pub fn print_event(signal: &str, key: &str, value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = EventOutput {
                schema_id: "https://schemas.refbus.dev/cli/v1/event-received.schema.json",
                signal,
                key,
                value,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SIGNAL", "VALUE"])
                .add_row(vec![signal.to_string(), value_preview(value)]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("{signal} = {}", value_preview(value));
        }
        OutputFormat::Raw => {
            println!("{}", value_preview(value));
        }
    }
}

/// Strings print unquoted; everything else prints as compact JSON.
pub fn value_preview(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
