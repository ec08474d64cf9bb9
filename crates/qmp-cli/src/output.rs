//! Rendering of command results and events.
//!
//! JSON output writes one document per line so results can be piped into
//! other tools. Human output loosely follows the monitor's own `info`
//! commands.

use std::io::Write;

use qmp_client::{Event, Output};
use serde_json::Value;

use crate::cli::ResolvedOutputFormat;
use crate::errors::AppError;

/// Writes the result of a single command.
pub(crate) fn write_output<W: Write>(
    out: &mut W,
    format: ResolvedOutputFormat,
    output: &Output,
) -> Result<(), AppError> {
    match format {
        ResolvedOutputFormat::Json => {
            let document = match output {
                Output::Empty => Value::Object(serde_json::Map::new()),
                other => serde_json::to_value(other).map_err(AppError::SerialiseOutput)?,
            };
            writeln!(out, "{document}")?;
        }
        ResolvedOutputFormat::Human => out.write_all(render_human(output).as_bytes())?,
    }
    out.flush()?;
    Ok(())
}

/// Writes one event.
pub(crate) fn write_event<W: Write>(
    out: &mut W,
    format: ResolvedOutputFormat,
    event: &Event,
) -> Result<(), AppError> {
    match format {
        ResolvedOutputFormat::Json => {
            let document = serde_json::to_string(event).map_err(AppError::SerialiseOutput)?;
            writeln!(out, "{document}")?;
        }
        ResolvedOutputFormat::Human => {
            let stamp = event.timestamp;
            write!(
                out,
                "{}.{:06} {}",
                stamp.seconds, stamp.microseconds, event.name
            )?;
            if !is_empty_data(&event.data) {
                write!(out, " {}", event.data)?;
            }
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn is_empty_data(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

fn render_human(output: &Output) -> String {
    match output {
        Output::Empty => String::new(),
        Output::Kvm(info) => {
            let support = match (info.present, info.enabled) {
                (false, _) => "not compiled",
                (true, false) => "disabled",
                (true, true) => "enabled",
            };
            format!("kvm support: {support}\n")
        }
        Output::Status(status) => {
            let singlestep = if status.singlestep {
                " (single step mode)"
            } else {
                ""
            };
            format!("VM status: {}{singlestep}\n", status.status)
        }
        Output::Version(version) => format!("{version}\n"),
        Output::Commands(commands) => commands
            .iter()
            .map(|command| format!("{}\n", command.name))
            .collect(),
        Output::Text(text) => {
            let mut text = text.replace("\r\n", "\n");
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text
        }
    }
}
