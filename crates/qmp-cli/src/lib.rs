//! Command-line runtime for `qmpctl`.
//!
//! The runtime splits configuration flags from the command, loads
//! configuration, installs telemetry, connects to the monitor and runs a
//! single command (or follows events) before rendering the result. IO
//! streams and the configuration loader are injectable so tests can drive
//! the whole path against a scripted monitor.

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use clap::Parser;
use qmp_client::{
    Connection, ConnectionOptions, ConnectionState, FailureKind, HumanCommand, Output, QmpError,
};
use qmp_config::Config;
use serde_json::Map;
use tracing::{debug, info};

mod cli;
mod config;
mod errors;
mod output;
pub mod telemetry;

pub use cli::{OutputFormat, ResolvedOutputFormat};
use cli::{Cli, CliCommand};
use config::{ConfigLoader, OrthoConfigLoader, split_config_arguments};
use errors::AppError;
use output::{write_event, write_output};

const CLI_TARGET: &str = "qmp_cli";

/// Bundles the IO streams provided to the CLI runtime.
pub(crate) struct IoStreams<'a, W: Write, E: Write> {
    pub(crate) stdout: &'a mut W,
    pub(crate) stderr: &'a mut E,
    stdout_is_terminal: bool,
}

impl<'a, W: Write, E: Write> IoStreams<'a, W, E> {
    pub(crate) const fn new(stdout: &'a mut W, stderr: &'a mut E, stdout_is_terminal: bool) -> Self {
        Self {
            stdout,
            stderr,
            stdout_is_terminal,
        }
    }
}

/// Runs the CLI using the provided arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E, stdout_is_terminal: bool) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let mut io = IoStreams::new(stdout, stderr, stdout_is_terminal);
    run_with_loader(args, &mut io, &OrthoConfigLoader)
}

/// Runs the CLI with a custom configuration loader.
pub(crate) fn run_with_loader<I, W, E, L>(
    args: I,
    io: &mut IoStreams<'_, W, E>,
    loader: &L,
) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    let args: Vec<OsString> = args.into_iter().collect();
    match run_command(&args, io, loader) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let _ = writeln!(io.stderr, "{error}");
            ExitCode::FAILURE
        }
    }
}

fn run_command<W, E, L>(
    args: &[OsString],
    io: &mut IoStreams<'_, W, E>,
    loader: &L,
) -> Result<(), AppError>
where
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    let split = split_config_arguments(args);
    let cli = Cli::try_parse_from(&split.cli_arguments).map_err(AppError::CliUsage)?;
    let config = loader.load(&split.config_arguments)?;
    telemetry::initialise(&config)?;

    let format = cli.output.resolve(io.stdout_is_terminal);
    let connection = connect(&config)?;
    let outcome = match cli.command {
        CliCommand::Events { count, timeout_ms } => follow_events(
            &connection,
            io,
            format,
            count,
            timeout_ms.map(Duration::from_millis),
        ),
        command => execute(&connection, command)
            .and_then(|output| write_output(io.stdout, format, &output)),
    };
    connection.close();
    outcome
}

fn connect(config: &Config) -> Result<Connection, AppError> {
    let options = ConnectionOptions::from_config(config);
    Connection::connect(config.monitor_socket(), &options).map_err(|source| AppError::Connect {
        endpoint: config.monitor_socket().to_string(),
        source,
    })
}

fn execute(connection: &Connection, command: CliCommand) -> Result<Output, AppError> {
    if let CliCommand::Hmp {
        command_line,
        cpu_index,
    } = command
    {
        let request = HumanCommand {
            command_line: command_line.join(" "),
            cpu_index,
        };
        return Ok(Output::Text(connection.human_monitor_command(&request)?));
    }
    let Some(operation) = command.operation() else {
        return Ok(Output::Empty);
    };
    debug!(target: CLI_TARGET, %operation, "executing monitor command");
    Ok(connection.execute(operation, Map::new())?)
}

fn follow_events<W, E>(
    connection: &Connection,
    io: &mut IoStreams<'_, W, E>,
    format: ResolvedOutputFormat,
    count: Option<usize>,
    idle_timeout: Option<Duration>,
) -> Result<(), AppError>
where
    W: Write,
    E: Write,
{
    let subscription = connection.subscribe()?;
    let mut seen = 0usize;
    while count.is_none_or(|limit| seen < limit) {
        let next = match idle_timeout {
            Some(timeout) => match subscription.recv_timeout(timeout) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
            None => subscription.recv(),
        };
        let Some(event) = next else {
            break;
        };
        write_event(io.stdout, format, &event)?;
        seen += 1;
    }
    info!(target: CLI_TARGET, events = seen, "stopped following events");
    event_stream_outcome(connection.state())
}

/// Maps the state an event stream ended in to the command outcome. The
/// monitor hanging up is a normal end; any other failure is an error.
fn event_stream_outcome(state: ConnectionState) -> Result<(), AppError> {
    match state {
        ConnectionState::Failed(failure) if failure.kind != FailureKind::EndOfStream => {
            Err(AppError::Command(QmpError::ConnectionFailed(failure)))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests;
