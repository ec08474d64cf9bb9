//! Command-line argument definitions for `qmpctl`.

use clap::{Parser, Subcommand, ValueEnum};
use qmp_client::Operation;

/// Output format selection for command results.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Selects `human` for terminal output and `json` for redirected output.
    #[default]
    Auto,
    /// Always render human-readable output.
    Human,
    /// Always emit JSON.
    Json,
}

/// Output format after resolving `auto` based on TTY detection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolvedOutputFormat {
    /// Human-readable text.
    Human,
    /// One JSON document per line.
    Json,
}

impl OutputFormat {
    /// Resolves the output format based on whether stdout is a terminal.
    #[must_use]
    pub const fn resolve(self, stdout_is_terminal: bool) -> ResolvedOutputFormat {
        match self {
            Self::Auto if stdout_is_terminal => ResolvedOutputFormat::Human,
            Self::Auto | Self::Json => ResolvedOutputFormat::Json,
            Self::Human => ResolvedOutputFormat::Human,
        }
    }
}

/// Command-line interface for the monitor control tool.
#[derive(Parser, Debug)]
#[command(name = "qmpctl", disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// Controls how results are rendered.
    #[arg(long, value_enum, default_value_t = OutputFormat::Auto)]
    pub(crate) output: OutputFormat,
    /// Monitor command to run.
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Monitor commands exposed by the tool.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum CliCommand {
    /// Prints the guest run state.
    Status,
    /// Prints KVM acceleration status.
    Kvm,
    /// Prints the monitor version.
    Version,
    /// Lists the commands the monitor supports.
    Commands,
    /// Pauses guest execution.
    Stop,
    /// Resumes guest execution.
    Cont,
    /// Resets the guest.
    Reset,
    /// Requests an ACPI power-down of the guest.
    Powerdown,
    /// Wakes a suspended guest.
    Wakeup,
    /// Terminates the monitored process.
    Quit,
    /// Runs a human monitor command line.
    Hmp {
        /// Command line, for example `info cpus`.
        #[arg(value_name = "COMMAND-LINE", required = true, num_args = 1..)]
        command_line: Vec<String>,
        /// CPU the command runs against.
        #[arg(long)]
        cpu_index: Option<i64>,
    },
    /// Prints events as they arrive.
    Events {
        /// Stops after this many events.
        #[arg(long)]
        count: Option<usize>,
        /// Stops when no event arrives within this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

impl CliCommand {
    /// Registered operation behind a parameterless command.
    pub(crate) const fn operation(&self) -> Option<Operation> {
        match self {
            Self::Status => Some(Operation::QueryStatus),
            Self::Kvm => Some(Operation::QueryKvm),
            Self::Version => Some(Operation::QueryVersion),
            Self::Commands => Some(Operation::QueryCommands),
            Self::Stop => Some(Operation::Stop),
            Self::Cont => Some(Operation::Cont),
            Self::Reset => Some(Operation::SystemReset),
            Self::Powerdown => Some(Operation::SystemPowerdown),
            Self::Wakeup => Some(Operation::SystemWakeup),
            Self::Quit => Some(Operation::Quit),
            Self::Hmp { .. } | Self::Events { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments should parse")
    }

    #[rstest]
    #[case(OutputFormat::Auto, true, ResolvedOutputFormat::Human)]
    #[case(OutputFormat::Auto, false, ResolvedOutputFormat::Json)]
    #[case(OutputFormat::Human, false, ResolvedOutputFormat::Human)]
    #[case(OutputFormat::Json, true, ResolvedOutputFormat::Json)]
    fn output_format_resolution(
        #[case] format: OutputFormat,
        #[case] terminal: bool,
        #[case] expected: ResolvedOutputFormat,
    ) {
        assert_eq!(format.resolve(terminal), expected);
    }

    #[rstest]
    #[case("status", Operation::QueryStatus)]
    #[case("reset", Operation::SystemReset)]
    #[case("powerdown", Operation::SystemPowerdown)]
    #[case("quit", Operation::Quit)]
    fn commands_map_to_registered_operations(#[case] name: &str, #[case] expected: Operation) {
        assert_eq!(parse(&["qmpctl", name]).command.operation(), Some(expected));
    }

    #[rstest]
    fn hmp_keeps_the_whole_command_line() {
        let cli = parse(&["qmpctl", "hmp", "info", "cpus", "--cpu-index", "1"]);

        assert_eq!(
            cli.command,
            CliCommand::Hmp {
                command_line: vec!["info".to_owned(), "cpus".to_owned()],
                cpu_index: Some(1),
            }
        );
    }

    #[rstest]
    fn events_accepts_limits() {
        let cli = parse(&["qmpctl", "--output", "json", "events", "--count", "2"]);

        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(
            cli.command,
            CliCommand::Events {
                count: Some(2),
                timeout_ms: None,
            }
        );
    }

    #[rstest]
    fn a_command_is_required() {
        assert!(Cli::try_parse_from(["qmpctl"]).is_err());
    }
}
