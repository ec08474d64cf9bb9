//! Configuration loading helpers for the CLI.
//!
//! Leading configuration flags are separated from the command tokens so the
//! `ortho_config` loader only sees the flags it understands while clap
//! parses the rest.

use std::ffi::{OsStr, OsString};

use ortho_config::OrthoConfig;
use qmp_config::Config;

use crate::errors::AppError;

/// CLI flags recognised by the configuration loader. Must match the fields
/// of [`Config`].
pub(crate) const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--monitor-socket",
    "--connect-timeout-ms",
    "--command-timeout-ms",
    "--request-oob",
    "--event-queue-capacity",
    "--event-overflow",
    "--event-replay",
    "--max-message-bytes",
    "--log-filter",
    "--log-format",
];

pub(crate) trait ConfigLoader {
    /// Loads configuration for the CLI.
    ///
    /// Configuration flags must precede the subcommand; anything after it
    /// belongs to the command.
    fn load(&self, args: &[OsString]) -> Result<Config, AppError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        Config::load_from_iter(args.iter().cloned()).map_err(AppError::LoadConfiguration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

fn classify_flag(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    if !text.starts_with("--") {
        return FlagAction::Skip;
    }
    let (flag, inline_value) = match text.split_once('=') {
        Some((flag, _)) => (flag, true),
        None => (text.as_ref(), false),
    };
    if CONFIG_CLI_FLAGS.contains(&flag) {
        FlagAction::Include {
            needs_value: !inline_value,
        }
    } else {
        FlagAction::Skip
    }
}

/// Arguments for the configuration loader and for clap.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) cli_arguments: Vec<OsString>,
}

/// Moves leading configuration flags (and their values) out of `args`.
/// Both halves keep the program name.
pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let Some((program, rest)) = args.split_first() else {
        return ConfigArgumentSplit::default();
    };
    let mut config_arguments = vec![program.clone()];
    let mut remaining = rest.iter().peekable();

    while let Some(argument) = remaining.peek() {
        match classify_flag(argument) {
            FlagAction::Include { needs_value } => {
                config_arguments.push((*argument).clone());
                remaining.next();
                if needs_value && let Some(value) = remaining.next() {
                    config_arguments.push(value.clone());
                }
            }
            FlagAction::Skip => break,
        }
    }

    let mut cli_arguments = vec![program.clone()];
    cli_arguments.extend(remaining.cloned());
    ConfigArgumentSplit {
        config_arguments,
        cli_arguments,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn os_args(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[rstest]
    #[case("--log-filter=debug", FlagAction::Include { needs_value: false })]
    #[case("--log-filter", FlagAction::Include { needs_value: true })]
    #[case("--monitor-socket", FlagAction::Include { needs_value: true })]
    #[case("--output", FlagAction::Skip)]
    #[case("--unknown", FlagAction::Skip)]
    #[case("status", FlagAction::Skip)]
    fn classifies_flags(#[case] argument: &str, #[case] expected: FlagAction) {
        assert_eq!(classify_flag(OsStr::new(argument)), expected);
    }

    #[rstest]
    fn leading_configuration_flags_are_split_off() {
        let args = os_args(&[
            "qmpctl",
            "--monitor-socket",
            "unix:///run/vm.sock",
            "--log-format=compact",
            "--output",
            "json",
            "status",
        ]);

        let split = split_config_arguments(&args);

        assert_eq!(
            split.config_arguments,
            os_args(&[
                "qmpctl",
                "--monitor-socket",
                "unix:///run/vm.sock",
                "--log-format=compact",
            ])
        );
        assert_eq!(
            split.cli_arguments,
            os_args(&["qmpctl", "--output", "json", "status"])
        );
    }

    #[rstest]
    fn flags_after_the_command_stay_with_the_command() {
        let args = os_args(&["qmpctl", "hmp", "--log-filter", "debug"]);

        let split = split_config_arguments(&args);

        assert_eq!(split.config_arguments, os_args(&["qmpctl"]));
        assert_eq!(split.cli_arguments, args);
    }

    #[rstest]
    fn empty_arguments_split_into_nothing() {
        assert_eq!(split_config_arguments(&[]), ConfigArgumentSplit::default());
    }
}
