//! Typed success payloads of the registered queries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Run state reported by `query-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// Stopped in the debugger.
    Debug,
    /// Waiting for an incoming migration.
    Inmigrate,
    /// Stopped by an internal error.
    InternalError,
    /// Stopped by a disk I/O error.
    IoError,
    /// Paused by the operator.
    Paused,
    /// Finished an outgoing migration.
    Postmigrate,
    /// Not yet started.
    Prelaunch,
    /// Finishing an outgoing migration.
    FinishMigrate,
    /// Restoring a snapshot.
    RestoreVm,
    /// Executing guest code.
    Running,
    /// Saving a snapshot.
    SaveVm,
    /// Shut down with the process kept alive.
    Shutdown,
    /// Suspended to RAM.
    Suspended,
    /// Stopped by the watchdog.
    Watchdog,
    /// Stopped after a guest panic.
    GuestPanicked,
    /// Coarse-grained lock-stepping replication.
    Colo,
}

impl RunState {
    /// Wire spelling of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Inmigrate => "inmigrate",
            Self::InternalError => "internal-error",
            Self::IoError => "io-error",
            Self::Paused => "paused",
            Self::Postmigrate => "postmigrate",
            Self::Prelaunch => "prelaunch",
            Self::FinishMigrate => "finish-migrate",
            Self::RestoreVm => "restore-vm",
            Self::Running => "running",
            Self::SaveVm => "save-vm",
            Self::Shutdown => "shutdown",
            Self::Suspended => "suspended",
            Self::Watchdog => "watchdog",
            Self::GuestPanicked => "guest-panicked",
            Self::Colo => "colo",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Result of `query-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Whether guest CPUs are executing.
    pub running: bool,
    /// Whether single-step mode is active. Newer monitors omit it.
    #[serde(default)]
    pub singlestep: bool,
    /// Detailed run state.
    pub status: RunState,
}

/// Result of `query-kvm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvmInfo {
    /// Whether hardware acceleration is in use.
    pub enabled: bool,
    /// Whether hardware acceleration is available.
    pub present: bool,
}

/// Version triple of the monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QemuVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Micro version.
    pub micro: u32,
}

/// Result of `query-version`, also carried by the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Numeric version.
    pub qemu: QemuVersion,
    /// Distribution package string, often empty.
    #[serde(default)]
    pub package: String,
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let QemuVersion {
            major,
            minor,
            micro,
        } = self.qemu;
        write!(formatter, "{major}.{minor}.{micro}")?;
        let package = self.package.trim();
        if !package.is_empty() {
            write!(formatter, " ({package})")?;
        }
        Ok(())
    }
}

/// One entry of `query-commands`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Command name.
    pub name: String,
}

/// Arguments of `human-monitor-command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HumanCommand {
    /// Human monitor command line.
    #[serde(rename = "command-line")]
    pub command_line: String,
    /// CPU to use as the default for the command.
    #[serde(rename = "cpu-index", skip_serializing_if = "Option::is_none")]
    pub cpu_index: Option<i64>,
}

impl HumanCommand {
    /// Command line without a CPU override.
    #[must_use]
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            cpu_index: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case("internal-error", RunState::InternalError)]
    #[case("io-error", RunState::IoError)]
    #[case("finish-migrate", RunState::FinishMigrate)]
    #[case("restore-vm", RunState::RestoreVm)]
    #[case("save-vm", RunState::SaveVm)]
    #[case("guest-panicked", RunState::GuestPanicked)]
    #[case("inmigrate", RunState::Inmigrate)]
    fn run_state_uses_wire_spelling(#[case] wire: &str, #[case] expected: RunState) {
        let parsed: RunState = serde_json::from_value(json!(wire)).expect("run state parses");

        assert_eq!(parsed, expected);
        assert_eq!(parsed.as_str(), wire);
    }

    #[rstest]
    fn status_tolerates_missing_singlestep() {
        let status: StatusInfo =
            serde_json::from_value(json!({"running": false, "status": "paused"}))
                .expect("status parses");

        assert!(!status.singlestep);
        assert_eq!(status.status, RunState::Paused);
    }

    #[rstest]
    fn version_display_includes_package() {
        let version: VersionInfo = serde_json::from_value(json!({
            "qemu": {"major": 8, "minor": 2, "micro": 1},
            "package": " Debian 1:8.2.1 "
        }))
        .expect("version parses");

        assert_eq!(version.to_string(), "8.2.1 (Debian 1:8.2.1)");
    }

    #[rstest]
    fn human_command_omits_absent_cpu_index() {
        let value = serde_json::to_value(HumanCommand::new("info cpus")).expect("serialises");

        assert_eq!(value, json!({"command-line": "info cpus"}));
    }
}
