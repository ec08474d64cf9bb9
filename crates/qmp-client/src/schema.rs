//! Static registry of the operations the client understands.
//!
//! Each [`Operation`] has exactly one [`OperationSpec`] naming its wire
//! command, the arguments it accepts, the shape of its success payload, the
//! state it may be issued in and how its reply is delivered. The connection
//! and the typed façade read everything from this table; nothing about an
//! operation is hard-coded elsewhere.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use serde_json::{Map, Value};

use crate::error::{InputError, QmpError, RegistryError};

/// Operations with a registered schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    /// Capability negotiation (`qmp_capabilities`).
    Negotiate,
    /// Terminate the monitored process (`quit`).
    Quit,
    /// Pause guest execution (`stop`).
    Stop,
    /// Resume guest execution (`cont`).
    Cont,
    /// Hard reset (`system_reset`).
    SystemReset,
    /// ACPI power button press (`system_powerdown`).
    SystemPowerdown,
    /// Wake a suspended guest (`system_wakeup`).
    SystemWakeup,
    /// Hardware acceleration status (`query-kvm`).
    QueryKvm,
    /// Run state (`query-status`).
    QueryStatus,
    /// Monitor version (`query-version`).
    QueryVersion,
    /// Supported command names (`query-commands`).
    QueryCommands,
    /// Human monitor passthrough (`human-monitor-command`).
    HumanMonitorCommand,
}

/// State gate guarding an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Permitted only between the greeting and successful negotiation.
    Negotiation,
    /// Permitted only once negotiation has succeeded.
    Ready,
}

/// How an operation's reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// The monitor always answers with a response.
    Always,
    /// The monitor may close the stream instead of answering; either
    /// outcome counts as success.
    ReplyOrClose,
}

/// Shape of an operation's success payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// Empty object.
    Empty,
    /// `{ enabled, present }`.
    Kvm,
    /// `{ running, singlestep, status }`.
    Status,
    /// `{ qemu: { major, minor, micro }, package }`.
    Version,
    /// `[{ name }, ...]`.
    Commands,
    /// Free-form text.
    Text,
}

/// JSON type accepted for an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// String value.
    String,
    /// Integer value.
    Integer,
    /// Array of strings.
    StringList,
}

impl FieldKind {
    const fn describe(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::StringList => "an array of strings",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }
}

/// One argument of an operation's input shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Wire name of the argument.
    pub name: &'static str,
    /// Whether the argument must be present and non-null.
    pub required: bool,
    /// Accepted JSON type.
    pub kind: FieldKind,
}

/// Registry entry describing one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSpec {
    /// Operation described by this entry.
    pub operation: Operation,
    /// Wire command name.
    pub command: &'static str,
    /// Accepted arguments.
    pub fields: &'static [FieldSpec],
    /// Success payload shape.
    pub output: OutputShape,
    /// State in which the operation may be issued.
    pub gate: Gate,
    /// How the reply is delivered.
    pub reply: ReplyPolicy,
}

const fn plain(operation: Operation, command: &'static str) -> OperationSpec {
    OperationSpec {
        operation,
        command,
        fields: &[],
        output: OutputShape::Empty,
        gate: Gate::Ready,
        reply: ReplyPolicy::Always,
    }
}

const fn query(operation: Operation, command: &'static str, output: OutputShape) -> OperationSpec {
    OperationSpec {
        output,
        ..plain(operation, command)
    }
}

const NEGOTIATE: OperationSpec = OperationSpec {
    fields: &[FieldSpec {
        name: "enable",
        required: false,
        kind: FieldKind::StringList,
    }],
    gate: Gate::Negotiation,
    ..plain(Operation::Negotiate, "qmp_capabilities")
};
const QUIT: OperationSpec = OperationSpec {
    reply: ReplyPolicy::ReplyOrClose,
    ..plain(Operation::Quit, "quit")
};
const STOP: OperationSpec = plain(Operation::Stop, "stop");
const CONT: OperationSpec = plain(Operation::Cont, "cont");
const SYSTEM_RESET: OperationSpec = plain(Operation::SystemReset, "system_reset");
const SYSTEM_POWERDOWN: OperationSpec = plain(Operation::SystemPowerdown, "system_powerdown");
const SYSTEM_WAKEUP: OperationSpec = plain(Operation::SystemWakeup, "system_wakeup");
const QUERY_KVM: OperationSpec = query(Operation::QueryKvm, "query-kvm", OutputShape::Kvm);
const QUERY_STATUS: OperationSpec =
    query(Operation::QueryStatus, "query-status", OutputShape::Status);
const QUERY_VERSION: OperationSpec =
    query(Operation::QueryVersion, "query-version", OutputShape::Version);
const QUERY_COMMANDS: OperationSpec =
    query(Operation::QueryCommands, "query-commands", OutputShape::Commands);
const HUMAN_MONITOR_COMMAND: OperationSpec = OperationSpec {
    fields: &[
        FieldSpec {
            name: "command-line",
            required: true,
            kind: FieldKind::String,
        },
        FieldSpec {
            name: "cpu-index",
            required: false,
            kind: FieldKind::Integer,
        },
    ],
    ..query(
        Operation::HumanMonitorCommand,
        "human-monitor-command",
        OutputShape::Text,
    )
};

static REGISTRY: [OperationSpec; 12] = [
    NEGOTIATE,
    QUIT,
    STOP,
    CONT,
    SYSTEM_RESET,
    SYSTEM_POWERDOWN,
    SYSTEM_WAKEUP,
    QUERY_KVM,
    QUERY_STATUS,
    QUERY_VERSION,
    QUERY_COMMANDS,
    HUMAN_MONITOR_COMMAND,
];

impl Operation {
    /// Every registered operation.
    pub const ALL: [Self; 12] = [
        Self::Negotiate,
        Self::Quit,
        Self::Stop,
        Self::Cont,
        Self::SystemReset,
        Self::SystemPowerdown,
        Self::SystemWakeup,
        Self::QueryKvm,
        Self::QueryStatus,
        Self::QueryVersion,
        Self::QueryCommands,
        Self::HumanMonitorCommand,
    ];

    /// Registry entry for the operation.
    #[must_use]
    pub const fn spec(self) -> &'static OperationSpec {
        match self {
            Self::Negotiate => &NEGOTIATE,
            Self::Quit => &QUIT,
            Self::Stop => &STOP,
            Self::Cont => &CONT,
            Self::SystemReset => &SYSTEM_RESET,
            Self::SystemPowerdown => &SYSTEM_POWERDOWN,
            Self::SystemWakeup => &SYSTEM_WAKEUP,
            Self::QueryKvm => &QUERY_KVM,
            Self::QueryStatus => &QUERY_STATUS,
            Self::QueryVersion => &QUERY_VERSION,
            Self::QueryCommands => &QUERY_COMMANDS,
            Self::HumanMonitorCommand => &HUMAN_MONITOR_COMMAND,
        }
    }

    /// Wire command name.
    #[must_use]
    pub const fn command(self) -> &'static str {
        self.spec().command
    }

    /// Looks up an operation by its wire command name.
    #[must_use]
    pub fn from_command(command: &str) -> Option<Self> {
        registry()
            .iter()
            .find(|spec| spec.command == command)
            .map(|spec| spec.operation)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.command())
    }
}

/// Every registry entry in declaration order.
#[must_use]
pub fn registry() -> &'static [OperationSpec] {
    &REGISTRY
}

/// Checks the registry for internal consistency.
///
/// # Errors
///
/// Returns the first inconsistency found.
pub fn validate() -> Result<(), RegistryError> {
    validate_entries(registry())
}

/// Runs [`validate`] once per process and caches the outcome.
pub(crate) fn ensure_valid() -> Result<(), QmpError> {
    static OUTCOME: OnceLock<Result<(), RegistryError>> = OnceLock::new();
    OUTCOME
        .get_or_init(validate)
        .clone()
        .map_err(QmpError::from)
}

fn validate_entries(entries: &[OperationSpec]) -> Result<(), RegistryError> {
    for operation in Operation::ALL {
        let count = entries
            .iter()
            .filter(|entry| entry.operation == operation)
            .count();
        let canonical = entries
            .iter()
            .any(|entry| entry.operation == operation && entry == operation.spec());
        if count != 1 || !canonical {
            return Err(RegistryError::Registration { operation, count });
        }
    }

    let mut commands = BTreeSet::new();
    for entry in entries {
        if !commands.insert(entry.command) {
            return Err(RegistryError::DuplicateCommand {
                command: entry.command,
            });
        }

        let mut fields = BTreeSet::new();
        if let Some(field) = entry.fields.iter().find(|field| !fields.insert(field.name)) {
            return Err(RegistryError::DuplicateField {
                operation: entry.operation,
                field: field.name,
            });
        }

        let negotiates = entry.operation == Operation::Negotiate;
        let quits = entry.operation == Operation::Quit;
        if negotiates != (entry.gate == Gate::Negotiation)
            || quits != (entry.reply == ReplyPolicy::ReplyOrClose)
        {
            return Err(RegistryError::Policy {
                operation: entry.operation,
            });
        }
    }

    Ok(())
}

/// Validates caller-supplied arguments against an operation's input shape.
///
/// # Errors
///
/// Returns [`InputError`] when a required argument is missing or null, an
/// argument is not part of the shape, or an argument has the wrong type.
pub fn validate_arguments(
    spec: &OperationSpec,
    arguments: &Map<String, Value>,
) -> Result<(), InputError> {
    if let Some(unknown) = arguments
        .keys()
        .find(|name| !spec.fields.iter().any(|field| field.name == name.as_str()))
    {
        return Err(InputError::UnknownField {
            operation: spec.operation,
            field: unknown.clone(),
        });
    }

    for field in spec.fields {
        match arguments.get(field.name) {
            None | Some(Value::Null) if field.required => {
                return Err(InputError::MissingField {
                    operation: spec.operation,
                    field: field.name,
                });
            }
            Some(value) if !value.is_null() && !field.kind.matches(value) => {
                return Err(InputError::WrongType {
                    operation: spec.operation,
                    field: field.name,
                    expected: field.kind.describe(),
                });
            }
            _ => {}
        }
    }

    Ok(())
}
