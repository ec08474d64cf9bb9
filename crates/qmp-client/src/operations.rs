//! Typed façade over the operation registry.
//!
//! [`Connection::execute`] validates arguments against the registry, sends
//! the command and decodes the reply into the registered [`Output`] shape.
//! The named methods are thin wrappers that marshal typed arguments and
//! unwrap the expected output variant.

use std::time::Duration;

use serde::Serialize;
use serde::de::Error as _;
use serde_json::{Map, Value};

use crate::capability::CapabilitySet;
use crate::connection::Connection;
use crate::correlator::Completion;
use crate::error::{InputError, QmpError};
use crate::schema::{self, Gate, Operation, OperationSpec, OutputShape, ReplyPolicy};
use crate::types::{CommandInfo, HumanCommand, KvmInfo, StatusInfo, VersionInfo};

/// Decoded success payload of a registered operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Output {
    /// Empty object.
    Empty,
    /// Result of `query-kvm`.
    Kvm(KvmInfo),
    /// Result of `query-status`.
    Status(StatusInfo),
    /// Result of `query-version`.
    Version(VersionInfo),
    /// Result of `query-commands`.
    Commands(Vec<CommandInfo>),
    /// Result of `human-monitor-command`.
    Text(String),
}

impl Output {
    /// Decodes `payload` according to the output shape registered for
    /// `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::Decode`] when the payload does not match.
    pub fn decode(operation: Operation, payload: Value) -> Result<Self, QmpError> {
        let decoded = match operation.spec().output {
            OutputShape::Empty if payload.is_object() => Ok(Self::Empty),
            OutputShape::Empty => Err(serde_json::Error::custom(format!(
                "expected an empty object, found {payload}"
            ))),
            OutputShape::Kvm => serde_json::from_value(payload).map(Self::Kvm),
            OutputShape::Status => serde_json::from_value(payload).map(Self::Status),
            OutputShape::Version => serde_json::from_value(payload).map(Self::Version),
            OutputShape::Commands => serde_json::from_value(payload).map(Self::Commands),
            OutputShape::Text => serde_json::from_value(payload).map(Self::Text),
        };
        decoded.map_err(|source| QmpError::Decode { operation, source })
    }
}

fn mismatch(operation: Operation, output: &Output) -> QmpError {
    QmpError::Decode {
        operation,
        source: serde_json::Error::custom(format!(
            "registry declares {:?} output but decoding produced {output:?}",
            operation.spec().output
        )),
    }
}

fn completion_for(spec: &OperationSpec, arguments: &Map<String, Value>) -> Completion {
    match (spec.gate, spec.reply) {
        (Gate::Negotiation, _) => {
            Completion::Negotiation(CapabilitySet::from_enable_argument(arguments.get("enable")))
        }
        (Gate::Ready, ReplyPolicy::ReplyOrClose) => Completion::Quit,
        (Gate::Ready, ReplyPolicy::Always) => Completion::Plain,
    }
}

fn arguments_of<T: Serialize>(command: &str, arguments: &T) -> Result<Map<String, Value>, QmpError> {
    match serde_json::to_value(arguments) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(InputError::NotAnObject {
            command: command.to_owned(),
        }
        .into()),
        Err(source) => Err(QmpError::Encode {
            command: command.to_owned(),
            source,
        }),
    }
}

macro_rules! empty_operation {
    ($(#[$meta:meta])* $name:ident => $operation:expr) => {
        $(#[$meta])*
        ///
        /// # Errors
        ///
        /// Returns [`QmpError::StateViolation`] unless the connection is
        /// ready, [`QmpError::Peer`] when the monitor refuses, and a
        /// connection error when the connection fails while waiting.
        pub fn $name(&self) -> Result<(), QmpError> {
            self.execute($operation, Map::new()).map(drop)
        }
    };
}

macro_rules! query_operation {
    ($(#[$meta:meta])* $name:ident => $operation:expr, $variant:ident, $output:ty) => {
        $(#[$meta])*
        ///
        /// # Errors
        ///
        /// Returns [`QmpError::StateViolation`] unless the connection is
        /// ready, [`QmpError::Peer`] when the monitor refuses,
        /// [`QmpError::Decode`] when the payload has the wrong shape, and a
        /// connection error when the connection fails while waiting.
        pub fn $name(&self) -> Result<$output, QmpError> {
            match self.execute($operation, Map::new())? {
                Output::$variant(value) => Ok(value),
                other => Err(mismatch($operation, &other)),
            }
        }
    };
}

impl Connection {
    /// Runs a registered operation with JSON arguments.
    ///
    /// Arguments are validated before anything is written: required fields
    /// must be present and non-null, and unknown fields are refused.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::InvalidInput`] when validation fails, otherwise
    /// the errors described for the named methods.
    pub fn execute(
        &self,
        operation: Operation,
        arguments: Map<String, Value>,
    ) -> Result<Output, QmpError> {
        let spec = operation.spec();
        schema::validate_arguments(spec, &arguments)?;
        let completion = completion_for(spec, &arguments);
        let payload = self.submit(spec.command, spec.gate, completion, arguments)?;
        Output::decode(operation, payload)
    }

    /// Sends any command by wire name and returns the raw success payload.
    ///
    /// Registered names keep their state gate and lifecycle effects;
    /// unregistered names require the ready state and are not validated.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::StateViolation`] when the gate is closed,
    /// [`QmpError::Peer`] when the monitor refuses, and a connection error
    /// when the connection fails while waiting.
    pub fn execute_raw(
        &self,
        command: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, QmpError> {
        let (gate, completion) = Self::route_raw(command, &arguments);
        self.submit(command, gate, completion, arguments)
    }

    /// As [`Connection::execute_raw`] with an explicit deadline that
    /// overrides the connection default. `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// See [`Connection::execute_raw`]; additionally [`QmpError::Timeout`]
    /// when `timeout` expires.
    pub fn execute_raw_with_timeout(
        &self,
        command: &str,
        arguments: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, QmpError> {
        let (gate, completion) = Self::route_raw(command, &arguments);
        self.submit_with_timeout(command, gate, completion, arguments, timeout)
    }

    fn route_raw(command: &str, arguments: &Map<String, Value>) -> (Gate, Completion) {
        Operation::from_command(command).map_or((Gate::Ready, Completion::Plain), |operation| {
            let spec = operation.spec();
            (spec.gate, completion_for(spec, arguments))
        })
    }

    /// Asks the monitored process to exit. Succeeds whether the monitor
    /// replies or simply closes the stream; the connection ends up closed.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::StateViolation`] unless the connection is ready.
    pub fn quit(&self) -> Result<(), QmpError> {
        self.execute(Operation::Quit, Map::new()).map(drop)
    }

    empty_operation!(
        /// Pauses guest execution.
        stop => Operation::Stop
    );

    empty_operation!(
        /// Resumes guest execution.
        cont => Operation::Cont
    );

    empty_operation!(
        /// Performs a hard reset of the guest.
        system_reset => Operation::SystemReset
    );

    empty_operation!(
        /// Presses the virtual ACPI power button.
        system_powerdown => Operation::SystemPowerdown
    );

    empty_operation!(
        /// Wakes a suspended guest.
        system_wakeup => Operation::SystemWakeup
    );

    query_operation!(
        /// Reports hardware acceleration status.
        query_kvm => Operation::QueryKvm, Kvm, KvmInfo
    );

    query_operation!(
        /// Reports the guest run state.
        query_status => Operation::QueryStatus, Status, StatusInfo
    );

    query_operation!(
        /// Reports the monitored process version.
        query_version => Operation::QueryVersion, Version, VersionInfo
    );

    query_operation!(
        /// Lists the commands the monitor supports.
        query_commands => Operation::QueryCommands, Commands, Vec<CommandInfo>
    );

    /// Runs a human monitor command and returns its text output.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::InvalidInput`] when the arguments are invalid,
    /// otherwise the errors described for [`Connection::query_status`].
    pub fn human_monitor_command(&self, command: &HumanCommand) -> Result<String, QmpError> {
        let operation = Operation::HumanMonitorCommand;
        let arguments = arguments_of(operation.command(), command)?;
        match self.execute(operation, arguments)? {
            Output::Text(text) => Ok(text),
            other => Err(mismatch(operation, &other)),
        }
    }
}
