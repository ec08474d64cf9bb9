//! Error taxonomy for the monitor client.
//!
//! Errors fall into two groups. Connection-fatal errors (transport, framing,
//! sequence and correlation failures) move the connection into its failed
//! state and resolve every pending command. Command-local errors (peer
//! rejections, invalid input, decode failures, state gate violations and
//! timeouts) affect only the caller that triggered them.

use std::fmt;
use std::io;

use serde::Deserialize;
use thiserror::Error;

use crate::schema::Operation;
use crate::state::{MessageKind, StateLabel, Transition};

/// Errors raised by the monitor client.
#[derive(Debug, Error)]
pub enum QmpError {
    /// The byte stream failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An inbound line could not be turned into a protocol message.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The peer sent a message the protocol does not allow in the current state.
    #[error("protocol sequence error: {0}")]
    Sequence(#[from] SequenceError),

    /// A response carried an identifier that was never issued.
    #[error("response id {id} matches no issued command")]
    UnmatchedResponse {
        /// Identifier as it appeared on the wire.
        id: String,
    },

    /// The caller attempted an operation the connection state does not permit.
    #[error("{operation} is not permitted while the connection is {state}")]
    StateViolation {
        /// Command or API call that was refused.
        operation: String,
        /// State the connection was in.
        state: StateLabel,
    },

    /// The monitor answered with an error object.
    #[error("monitor rejected {command}: {source}")]
    Peer {
        /// Command that was rejected.
        command: String,
        /// Error reported by the monitor.
        #[source]
        source: PeerError,
    },

    /// Arguments failed local validation; nothing was sent.
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InputError),

    /// Arguments could not be serialised.
    #[error("failed to encode arguments for {command}: {source}")]
    Encode {
        /// Command whose arguments failed to encode.
        command: String,
        /// Underlying serialisation error.
        #[source]
        source: serde_json::Error,
    },

    /// A success payload did not match the registered output shape.
    #[error("failed to decode {operation} result: {source}")]
    Decode {
        /// Operation whose result failed to decode.
        operation: Operation,
        /// Underlying deserialisation error.
        #[source]
        source: serde_json::Error,
    },

    /// The caller-side deadline expired before a reply arrived.
    #[error("{command} timed out after {timeout_ms}ms")]
    Timeout {
        /// Command that timed out.
        command: String,
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The connection failed or closed while the command was outstanding.
    #[error(transparent)]
    ConnectionFailed(#[from] ConnectionFailure),

    /// The static operation registry is inconsistent.
    #[error("operation registry is invalid: {0}")]
    Registry(#[from] RegistryError),
}

impl QmpError {
    /// Returns the monitor's error object when the peer rejected a command.
    #[must_use]
    pub const fn peer_error(&self) -> Option<&PeerError> {
        match self {
            Self::Peer { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the error came from the monitor rejecting a command.
    #[must_use]
    pub const fn is_peer_error(&self) -> bool {
        matches!(self, Self::Peer { .. })
    }

    /// Whether the error ends the connection.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Framing(_)
                | Self::Sequence(_)
                | Self::UnmatchedResponse { .. }
                | Self::ConnectionFailed(_)
        )
    }
}

/// Transport-layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Resolving the monitor address failed.
    #[error("failed to resolve monitor address {endpoint}: {source}")]
    Resolve {
        /// Endpoint that failed to resolve.
        endpoint: String,
        /// Underlying resolution error.
        #[source]
        source: io::Error,
    },

    /// Connecting to the monitor failed.
    #[error("failed to connect to monitor at {endpoint}: {source}")]
    Connect {
        /// Endpoint that refused the connection.
        endpoint: String,
        /// Underlying connection error.
        #[source]
        source: io::Error,
    },

    /// Unix sockets are unavailable on this platform.
    #[cfg(not(unix))]
    #[error("platform does not support Unix sockets: {0}")]
    UnsupportedUnixTransport(String),

    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The monitor closed the stream before the protocol allowed it.
    #[error("monitor closed the stream unexpectedly")]
    UnexpectedEof,

    /// A write was attempted after the transport closed.
    #[error("write attempted after the transport was closed")]
    WriteAfterClose,
}

/// Errors turning inbound lines into protocol messages.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The stream ended part-way through a line.
    #[error("stream ended inside a partial message ({buffered} bytes buffered)")]
    PartialMessage {
        /// Bytes received without a terminating newline.
        buffered: usize,
    },

    /// A line exceeded the configured size limit.
    #[error("message exceeds the {limit} byte limit")]
    Oversized {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// A line was not valid JSON.
    #[error("message is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// A line held JSON that was not an object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// An object matched none of the greeting, response or event shapes.
    #[error("message has no recognised shape (keys: {keys})")]
    UnknownShape {
        /// Comma-separated top-level keys of the message.
        keys: String,
    },

    /// An object looked like a known message but its body was malformed.
    #[error("malformed {kind}: {source}")]
    Malformed {
        /// Kind of message that failed to parse.
        kind: MessageKind,
        /// Underlying deserialisation error.
        #[source]
        source: serde_json::Error,
    },
}

/// Inbound messages that violate the protocol ordering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// The first message was not a greeting.
    #[error("expected a greeting but received {found}")]
    MissingGreeting {
        /// Kind of message that arrived instead.
        found: MessageKind,
    },

    /// A greeting arrived after the handshake had started.
    #[error("received a second greeting")]
    DuplicateGreeting,

    /// A message arrived in a state that does not accept it.
    #[error("received {found} while {state}")]
    Unexpected {
        /// Kind of message that arrived.
        found: MessageKind,
        /// State the connection was in.
        state: StateLabel,
    },

    /// A lifecycle transition was requested from the wrong state.
    #[error("cannot apply {transition} while {state}")]
    IllegalTransition {
        /// Requested transition.
        transition: Transition,
        /// State the connection was in.
        state: StateLabel,
    },
}

/// Error object returned by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Error)]
#[error("{class}: {desc}")]
pub struct PeerError {
    /// Error class, for example `CommandNotFound` or `GenericError`.
    pub class: String,
    /// Human-readable description.
    pub desc: String,
}

/// Local validation failures for command arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    /// A required argument was missing or null.
    #[error("{operation} requires the '{field}' argument")]
    MissingField {
        /// Operation being invoked.
        operation: Operation,
        /// Missing field.
        field: &'static str,
    },

    /// An argument is not part of the operation's input shape.
    #[error("{operation} does not accept the '{field}' argument")]
    UnknownField {
        /// Operation being invoked.
        operation: Operation,
        /// Unexpected field.
        field: String,
    },

    /// An argument had the wrong JSON type.
    #[error("{operation} expects '{field}' to be {expected}")]
    WrongType {
        /// Operation being invoked.
        operation: Operation,
        /// Offending field.
        field: &'static str,
        /// Description of the expected type.
        expected: &'static str,
    },

    /// Typed arguments did not serialise to a JSON object.
    #[error("arguments for {command} must be a JSON object")]
    NotAnObject {
        /// Command being invoked.
        command: String,
    },
}

/// Inconsistencies detected in the static operation registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An operation has no registry entry, or more than one.
    #[error("{operation} is registered {count} times")]
    Registration {
        /// Operation affected.
        operation: Operation,
        /// Number of entries found.
        count: usize,
    },

    /// Two entries share a wire command name.
    #[error("command name '{command}' is registered more than once")]
    DuplicateCommand {
        /// Duplicated wire name.
        command: &'static str,
    },

    /// An entry lists the same input field twice.
    #[error("{operation} declares the '{field}' argument more than once")]
    DuplicateField {
        /// Operation affected.
        operation: Operation,
        /// Duplicated field.
        field: &'static str,
    },

    /// The negotiation gate is held by something other than the handshake.
    #[error("{operation} has an inconsistent state gate or reply policy")]
    Policy {
        /// Operation affected.
        operation: Operation,
    },
}

/// Reason a connection stopped serving commands.
///
/// Cloned into every caller whose command was outstanding when the
/// connection failed or closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connection {kind}: {message}")]
pub struct ConnectionFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Description of the triggering error.
    pub message: String,
}

impl ConnectionFailure {
    /// Failure reported to callers when the connection closes cleanly.
    #[must_use]
    pub fn closed() -> Self {
        Self {
            kind: FailureKind::Closed,
            message: "connection closed".to_owned(),
        }
    }

    /// Summarises a connection-fatal error.
    #[must_use]
    pub fn from_error(error: &QmpError) -> Self {
        let kind = match error {
            QmpError::Transport(TransportError::UnexpectedEof) => FailureKind::EndOfStream,
            QmpError::Transport(_) => FailureKind::Transport,
            QmpError::Framing(_) => FailureKind::Framing,
            QmpError::Sequence(_) => FailureKind::Sequence,
            QmpError::UnmatchedResponse { .. } => FailureKind::Correlation,
            QmpError::ConnectionFailed(failure) => return failure.clone(),
            _ => FailureKind::Transport,
        };
        Self {
            kind,
            message: error.to_string(),
        }
    }
}

/// Category of a [`ConnectionFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Reading or writing the byte stream failed.
    Transport,
    /// The peer closed the stream without being asked to.
    EndOfStream,
    /// An inbound line was not a valid message.
    Framing,
    /// The peer violated the message ordering.
    Sequence,
    /// A response could not be matched to a command.
    Correlation,
    /// The connection was closed deliberately.
    Closed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transport => "transport failure",
            Self::EndOfStream => "ended by the monitor",
            Self::Framing => "framing failure",
            Self::Sequence => "protocol sequence violation",
            Self::Correlation => "correlation failure",
            Self::Closed => "closed",
        };
        formatter.write_str(label)
    }
}
