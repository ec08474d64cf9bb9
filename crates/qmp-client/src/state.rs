//! Connection lifecycle state machine.
//!
//! ```text
//! Connecting -> AwaitingGreeting -> Negotiating -> Ready -> Closed
//!      \               \                \            \
//!       +---------------+----------------+------------+--> Failed
//! ```
//!
//! Transitions are pure functions of the current state so that the reader
//! thread and callers can apply them under a short-lived lock. `Closed` and
//! `Failed` are terminal; a failure never overwrites an earlier one.

use std::fmt;

use crate::error::{ConnectionFailure, SequenceError};
use crate::schema::Gate;

/// Lifecycle state of a monitor connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport is being opened.
    Connecting,
    /// The transport is open; the greeting has not arrived.
    AwaitingGreeting,
    /// The greeting arrived; only capability negotiation is permitted.
    Negotiating,
    /// Negotiation succeeded; general commands and events flow.
    Ready,
    /// The connection was closed by the caller or by a successful quit.
    Closed,
    /// The connection failed; the reason is kept for diagnostics.
    Failed(ConnectionFailure),
}

/// Payload-free view of a [`ConnectionState`], used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLabel {
    /// See [`ConnectionState::Connecting`].
    Connecting,
    /// See [`ConnectionState::AwaitingGreeting`].
    AwaitingGreeting,
    /// See [`ConnectionState::Negotiating`].
    Negotiating,
    /// See [`ConnectionState::Ready`].
    Ready,
    /// See [`ConnectionState::Closed`].
    Closed,
    /// See [`ConnectionState::Failed`].
    Failed,
}

impl fmt::Display for StateLabel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::AwaitingGreeting => "awaiting the greeting",
            Self::Negotiating => "negotiating",
            Self::Ready => "ready",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        formatter.write_str(label)
    }
}

/// Classification of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Server greeting.
    Greeting,
    /// Command response, success or error.
    Response,
    /// Asynchronous event.
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Greeting => "a greeting",
            Self::Response => "a response",
            Self::Event => "an event",
        };
        formatter.write_str(label)
    }
}

/// Lifecycle transitions that require a specific source state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transport finished opening.
    TransportOpened,
    /// The greeting was received.
    GreetingReceived,
    /// Capability negotiation succeeded.
    Negotiated,
}

impl fmt::Display for Transition {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::TransportOpened => "transport opened",
            Self::GreetingReceived => "greeting received",
            Self::Negotiated => "negotiation completed",
        };
        formatter.write_str(label)
    }
}

impl ConnectionState {
    /// Payload-free label of the state.
    #[must_use]
    pub const fn label(&self) -> StateLabel {
        match self {
            Self::Connecting => StateLabel::Connecting,
            Self::AwaitingGreeting => StateLabel::AwaitingGreeting,
            Self::Negotiating => StateLabel::Negotiating,
            Self::Ready => StateLabel::Ready,
            Self::Closed => StateLabel::Closed,
            Self::Failed(_) => StateLabel::Failed,
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    /// Whether general commands may be issued.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Connecting -> AwaitingGreeting.
    pub(crate) fn on_transport_opened(&self) -> Result<Self, SequenceError> {
        match self {
            Self::Connecting => Ok(Self::AwaitingGreeting),
            other => Err(other.illegal(Transition::TransportOpened)),
        }
    }

    /// AwaitingGreeting -> Negotiating.
    pub(crate) fn on_greeting(&self) -> Result<Self, SequenceError> {
        match self {
            Self::AwaitingGreeting => Ok(Self::Negotiating),
            Self::Negotiating | Self::Ready => Err(SequenceError::DuplicateGreeting),
            other => Err(other.illegal(Transition::GreetingReceived)),
        }
    }

    /// Negotiating -> Ready.
    pub(crate) fn on_negotiated(&self) -> Result<Self, SequenceError> {
        match self {
            Self::Negotiating => Ok(Self::Ready),
            other => Err(other.illegal(Transition::Negotiated)),
        }
    }

    /// Any state -> Closed, except that a failure is kept.
    pub(crate) fn on_close(&self) -> Self {
        match self {
            Self::Failed(failure) => Self::Failed(failure.clone()),
            _ => Self::Closed,
        }
    }

    /// Any non-terminal state -> Failed.
    pub(crate) fn on_failure(&self, failure: ConnectionFailure) -> Self {
        if self.is_terminal() {
            self.clone()
        } else {
            Self::Failed(failure)
        }
    }

    /// Checks whether a caller may issue a command guarded by `gate`.
    ///
    /// # Errors
    ///
    /// Returns the current state label when the gate is closed.
    pub fn admit(&self, gate: Gate) -> Result<(), StateLabel> {
        let open = match gate {
            Gate::Negotiation => matches!(self, Self::Negotiating),
            Gate::Ready => matches!(self, Self::Ready),
        };
        if open { Ok(()) } else { Err(self.label()) }
    }

    /// Checks whether an inbound message of `kind` is legal in this state.
    ///
    /// A closed connection drains whatever the peer still sends before the
    /// stream ends, so every kind is accepted there and discarded upstream.
    ///
    /// # Errors
    ///
    /// Returns a [`SequenceError`] describing the violation.
    pub fn accepts(&self, kind: MessageKind) -> Result<(), SequenceError> {
        match (self, kind) {
            (Self::AwaitingGreeting, MessageKind::Greeting)
            | (Self::Negotiating, MessageKind::Response)
            | (Self::Ready, MessageKind::Response | MessageKind::Event)
            | (Self::Closed, _) => Ok(()),
            (Self::AwaitingGreeting, found) => Err(SequenceError::MissingGreeting { found }),
            (Self::Negotiating | Self::Ready, MessageKind::Greeting) => {
                Err(SequenceError::DuplicateGreeting)
            }
            (state, found) => Err(SequenceError::Unexpected {
                found,
                state: state.label(),
            }),
        }
    }

    fn illegal(&self, transition: Transition) -> SequenceError {
        SequenceError::IllegalTransition {
            transition,
            state: self.label(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(failure) => write!(formatter, "failed ({failure})"),
            other => other.label().fmt(formatter),
        }
    }
}
