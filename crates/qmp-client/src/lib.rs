//! Client for the JSON monitor control protocol spoken by virtual machine
//! monitors.
//!
//! The protocol runs over a stream socket as newline-delimited JSON. The
//! server greets first, the client negotiates capabilities, and from then on
//! the client issues commands while the server answers them and emits
//! asynchronous events. This crate provides:
//!
//! - [`Connection`] for opening a socket, reading the greeting, negotiating
//!   and closing, with the lifecycle modelled by [`ConnectionState`];
//! - typed methods for every registered [`Operation`], plus
//!   [`Connection::execute_raw`] for unregistered commands;
//! - concurrent command submission from many threads, with responses paired
//!   in order or by identifier once out-of-band execution is agreed;
//! - event delivery to any number of [`Subscription`]s through bounded
//!   queues.
//!
//! ```no_run
//! use qmp_client::{Connection, ConnectionOptions};
//! use qmp_config::SocketEndpoint;
//!
//! # fn main() -> Result<(), qmp_client::QmpError> {
//! let endpoint = SocketEndpoint::unix("/run/vm/monitor.sock");
//! let connection = Connection::connect(&endpoint, &ConnectionOptions::default())?;
//! let status = connection.query_status()?;
//! println!("guest is {}", status.status);
//! # Ok(())
//! # }
//! ```

mod capability;
mod connection;
mod correlator;
mod error;
mod events;
mod operations;
pub mod schema;
mod state;
mod transport;
mod types;
mod wire;

pub use capability::{Capability, CapabilitySet};
pub use connection::{Connection, ConnectionOptions};
pub use correlator::CorrelationMode;
pub use error::{
    ConnectionFailure, FailureKind, FramingError, InputError, PeerError, QmpError, RegistryError,
    SequenceError, TransportError,
};
pub use events::{Event, EventKind, Subscription, Timestamp};
pub use operations::Output;
pub use qmp_config::EventOverflow;
pub use schema::Operation;
pub use state::{ConnectionState, MessageKind, StateLabel, Transition};
pub use transport::{MessageReader, MessageWriter, MonitorStream};
pub use types::{CommandInfo, HumanCommand, KvmInfo, QemuVersion, RunState, StatusInfo, VersionInfo};
pub use wire::{Command, Greeting, Inbound, Response};

#[cfg(all(test, unix))]
mod tests;
