//! Connection lifecycle and the inbound reader thread.
//!
//! A [`Connection`] owns one monitor stream. Opening it reads the greeting
//! synchronously; after that a dedicated reader thread owns the read half,
//! classifies every inbound message and routes responses to the
//! [`Correlator`](crate::correlator) and events to the
//! [`EventDispatcher`](crate::events). Callers on any number of threads
//! share the connection by reference and serialise their writes through a
//! single writer lock.
//!
//! State changes caused by a response (negotiation success, quit) are
//! applied by the reader before the waiting caller is woken, so a caller
//! that sees `negotiate` return can immediately issue general commands.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use qmp_config::{
    Config, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_EVENT_QUEUE_CAPACITY,
    DEFAULT_MAX_MESSAGE_BYTES, EventOverflow, SocketEndpoint,
};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::capability::{Capability, CapabilitySet};
use crate::correlator::{Completion, CorrelationMode, Correlator, Deadline, Matched};
use crate::error::{ConnectionFailure, QmpError, SequenceError, TransportError};
use crate::events::{EventDispatcher, Subscription};
use crate::schema::{self, Gate, Operation};
use crate::state::{ConnectionState, StateLabel};
use crate::transport::{MessageReader, MessageWriter, MonitorStream};
use crate::wire::{Command, Greeting, Inbound, Response};

/// Tracing target for connection lifecycle events.
pub(crate) const CONNECTION_TARGET: &str = "qmp_client::connection";

const READER_THREAD_NAME: &str = "qmp-reader";

/// Tunables for a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Deadline for connecting and receiving the greeting.
    pub connect_timeout: Duration,
    /// Default per-command deadline; `None` waits indefinitely.
    pub command_timeout: Option<Duration>,
    /// Capabilities [`Connection::connect`] asks for.
    pub requested: CapabilitySet,
    /// Bounded length of each subscriber queue.
    pub event_queue_capacity: usize,
    /// Policy applied when a subscriber queue is full.
    pub event_overflow: EventOverflow,
    /// Number of recent events replayed to new subscribers.
    pub event_replay: usize,
    /// Largest accepted inbound line in bytes.
    pub max_message_bytes: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            command_timeout: Some(Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS)),
            requested: CapabilitySet::oob(),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            event_overflow: EventOverflow::default(),
            event_replay: 0,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl ConnectionOptions {
    /// Maps loaded configuration onto connection options.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let requested = if config.request_oob {
            CapabilitySet::oob()
        } else {
            CapabilitySet::new()
        };
        Self {
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
            requested,
            event_queue_capacity: config.event_queue_capacity,
            event_overflow: config.event_overflow,
            event_replay: config.event_replay,
            max_message_bytes: config.max_message_bytes,
        }
    }

    /// Replaces the default per-command deadline.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Replaces the requested capabilities.
    #[must_use]
    pub fn with_requested(mut self, requested: CapabilitySet) -> Self {
        self.requested = requested;
        self
    }

    /// Replaces the subscriber queue settings.
    #[must_use]
    pub const fn with_event_queue(mut self, capacity: usize, overflow: EventOverflow) -> Self {
        self.event_queue_capacity = capacity;
        self.event_overflow = overflow;
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    state: Mutex<ConnectionState>,
    greeting: Greeting,
    agreed: OnceLock<CapabilitySet>,
    correlator: Correlator,
    events: EventDispatcher,
    writer: Mutex<MessageWriter<MonitorStream>>,
    control: MonitorStream,
    command_timeout: Option<Duration>,
}

/// Client connection to a monitor.
///
/// All methods take `&self`; share the connection between threads with an
/// [`Arc`]. Dropping the connection closes it.
pub struct Connection {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Opens `endpoint` and reads the greeting. The connection is left in
    /// the negotiating state.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::Transport`] when the socket cannot be opened or
    /// closes before the greeting, [`QmpError::Timeout`] when the greeting
    /// does not arrive within the connect timeout, and a framing or sequence
    /// error when the first message is not a valid greeting.
    pub fn open(endpoint: &SocketEndpoint, options: &ConnectionOptions) -> Result<Self, QmpError> {
        schema::ensure_valid()?;
        info!(target: CONNECTION_TARGET, %endpoint, "connecting to monitor");
        let stream = MonitorStream::connect(endpoint, options.connect_timeout)?;
        Self::open_stream(stream, options)
    }

    /// Reads the greeting from an already-open stream.
    ///
    /// # Errors
    ///
    /// See [`Connection::open`].
    pub fn open_stream(stream: MonitorStream, options: &ConnectionOptions) -> Result<Self, QmpError> {
        schema::ensure_valid()?;
        let state = ConnectionState::Connecting.on_transport_opened()?;
        let read_half = stream.try_clone().map_err(TransportError::Io)?;
        let control = stream.try_clone().map_err(TransportError::Io)?;
        let mut reader = MessageReader::new(read_half, options.max_message_bytes);

        let greeting = match read_greeting(&mut reader, &control, options.connect_timeout) {
            Ok(greeting) => greeting,
            Err(failure) => {
                let failed = state.on_failure(ConnectionFailure::from_error(&failure));
                error!(
                    target: CONNECTION_TARGET,
                    state = %failed,
                    "monitor handshake failed"
                );
                shutdown_quietly(&control);
                return Err(failure);
            }
        };
        let state = state.on_greeting()?;
        info!(
            target: CONNECTION_TARGET,
            version = %greeting.version,
            offered = %greeting.capabilities,
            "received monitor greeting"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            greeting,
            agreed: OnceLock::new(),
            correlator: Correlator::new(),
            events: EventDispatcher::new(
                options.event_queue_capacity,
                options.event_overflow,
                options.event_replay,
            ),
            writer: Mutex::new(MessageWriter::new(stream)),
            control,
            command_timeout: options.command_timeout,
        });

        let reader_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(READER_THREAD_NAME.to_owned())
            .spawn(move || reader_shared.run_reader(reader))
            .map_err(|source| {
                shutdown_quietly(&shared.control);
                TransportError::Io(source)
            })?;

        Ok(Self {
            shared,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Opens `endpoint` and negotiates the capabilities in
    /// [`ConnectionOptions::requested`].
    ///
    /// # Errors
    ///
    /// Returns any error from [`Connection::open`] or
    /// [`Connection::negotiate`].
    pub fn connect(endpoint: &SocketEndpoint, options: &ConnectionOptions) -> Result<Self, QmpError> {
        let connection = Self::open(endpoint, options)?;
        connection.negotiate(&options.requested)?;
        Ok(connection)
    }

    /// Enables the requested capabilities that the monitor offered and moves
    /// the connection to the ready state. Returns the agreed set.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::StateViolation`] unless the connection is
    /// negotiating, and [`QmpError::Peer`] when the monitor refuses.
    pub fn negotiate(&self, requested: &CapabilitySet) -> Result<CapabilitySet, QmpError> {
        let agreed = requested.intersection(self.offered_capabilities());
        if agreed.len() < requested.len() {
            debug!(
                target: CONNECTION_TARGET,
                %requested,
                offered = %self.offered_capabilities(),
                "some requested capabilities were not offered"
            );
        }

        let mut arguments = Map::new();
        if !agreed.is_empty() {
            arguments.insert("enable".to_owned(), agreed.to_enable_argument());
        }
        self.execute_raw(Operation::Negotiate.command(), arguments)?;
        Ok(agreed)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.state).clone()
    }

    /// Greeting received when the connection opened.
    #[must_use]
    pub fn greeting(&self) -> &Greeting {
        &self.shared.greeting
    }

    /// Capabilities the monitor offered.
    #[must_use]
    pub fn offered_capabilities(&self) -> &CapabilitySet {
        &self.shared.greeting.capabilities
    }

    /// Capabilities enabled by negotiation, once it has succeeded.
    #[must_use]
    pub fn agreed_capabilities(&self) -> Option<&CapabilitySet> {
        self.shared.agreed.get()
    }

    /// How responses are currently matched to commands.
    #[must_use]
    pub fn correlation_mode(&self) -> CorrelationMode {
        self.shared.correlator.mode()
    }

    /// Registers an event subscriber. Only events received after this call
    /// are delivered, unless a replay buffer is configured.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::StateViolation`] once the connection is closed
    /// or failed.
    pub fn subscribe(&self) -> Result<Subscription, QmpError> {
        let refused = || QmpError::StateViolation {
            operation: "subscribe".to_owned(),
            state: self.state().label(),
        };
        if self.state().is_terminal() {
            return Err(refused());
        }
        self.shared.events.subscribe().ok_or_else(refused)
    }

    /// Removes a subscriber. Equivalent to dropping the subscription.
    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(
            target: CONNECTION_TARGET,
            subscriber = subscription.id(),
            "unsubscribing"
        );
        drop(subscription);
    }

    /// Closes the connection. Outstanding commands fail with
    /// [`QmpError::ConnectionFailed`]; subscribers can drain queued events.
    /// Calling `close` more than once has no further effect.
    pub fn close(&self) {
        let previous = {
            let mut state = lock(&self.shared.state);
            let previous = state.label();
            *state = state.on_close();
            previous
        };
        if !matches!(previous, StateLabel::Closed | StateLabel::Failed) {
            info!(target: CONNECTION_TARGET, from = %previous, "closing monitor connection");
        }

        shutdown_quietly(&self.shared.control);
        self.shared.finish(&ConnectionFailure::closed());

        let handle = lock(&self.reader).take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!(target: CONNECTION_TARGET, "reader thread panicked");
        }
    }

    /// Sends a command and waits for its reply using the default deadline.
    pub(crate) fn submit(
        &self,
        command: &str,
        gate: Gate,
        completion: Completion,
        arguments: Map<String, Value>,
    ) -> Result<Value, QmpError> {
        self.submit_with_timeout(command, gate, completion, arguments, self.shared.command_timeout)
    }

    /// Sends a command and waits up to `timeout` for its reply.
    pub(crate) fn submit_with_timeout(
        &self,
        command: &str,
        gate: Gate,
        completion: Completion,
        arguments: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, QmpError> {
        let shared = &self.shared;
        let refused = |state| QmpError::StateViolation {
            operation: command.to_owned(),
            state,
        };
        lock(&shared.state).admit(gate).map_err(refused)?;

        let deadline = Deadline::after(timeout);
        let ticket = shared.correlator.register(command, completion, &deadline)?;
        // Queueing for the serial slot may have outlasted the state that
        // admitted this command.
        if let Err(state) = lock(&shared.state).admit(gate) {
            shared.correlator.cancel(&ticket);
            return Err(refused(state));
        }
        let message = Command {
            execute: command.to_owned(),
            arguments,
            id: ticket.wire_id(),
        };

        debug!(target: CONNECTION_TARGET, command, id = ?message.id, "sending command");
        let written = lock(&shared.writer).write_message(&message);
        if let Err(failure) = written {
            shared.correlator.cancel(&ticket);
            let failure = QmpError::from(failure);
            shared.fail(&failure);
            return Err(failure);
        }

        match shared.correlator.wait(&ticket, command, &deadline)? {
            Ok(payload) => {
                debug!(target: CONNECTION_TARGET, command, "command succeeded");
                Ok(payload)
            }
            Err(source) => {
                debug!(
                    target: CONNECTION_TARGET,
                    command,
                    class = %source.class,
                    "monitor rejected command"
                );
                Err(QmpError::Peer {
                    command: command.to_owned(),
                    source,
                })
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("state", &self.state())
            .field("version", &self.shared.greeting.version)
            .field("agreed", &self.agreed_capabilities())
            .finish_non_exhaustive()
    }
}

fn read_greeting(
    reader: &mut MessageReader<MonitorStream>,
    control: &MonitorStream,
    timeout: Duration,
) -> Result<Greeting, QmpError> {
    let limit = (!timeout.is_zero()).then_some(timeout);
    control.set_read_timeout(limit).map_err(TransportError::Io)?;

    let message = match reader.read_message() {
        Ok(Some(message)) => message,
        Ok(None) => return Err(TransportError::UnexpectedEof.into()),
        Err(QmpError::Transport(TransportError::Io(source)))
            if matches!(
                source.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            return Err(QmpError::Timeout {
                command: "greeting".to_owned(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Err(other) => return Err(other),
    };
    control.set_read_timeout(None).map_err(TransportError::Io)?;

    match Inbound::classify(message)? {
        Inbound::Greeting(greeting) => Ok(greeting),
        other => Err(SequenceError::MissingGreeting {
            found: other.kind(),
        }
        .into()),
    }
}

fn shutdown_quietly(stream: &MonitorStream) {
    if let Err(error) = stream.shutdown() {
        debug!(target: CONNECTION_TARGET, %error, "socket shutdown reported an error");
    }
}

impl Shared {
    fn run_reader(&self, mut reader: MessageReader<MonitorStream>) {
        debug!(target: CONNECTION_TARGET, "reader thread started");
        loop {
            match reader.read_message() {
                Ok(Some(message)) => {
                    if let Err(failure) = self.route(message) {
                        self.fail(&failure);
                        break;
                    }
                }
                Ok(None) => {
                    self.end_of_stream();
                    break;
                }
                Err(failure) => {
                    if self.is_closed() {
                        self.finish(&ConnectionFailure::closed());
                    } else {
                        self.fail(&failure);
                    }
                    break;
                }
            }
        }
        debug!(target: CONNECTION_TARGET, "reader thread exiting");
    }

    fn is_closed(&self) -> bool {
        matches!(*lock(&self.state), ConnectionState::Closed)
    }

    fn route(&self, message: Map<String, Value>) -> Result<(), QmpError> {
        let inbound = Inbound::classify(message)?;
        let state = lock(&self.state).clone();
        state.accepts(inbound.kind())?;

        match inbound {
            Inbound::Greeting(_) => Err(SequenceError::DuplicateGreeting.into()),
            Inbound::Event(event) => {
                debug!(target: CONNECTION_TARGET, event = %event.name, "event received");
                self.events.publish(event);
                Ok(())
            }
            Inbound::Response(response) if state == ConnectionState::Closed => {
                debug!(
                    target: CONNECTION_TARGET,
                    id = ?response.id,
                    "discarding response received after close"
                );
                Ok(())
            }
            Inbound::Response(response) => self.resolve(response),
        }
    }

    fn resolve(&self, response: Response) -> Result<(), QmpError> {
        let matched = self.correlator.take(response.id.as_ref())?;
        let applied = if response.outcome.is_ok() {
            self.complete(matched.completion())
        } else {
            Ok(())
        };
        self.correlator.release();

        match matched {
            Matched::Abandoned { key, command, .. } => {
                applied?;
                warn!(
                    target: CONNECTION_TARGET,
                    command,
                    key,
                    "discarding late response for a command whose caller timed out"
                );
                Ok(())
            }
            Matched::Live(pending) => match applied {
                Ok(()) => {
                    pending.deliver(response.outcome);
                    Ok(())
                }
                Err(failure) => {
                    pending.fail(ConnectionFailure::from_error(&failure));
                    Err(failure)
                }
            },
        }
    }

    fn complete(&self, completion: &Completion) -> Result<(), QmpError> {
        match completion {
            Completion::Plain => Ok(()),
            Completion::Negotiation(agreed) => {
                let mut state = lock(&self.state);
                let next = state.on_negotiated()?;
                if agreed.contains(&Capability::Oob) {
                    self.correlator.set_mode(CorrelationMode::OutOfBand);
                }
                self.agreed.get_or_init(|| agreed.clone());
                *state = next;
                info!(target: CONNECTION_TARGET, %agreed, "capabilities negotiated; connection ready");
                Ok(())
            }
            Completion::Quit => {
                let mut state = lock(&self.state);
                *state = state.on_close();
                info!(target: CONNECTION_TARGET, "monitor acknowledged quit");
                Ok(())
            }
        }
    }

    fn end_of_stream(&self) {
        if let Some(pending) = self.correlator.take_quit() {
            debug!(
                target: CONNECTION_TARGET,
                command = %pending.command,
                "stream closed while quit was outstanding; treating as success"
            );
            if let Err(failure) = self.complete(&pending.completion) {
                warn!(target: CONNECTION_TARGET, %failure, "quit completion failed");
            }
            pending.deliver(Ok(Value::Object(Map::new())));
        }

        if self.is_closed() {
            debug!(target: CONNECTION_TARGET, "monitor closed the stream");
            self.finish(&ConnectionFailure::closed());
        } else {
            self.fail(&TransportError::UnexpectedEof.into());
        }
    }

    /// Moves to the failed state and tears everything down.
    fn fail(&self, failure: &QmpError) {
        let reason = ConnectionFailure::from_error(failure);
        {
            let mut state = lock(&self.state);
            if !state.is_terminal() {
                error!(
                    target: CONNECTION_TARGET,
                    from = %state.label(),
                    error = %failure,
                    "monitor connection failed"
                );
            }
            *state = state.on_failure(reason.clone());
        }
        shutdown_quietly(&self.control);
        self.finish(&reason);
    }

    /// Resolves pending commands, stops event delivery and refuses writes.
    fn finish(&self, reason: &ConnectionFailure) {
        self.correlator.fail_all(reason);
        self.events.close();
        lock(&self.writer).close();
    }
}
