//! BDD test world holding a connection and its scripted monitor.

use serde_json::{Value, json};

use super::fake_monitor::{MonitorThread, spawn_monitor};
use crate::{CapabilitySet, Connection, ConnectionOptions, QmpError, StatusInfo};

/// Reply the scripted monitor gives to the next command it reads.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Success payload.
    Return(Value),
    /// Error object.
    Error {
        /// Error class.
        class: String,
        /// Description.
        desc: String,
    },
}

impl ScriptedReply {
    /// Status payload of a running guest.
    pub fn running_guest() -> Self {
        Self::Return(json!({"running": true, "singlestep": false, "status": "running"}))
    }
}

/// Shared state exercised by BDD step implementations.
#[derive(Default)]
pub struct SessionWorld {
    capabilities: Vec<String>,
    replies: Vec<ScriptedReply>,
    monitor: Option<MonitorThread>,
    /// Connection under test.
    pub connection: Option<Connection>,
    /// Capabilities agreed by negotiation.
    pub agreed: Option<CapabilitySet>,
    /// Result of the last status query.
    pub status: Option<StatusInfo>,
    /// Whether the last command succeeded.
    pub succeeded: bool,
    /// Last error observed.
    pub last_error: Option<QmpError>,
}

impl SessionWorld {
    /// Sets the capabilities the monitor will offer.
    pub fn offer(&mut self, capabilities: Vec<String>) {
        self.capabilities = capabilities;
    }

    /// Queues the monitor's reply to the next general command.
    pub fn enqueue(&mut self, reply: ScriptedReply) {
        self.replies.push(reply);
    }

    /// Starts the monitor and negotiates `requested` against it.
    pub fn connect(&mut self, requested: &CapabilitySet) {
        let capabilities = self.capabilities.clone();
        let replies = std::mem::take(&mut self.replies);
        let (stream, monitor) = spawn_monitor(move |peer| {
            let offered: Vec<&str> = capabilities.iter().map(String::as_str).collect();
            peer.greet_and_negotiate(&offered)?;
            for reply in replies {
                let command = peer.read_command()?;
                match reply {
                    ScriptedReply::Return(payload) => peer.reply(&command, payload)?,
                    ScriptedReply::Error { class, desc } => peer.reject(&command, &class, &desc)?,
                }
            }
            peer.wait_for_hangup()
        });
        self.monitor = Some(monitor);

        let options = ConnectionOptions::default().with_requested(requested.clone());
        match Connection::open_stream(stream, &options) {
            Ok(connection) => {
                match connection.negotiate(requested) {
                    Ok(agreed) => self.agreed = Some(agreed),
                    Err(error) => self.last_error = Some(error),
                }
                self.connection = Some(connection);
            }
            Err(error) => self.last_error = Some(error),
        }
    }

    /// Connection under test; panics when the connect step failed.
    pub fn connection(&self) -> &Connection {
        self.connection
            .as_ref()
            .expect("connection should have been opened")
    }

    /// Records the outcome of a command.
    pub fn record<T>(&mut self, result: Result<T, QmpError>) -> Option<T> {
        match result {
            Ok(value) => {
                self.succeeded = true;
                self.last_error = None;
                Some(value)
            }
            Err(error) => {
                self.succeeded = false;
                self.last_error = Some(error);
                None
            }
        }
    }

    /// Commands the monitor has read, including negotiation.
    pub fn received(&self) -> Vec<Value> {
        self.monitor
            .as_ref()
            .map(MonitorThread::received)
            .unwrap_or_default()
    }
}

impl Drop for SessionWorld {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        if let Some(monitor) = self.monitor.take()
            && let Err(error) = monitor.join()
            && !std::thread::panicking()
        {
            panic!("monitor script failed: {error:#}");
        }
    }
}
