//! Pairs responses with the callers waiting for them.
//!
//! Before out-of-band execution is negotiated the monitor answers commands
//! strictly in order and echoes no identifier, so at most one command may be
//! outstanding. Callers queue for that single slot. Once out-of-band mode is
//! active every command carries a fresh identifier and any number may be
//! outstanding.
//!
//! A caller that gives up on its deadline leaves its entry behind with no
//! waiter. When the late response eventually arrives its connection-level
//! effect still applies, the payload is discarded and, in serial mode, the
//! slot is released.
//!
//! Taking a response off the pending set does not free the serial slot by
//! itself; the reader calls [`Correlator::release`] once the response's
//! effect on the connection state is visible, so a queued command is never
//! admitted against a stale state.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::capability::CapabilitySet;
use crate::error::{ConnectionFailure, PeerError, QmpError};

/// Tracing target for correlation.
pub(crate) const CORRELATOR_TARGET: &str = "qmp_client::correlator";

/// How responses are matched to commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationMode {
    /// One command at a time, answered in order.
    Serial,
    /// Commands carry identifiers; responses may arrive in any order.
    OutOfBand,
}

/// Connection-level effect applied by the reader before a successful reply
/// is handed to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Completion {
    Plain,
    Negotiation(CapabilitySet),
    Quit,
}

pub(crate) type Reply = Result<Value, PeerError>;

#[derive(Debug)]
enum Outcome {
    Reply(Reply),
    Failed(ConnectionFailure),
}

/// An outstanding command taken off the pending set by the reader.
#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) key: u64,
    pub(crate) command: String,
    pub(crate) completion: Completion,
    waiter: Option<SyncSender<Outcome>>,
}

impl Pending {
    /// Hands the reply to the waiting caller.
    pub(crate) fn deliver(self, reply: Reply) {
        if let Some(waiter) = self.waiter {
            // The receiver only disappears if the caller thread died.
            drop(waiter.try_send(Outcome::Reply(reply)));
        }
    }

    /// Resolves the waiting caller with a connection failure instead of a
    /// reply.
    pub(crate) fn fail(self, failure: ConnectionFailure) {
        if let Some(waiter) = self.waiter {
            drop(waiter.try_send(Outcome::Failed(failure)));
        }
    }
}

/// Result of matching a response to the pending set.
#[derive(Debug)]
pub(crate) enum Matched {
    /// A caller is waiting.
    Live(Pending),
    /// The caller already timed out.
    Abandoned {
        key: u64,
        command: String,
        completion: Completion,
    },
}

impl Matched {
    /// Effect of a successful reply, whether or not anyone still waits.
    pub(crate) const fn completion(&self) -> &Completion {
        match self {
            Self::Live(pending) => &pending.completion,
            Self::Abandoned { completion, .. } => completion,
        }
    }
}

/// Handle returned by [`Correlator::register`].
#[derive(Debug)]
pub(crate) struct Ticket {
    key: u64,
    wire_id: Option<u64>,
    receiver: Receiver<Outcome>,
}

impl Ticket {
    /// Identifier to place on the wire, if any.
    pub(crate) const fn wire_id(&self) -> Option<u64> {
        self.wire_id
    }
}

/// Caller-side deadline for one command.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    expires: Option<Instant>,
    timeout: Option<Duration>,
}

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Self {
            expires: timeout.map(|limit| Instant::now() + limit),
            timeout,
        }
    }

    /// Time left, or `None` when the caller waits indefinitely.
    fn remaining(&self) -> Option<Duration> {
        self.expires
            .map(|expires| expires.saturating_duration_since(Instant::now()))
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout
            .map_or(0, |limit| u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
    }

    fn expired(&self, command: &str) -> QmpError {
        QmpError::Timeout {
            command: command.to_owned(),
            timeout_ms: self.timeout_ms(),
        }
    }
}

#[derive(Debug)]
struct PendingSet {
    mode: CorrelationMode,
    next_key: u64,
    entries: BTreeMap<u64, Pending>,
    /// A taken response is still being applied to the connection.
    settling: bool,
    failure: Option<ConnectionFailure>,
}

impl PendingSet {
    fn slot_free(&self) -> bool {
        self.mode == CorrelationMode::OutOfBand || (self.entries.is_empty() && !self.settling)
    }
}

/// Pending-command registry shared by callers and the reader thread.
#[derive(Debug)]
pub(crate) struct Correlator {
    state: Mutex<PendingSet>,
    vacancy: Condvar,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PendingSet {
                mode: CorrelationMode::Serial,
                next_key: 1,
                entries: BTreeMap::new(),
                settling: false,
                failure: None,
            }),
            vacancy: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingSet> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mode(&self) -> CorrelationMode {
        self.lock().mode
    }

    /// Switches matching strategy. Called by the reader once out-of-band
    /// execution has been agreed, before any later command registers.
    pub(crate) fn set_mode(&self, mode: CorrelationMode) {
        self.lock().mode = mode;
        self.vacancy.notify_all();
        debug!(target: CORRELATOR_TARGET, ?mode, "correlation mode changed");
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Reserves a pending entry for `command`, waiting for the serial slot
    /// when necessary.
    ///
    /// The lock is released before the caller writes to the transport, so a
    /// reply can never arrive for an unregistered command.
    pub(crate) fn register(
        &self,
        command: &str,
        completion: Completion,
        deadline: &Deadline,
    ) -> Result<Ticket, QmpError> {
        let mut state = self.lock();
        loop {
            if let Some(failure) = &state.failure {
                return Err(QmpError::ConnectionFailed(failure.clone()));
            }
            if state.slot_free() {
                break;
            }
            state = match deadline.remaining() {
                None => self
                    .vacancy
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(left) if left.is_zero() => return Err(deadline.expired(command)),
                Some(left) => {
                    self.vacancy
                        .wait_timeout(state, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        let key = state.next_key;
        state.next_key += 1;
        let wire_id = (state.mode == CorrelationMode::OutOfBand).then_some(key);
        let (sender, receiver) = sync_channel(1);
        state.entries.insert(
            key,
            Pending {
                key,
                command: command.to_owned(),
                completion,
                waiter: Some(sender),
            },
        );
        debug!(target: CORRELATOR_TARGET, command, key, ?wire_id, "command registered");

        Ok(Ticket {
            key,
            wire_id,
            receiver,
        })
    }

    /// Blocks until the reply for `ticket` arrives, the connection fails or
    /// the deadline expires.
    pub(crate) fn wait(
        &self,
        ticket: &Ticket,
        command: &str,
        deadline: &Deadline,
    ) -> Result<Reply, QmpError> {
        let received = match deadline.remaining() {
            None => ticket
                .receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
            Some(left) => ticket.receiver.recv_timeout(left),
        };

        match received {
            Ok(outcome) => Self::resolve(outcome),
            Err(RecvTimeoutError::Timeout) => {
                if self.abandon(ticket.key) {
                    return Err(deadline.expired(command));
                }
                // The reader took the entry after the deadline passed; its
                // outcome is already on the way.
                ticket
                    .receiver
                    .recv()
                    .map_or_else(|_| Err(self.disconnected()), Self::resolve)
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    fn disconnected(&self) -> QmpError {
        QmpError::ConnectionFailed(
            self.lock()
                .failure
                .clone()
                .unwrap_or_else(ConnectionFailure::closed),
        )
    }

    fn resolve(outcome: Outcome) -> Result<Reply, QmpError> {
        match outcome {
            Outcome::Reply(reply) => Ok(reply),
            Outcome::Failed(failure) => Err(QmpError::ConnectionFailed(failure)),
        }
    }

    /// Forgets a command whose caller gave up.
    ///
    /// Used when the transport write fails, so the entry is removed rather
    /// than left to await a reply that will never come.
    pub(crate) fn cancel(&self, ticket: &Ticket) {
        if self.lock().entries.remove(&ticket.key).is_some() {
            self.vacancy.notify_all();
        }
    }

    /// Detaches the caller from its entry. Returns `false` when the entry is
    /// already gone, meaning an outcome has been or is about to be sent.
    fn abandon(&self, key: u64) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            return false;
        };
        entry.waiter = None;
        debug!(
            target: CORRELATOR_TARGET,
            command = %entry.command,
            key,
            "caller abandoned command; awaiting late reply"
        );
        true
    }

    /// Matches a response identifier to a pending entry and removes it.
    /// Serial-mode commands go out without an identifier, so a response
    /// carrying one cannot belong to them.
    ///
    /// The serial slot stays occupied until [`Correlator::release`].
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::UnmatchedResponse`] when the identifier was never
    /// issued or no command is outstanding.
    pub(crate) fn take(&self, id: Option<&Value>) -> Result<Matched, QmpError> {
        let mut state = self.lock();
        let key = match (state.mode, id) {
            (CorrelationMode::Serial, None) => state.entries.keys().next().copied(),
            (CorrelationMode::OutOfBand, Some(id)) => {
                id.as_u64().filter(|key| state.entries.contains_key(key))
            }
            (CorrelationMode::Serial, Some(_)) | (CorrelationMode::OutOfBand, None) => None,
        };

        let entry = key.and_then(|key| state.entries.remove(&key)).ok_or_else(|| {
            QmpError::UnmatchedResponse {
                id: id.map_or_else(|| "(none)".to_owned(), Value::to_string),
            }
        })?;
        state.settling = true;
        drop(state);

        Ok(if entry.waiter.is_some() {
            Matched::Live(entry)
        } else {
            Matched::Abandoned {
                key: entry.key,
                command: entry.command,
                completion: entry.completion,
            }
        })
    }

    /// Wakes callers queued for the serial slot after a taken response has
    /// been applied.
    pub(crate) fn release(&self) {
        self.lock().settling = false;
        self.vacancy.notify_all();
    }

    /// Removes an outstanding quit so that end-of-stream can complete it.
    pub(crate) fn take_quit(&self) -> Option<Pending> {
        let mut state = self.lock();
        let key = state
            .entries
            .iter()
            .find(|(_, entry)| entry.completion == Completion::Quit)
            .map(|(key, _)| *key)?;
        state.entries.remove(&key)
    }

    /// Resolves every outstanding command with `failure` and refuses new
    /// registrations. The first failure recorded wins.
    pub(crate) fn fail_all(&self, failure: &ConnectionFailure) {
        let entries = {
            let mut state = self.lock();
            let recorded = state.failure.get_or_insert_with(|| failure.clone()).clone();
            std::mem::take(&mut state.entries)
                .into_values()
                .map(|entry| (entry, recorded.clone()))
                .collect::<Vec<_>>()
        };
        self.vacancy.notify_all();

        for (entry, reason) in entries {
            if let Some(waiter) = entry.waiter {
                drop(waiter.try_send(Outcome::Failed(reason)));
            }
        }
    }
}
