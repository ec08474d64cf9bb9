//! Scripted monitor peer connected to the client over a Unix socket pair.
//!
//! Each test supplies a closure that plays the server side of the
//! conversation on its own thread. Every command the peer reads is recorded
//! so that assertions can inspect exactly what went over the wire.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use serde_json::{Value, json};

use crate::MonitorStream;

const PEER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of a scripted conversation.
pub struct MonitorPeer {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MonitorPeer {
    fn new(stream: UnixStream, received: Arc<Mutex<Vec<Value>>>) -> Result<Self> {
        stream
            .set_read_timeout(Some(PEER_READ_TIMEOUT))
            .context("set peer read timeout")?;
        let writer = stream.try_clone().context("clone peer stream")?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            received,
        })
    }

    /// Writes one raw line.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Writes one JSON message.
    pub fn send(&mut self, message: &Value) -> Result<()> {
        self.send_line(&message.to_string())
    }

    /// Sends a greeting offering `capabilities`.
    pub fn greet(&mut self, capabilities: &[&str]) -> Result<()> {
        self.send(&json!({
            "QMP": {
                "version": {
                    "qemu": {"major": 8, "minor": 2, "micro": 0},
                    "package": "v8.2.0"
                },
                "capabilities": capabilities
            }
        }))
    }

    /// Greets and accepts capability negotiation.
    pub fn greet_and_negotiate(&mut self, capabilities: &[&str]) -> Result<()> {
        self.greet(capabilities)?;
        let negotiation = self.read_command()?;
        ensure!(
            negotiation["execute"] == "qmp_capabilities",
            "expected negotiation, got {negotiation}"
        );
        self.reply(&negotiation, json!({}))
    }

    /// Reads and records the next command.
    pub fn read_command(&mut self) -> Result<Value> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).context("read command")?;
        ensure!(read > 0, "client closed the stream while a command was expected");
        let command: Value = serde_json::from_str(&line).context("parse command")?;
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        Ok(command)
    }

    /// Answers `command` with a success payload, echoing its id.
    pub fn reply(&mut self, command: &Value, payload: Value) -> Result<()> {
        let mut response = json!({ "return": payload });
        if let Some(id) = command.get("id") {
            response["id"] = id.clone();
        }
        self.send(&response)
    }

    /// Answers `command` with an error object, echoing its id.
    pub fn reject(&mut self, command: &Value, class: &str, desc: &str) -> Result<()> {
        let mut response = json!({ "error": { "class": class, "desc": desc } });
        if let Some(id) = command.get("id") {
            response["id"] = id.clone();
        }
        self.send(&response)
    }

    /// Emits an event.
    pub fn event(&mut self, name: &str, data: Value) -> Result<()> {
        self.send(&json!({
            "event": name,
            "data": data,
            "timestamp": {"seconds": 1_700_000_000, "microseconds": 0}
        }))
    }

    /// Fails if the client writes anything within `window`.
    pub fn expect_silence(&mut self, window: Duration) -> Result<()> {
        if !self.reader.buffer().is_empty() {
            bail!("client wrote while the peer expected silence");
        }
        self.reader.get_ref().set_read_timeout(Some(window))?;
        let outcome = match self.reader.fill_buf() {
            Ok([]) => Ok(()),
            Ok(bytes) => Err(anyhow!(
                "client wrote while the peer expected silence: {}",
                String::from_utf8_lossy(bytes)
            )),
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(())
            }
            Err(error) => Err(error.into()),
        };
        self.reader
            .get_ref()
            .set_read_timeout(Some(PEER_READ_TIMEOUT))?;
        outcome
    }

    /// Reads until the client closes its end, recording any commands.
    pub fn wait_for_hangup(&mut self) -> Result<()> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    if let Ok(command) = serde_json::from_str::<Value>(&line) {
                        self.received
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(command);
                    }
                }
                Err(error) if error.kind() == ErrorKind::ConnectionReset => return Ok(()),
                Err(error) => return Err(error).context("wait for client hangup"),
            }
        }
    }
}

/// Handle to a running scripted peer.
pub struct MonitorThread {
    handle: JoinHandle<Result<()>>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MonitorThread {
    /// Commands the peer has read so far.
    pub fn received(&self) -> Vec<Value> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits for the script to finish and surfaces its outcome.
    pub fn join(self) -> Result<Vec<Value>> {
        self.handle
            .join()
            .map_err(|_| anyhow!("monitor script panicked"))??;
        Ok(self
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Starts `script` on its own thread and returns the client end.
pub fn spawn_monitor<F>(script: F) -> (MonitorStream, MonitorThread)
where
    F: FnOnce(&mut MonitorPeer) -> Result<()> + Send + 'static,
{
    let (client, server) = UnixStream::pair().expect("create socket pair");
    let received = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&received);
    let handle = thread::spawn(move || {
        let mut peer = MonitorPeer::new(server, recorder)?;
        script(&mut peer)
    });
    (
        MonitorStream::Unix(client),
        MonitorThread { handle, received },
    )
}
