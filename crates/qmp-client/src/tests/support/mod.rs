//! Shared fixtures and helpers for connection tests.

mod fake_monitor;
mod world;

use std::time::{Duration, Instant};

use rstest::fixture;

use crate::{Connection, ConnectionOptions, StateLabel};

pub use fake_monitor::{MonitorPeer, MonitorThread, spawn_monitor};
pub use world::{ScriptedReply, SessionWorld};

/// Connection options with a generous but finite command deadline.
#[fixture]
pub fn options() -> ConnectionOptions {
    ConnectionOptions::default().with_command_timeout(Some(Duration::from_secs(5)))
}

/// Polls until the connection reaches `label` or two seconds pass.
pub fn wait_for_state(connection: &Connection, label: StateLabel) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if connection.state().label() == label {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    connection.state().label() == label
}

/// Polls until the peer has read `count` commands or two seconds pass.
pub fn wait_for_commands(monitor: &MonitorThread, count: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while monitor.received().len() < count {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}
