//! Runtime tests driving `qmpctl` against a fake monitor.


use std::cell::RefCell;
use std::ffi::OsString;
use std::net::TcpListener;
use std::process::ExitCode;
use std::time::Duration;

use qmp_client::{ConnectionFailure, ConnectionState, FailureKind};
use qmp_config::{Config, LogFormat, SocketEndpoint};
use rstest::{fixture, rstest};
use serde_json::{Value, json};

use self::fake_monitor::{FakeMonitor, Step, event};
use crate::config::ConfigLoader;
use crate::errors::AppError;
use crate::{IoStreams, event_stream_outcome, run_with_loader};

/// Returns a fixed configuration and records the arguments it was given.
struct StubLoader {
    config: Config,
    seen: RefCell<Vec<OsString>>,
}

impl StubLoader {
    fn for_port(port: u16) -> Self {
        Self {
            config: Config {
                monitor_socket: SocketEndpoint::tcp("127.0.0.1", port),
                command_timeout_ms: 5_000,
                log_filter: "warn".to_owned(),
                log_format: LogFormat::Compact,
                ..Config::default()
            },
            seen: RefCell::new(Vec::new()),
        }
    }

    fn with_replay(mut self, replay: usize) -> Self {
        self.config.event_replay = replay;
        self
    }
}

impl ConfigLoader for StubLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        self.seen.borrow_mut().extend(args.iter().cloned());
        Ok(self.config.clone())
    }
}

struct Run {
    exit: ExitCode,
    stdout: String,
    stderr: String,
}

fn run(loader: &StubLoader, args: &[&str]) -> Run {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit = {
        let mut io = IoStreams::new(&mut stdout, &mut stderr, false);
        run_with_loader(args.iter().map(OsString::from), &mut io, loader)
    };
    Run {
        exit,
        stdout: String::from_utf8(stdout).expect("utf8 stdout"),
        stderr: String::from_utf8(stderr).expect("utf8 stderr"),
    }
}

#[fixture]
fn running_guest() -> Value {
    json!({"running": true, "singlestep": false, "status": "running"})
}

#[rstest]
fn status_renders_for_humans(running_guest: Value) {
    let monitor = FakeMonitor::spawn(vec![Step::Reply(running_guest)]).expect("spawn monitor");
    let loader = StubLoader::for_port(monitor.port());

    let outcome = run(&loader, &["qmpctl", "--output", "human", "status"]);

    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(outcome.stdout, "VM status: running\n");
    let received = monitor.finish().expect("monitor script");
    assert_eq!(received.len(), 2);
    assert_eq!(received[1]["execute"], "query-status");
}

#[rstest]
fn configuration_flags_go_to_the_loader(running_guest: Value) {
    let monitor = FakeMonitor::spawn(vec![Step::Reply(running_guest)]).expect("spawn monitor");
    let loader = StubLoader::for_port(monitor.port());

    let outcome = run(
        &loader,
        &["qmpctl", "--log-filter", "debug", "--output", "json", "status"],
    );

    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(
        *loader.seen.borrow(),
        ["qmpctl", "--log-filter", "debug"]
            .iter()
            .map(OsString::from)
            .collect::<Vec<_>>()
    );
    let rendered: Value = serde_json::from_str(&outcome.stdout).expect("json output");
    assert_eq!(rendered["status"], "running");
    monitor.finish().expect("monitor script");
}

#[rstest]
fn stop_sends_empty_arguments_with_an_identifier() {
    let monitor = FakeMonitor::spawn(vec![Step::Reply(json!({}))]).expect("spawn monitor");
    let loader = StubLoader::for_port(monitor.port());

    let outcome = run(&loader, &["qmpctl", "--output", "json", "stop"]);

    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(outcome.stdout, "{}\n");
    let received = monitor.finish().expect("monitor script");
    assert_eq!(received[1]["execute"], "stop");
    assert_eq!(received[1]["arguments"], json!({}));
    assert!(received[1]["id"].is_u64());
}

#[rstest]
fn peer_errors_print_class_and_description() {
    let monitor = FakeMonitor::spawn(vec![Step::Reject {
        class: "GenericError",
        desc: "Guest is not suspended",
    }])
    .expect("spawn monitor");
    let loader = StubLoader::for_port(monitor.port());

    let outcome = run(&loader, &["qmpctl", "wakeup"]);

    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert_eq!(outcome.stderr, "GenericError: Guest is not suspended\n");
    assert!(outcome.stdout.is_empty());
    monitor.finish().expect("monitor script");
}

#[rstest]
fn hmp_joins_the_command_line() {
    let monitor = FakeMonitor::spawn(vec![Step::Reply(json!("* CPU #1: thread_id=7\r\n"))])
        .expect("spawn monitor");
    let loader = StubLoader::for_port(monitor.port());

    let outcome = run(
        &loader,
        &["qmpctl", "--output", "human", "hmp", "info", "cpus", "--cpu-index", "1"],
    );

    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(outcome.stdout, "* CPU #1: thread_id=7\n");
    let received = monitor.finish().expect("monitor script");
    assert_eq!(
        received[1]["arguments"],
        json!({"command-line": "info cpus", "cpu-index": 1})
    );
}

#[rstest]
fn quit_succeeds_when_the_monitor_hangs_up() {
    let monitor = FakeMonitor::spawn(vec![Step::HangUpAfterCommand]).expect("spawn monitor");
    let loader = StubLoader::for_port(monitor.port());

    let outcome = run(&loader, &["qmpctl", "--output", "json", "quit"]);

    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(outcome.stdout, "{}\n");
    let received = monitor.finish().expect("monitor script");
    assert_eq!(received[1]["execute"], "quit");
}

#[rstest]
fn events_stop_after_the_requested_count() {
    let monitor = FakeMonitor::spawn(vec![Step::Emit(vec![
        event("STOP", Value::Null),
        event("RESUME", Value::Null),
        event("RESET", json!({"guest": false})),
    ])])
    .expect("spawn monitor");
    let loader = StubLoader::for_port(monitor.port()).with_replay(8);

    let outcome = run(
        &loader,
        &["qmpctl", "--output", "human", "events", "--count", "2"],
    );

    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(
        outcome.stdout,
        "1700000000.000005 STOP\n1700000000.000005 RESUME\n"
    );
    monitor.finish().expect("monitor script");
}

#[rstest]
fn events_end_when_the_monitor_hangs_up() {
    let monitor = FakeMonitor::spawn(vec![
        Step::Emit(vec![event("SHUTDOWN", json!({"guest": true}))]),
        Step::Pause(Duration::from_millis(200)),
        Step::HangUp,
    ])
    .expect("spawn monitor");
    let loader = StubLoader::for_port(monitor.port()).with_replay(8);

    let outcome = run(&loader, &["qmpctl", "--output", "json", "events"]);

    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    let rendered: Value = serde_json::from_str(&outcome.stdout).expect("json event");
    assert_eq!(rendered["event"], "SHUTDOWN");
    assert_eq!(rendered["data"]["guest"], true);
    monitor.finish().expect("monitor script");
}

#[rstest]
#[case(FailureKind::EndOfStream, true)]
#[case(FailureKind::Transport, false)]
#[case(FailureKind::Framing, false)]
fn only_a_hangup_ends_the_event_stream_cleanly(#[case] kind: FailureKind, #[case] clean: bool) {
    let state = ConnectionState::Failed(ConnectionFailure {
        kind,
        message: "stream ended".to_owned(),
    });

    assert_eq!(event_stream_outcome(state).is_ok(), clean);
}

#[rstest]
fn events_stop_after_an_idle_timeout() {
    let monitor = FakeMonitor::spawn(Vec::new()).expect("spawn monitor");
    let loader = StubLoader::for_port(monitor.port());

    let outcome = run(&loader, &["qmpctl", "events", "--timeout-ms", "50"]);

    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert!(outcome.stdout.is_empty());
    monitor.finish().expect("monitor script");
}

#[rstest]
fn unreachable_monitor_reports_the_endpoint() {
    let port = {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        listener.local_addr().expect("local addr").port()
    };
    let loader = StubLoader::for_port(port);

    let outcome = run(&loader, &["qmpctl", "status"]);

    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(
        outcome
            .stderr
            .starts_with(&format!("failed to reach monitor at tcp://127.0.0.1:{port}")),
        "stderr: {}",
        outcome.stderr
    );
}

#[rstest]
fn missing_command_is_a_usage_error() {
    let loader = StubLoader::for_port(9);

    let outcome = run(&loader, &["qmpctl", "--output", "json"]);

    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(!outcome.stderr.is_empty());
    assert!(loader.seen.borrow().is_empty(), "configuration loaded early");
}
