//! Invalid settings stop configuration loading instead of falling back to
//! defaults, whichever layer they come from.

use std::ffi::OsString;
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use ortho_config::OrthoConfig;
use qmp_config::Config;
use rstest::{fixture, rstest};
use tempfile::TempDir;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serialises environment access and restores any variables it set.
struct Sandbox {
    _guard: MutexGuard<'static, ()>,
    dir: TempDir,
    restore: Vec<(&'static str, Option<OsString>)>,
}

impl Sandbox {
    fn set_env(&mut self, key: &'static str, value: &str) {
        self.restore.push((key, std::env::var_os(key)));
        unsafe { std::env::set_var(key, value) };
    }

    fn config_file(&self, contents: &str) -> OsString {
        let path = self.dir.path().join("qmp.toml");
        fs::write(&path, contents).expect("write configuration file");
        path.into_os_string()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        while let Some((key, previous)) = self.restore.pop() {
            match previous {
                Some(value) => unsafe { std::env::set_var(key, value) },
                None => unsafe { std::env::remove_var(key) },
            }
        }
    }
}

#[fixture]
fn sandbox() -> Sandbox {
    Sandbox {
        _guard: ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner),
        dir: TempDir::new().expect("create temp dir"),
        restore: Vec::new(),
    }
}

fn load_error(args: Vec<OsString>) -> String {
    let mut argv = vec![OsString::from("qmpctl")];
    argv.extend(args);
    Config::load_from_iter(argv)
        .expect_err("loading must fail")
        .to_string()
}

#[rstest]
#[case(&["--max-message-bytes", "lots"], "lots")]
#[case(&["--event-overflow", "drop_everything"], "drop_everything")]
#[case(&["--monitor-socket", "ftp://host/monitor"], "ftp")]
#[case(&["--connect-timeout-ms", "-5"], "-5")]
fn rejects_malformed_flags(
    #[from(sandbox)] _sandbox: Sandbox,
    #[case] flags: &[&str],
    #[case] offending: &str,
) {
    let message = load_error(flags.iter().map(OsString::from).collect());

    assert!(
        message.contains(offending),
        "expected {offending:?} in {message:?}"
    );
}

#[rstest]
#[case("QMP_MONITOR_SOCKET", "gopher://monitor", "gopher")]
#[case("QMP_EVENT_OVERFLOW", "sideways", "sideways")]
fn rejects_malformed_environment(
    mut sandbox: Sandbox,
    #[case] key: &'static str,
    #[case] value: &str,
    #[case] offending: &str,
) {
    sandbox.set_env(key, value);

    let message = load_error(Vec::new());

    assert!(
        message.contains(offending),
        "expected {offending:?} in {message:?}"
    );
}

#[rstest]
fn rejects_unknown_overflow_policy_in_file(sandbox: Sandbox) {
    let path = sandbox.config_file("event_overflow = \"sideways\"\n");

    let message = load_error(vec![OsString::from("--config-path"), path]);

    assert!(message.contains("sideways"), "unexpected error {message:?}");
}

#[rstest]
fn rejects_negative_queue_capacity_in_file(sandbox: Sandbox) {
    let path = sandbox.config_file("event_queue_capacity = -1\n");

    let message = load_error(vec![OsString::from("--config-path"), path]);

    assert!(
        message.contains("event_queue_capacity") || message.contains("-1"),
        "unexpected error {message:?}"
    );
}

#[rstest]
fn valid_values_in_every_layer_still_load(mut sandbox: Sandbox) {
    let path = sandbox.config_file("event_overflow = \"drop_newest\"\n");
    sandbox.set_env("QMP_MAX_MESSAGE_BYTES", "4096");

    let config = Config::load_from_iter([
        OsString::from("qmpctl"),
        OsString::from("--config-path"),
        path,
        OsString::from("--monitor-socket"),
        OsString::from("tcp://127.0.0.1:4445"),
    ])
    .expect("configuration should load");

    assert_eq!(config.event_overflow, qmp_config::EventOverflow::DropNewest);
    assert_eq!(config.max_message_bytes, 4096);
    assert_eq!(
        config.monitor_socket(),
        &qmp_config::SocketEndpoint::tcp("127.0.0.1", 4445)
    );
}
