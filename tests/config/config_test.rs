//! Config loading and store reload tests.

use std::path::PathBuf;

use execgate::config::{AgentConfig, ConfigError, ConfigStore, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use execgate::decision::ClientMode;

#[test]
fn config_path_defaults_without_env() {
    let path = AgentConfig::config_path_with(|_| None);
    assert_eq!(path, PathBuf::from(DEFAULT_CONFIG_PATH));
}

#[test]
fn config_path_honours_env() {
    let path = AgentConfig::config_path_with(|key| {
        (key == CONFIG_PATH_ENV).then(|| "/tmp/custom.toml".to_owned())
    });
    assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
}

#[test]
fn missing_file_loads_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config =
        AgentConfig::load_from(&tmp.path().join("absent.toml"), |_| None).expect("should load");
    assert_eq!(config, AgentConfig::default());
}

#[test]
fn env_beats_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[policy]\nmode = \"monitor\"\n").expect("write config");

    let config = AgentConfig::load_from(&path, |key| {
        (key == "EXECGATE_MODE").then(|| "lockdown".to_owned())
    })
    .expect("should load");
    assert_eq!(config.policy.mode, ClientMode::Lockdown);
}

#[test]
fn unreadable_path_is_a_read_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    // A directory cannot be read as a file.
    let result = AgentConfig::load_from(tmp.path(), |_| None);
    assert!(matches!(result, Err(ConfigError::Read { .. })));
}

#[test]
fn publish_notifies_only_on_change() {
    let store = ConfigStore::fixed(AgentConfig::default());
    let mut rx = store.subscribe();

    assert!(!store.publish(AgentConfig::default()));
    assert!(!rx.has_changed().expect("sender alive"));

    let mut monitor = AgentConfig::default();
    monitor.policy.mode = ClientMode::Monitor;
    assert!(store.publish(monitor));
    assert!(rx.has_changed().expect("sender alive"));
    assert_eq!(rx.borrow_and_update().policy.mode, ClientMode::Monitor);
    assert_eq!(store.current().policy.mode, ClientMode::Monitor);
}

#[test]
fn fixed_store_reload_is_a_no_op() {
    let store = ConfigStore::fixed(AgentConfig::default());
    assert!(store.path().is_none());
    assert!(!store.reload().expect("reload without a file"));
}

#[test]
fn reload_picks_up_file_edits() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[policy]\nallow_unknown_programs = false\n").expect("write config");

    let store = ConfigStore::open(&path).expect("should open");
    assert_eq!(store.current().policy.allow_unknown_programs, Some(false));
    let mut rx = store.subscribe();

    std::fs::write(&path, "[policy]\nallow_unknown_programs = true\n").expect("rewrite config");
    assert!(store.reload().expect("should reload"));
    assert!(rx.has_changed().expect("sender alive"));
    assert_eq!(store.current().policy.allow_unknown_programs, Some(true));

    // Unchanged contents publish nothing.
    rx.borrow_and_update();
    assert!(!store.reload().expect("should reload"));
    assert!(!rx.has_changed().expect("sender alive"));
}

#[test]
fn broken_edit_keeps_previous_config() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[endpoint]\nmax_request_age_secs = 7\n").expect("write config");

    let store = ConfigStore::open(&path).expect("should open");
    std::fs::write(&path, "[endpoint\nmax_request_age_secs = ").expect("rewrite config");

    assert!(matches!(store.reload(), Err(ConfigError::Parse(_))));
    assert_eq!(store.current().endpoint.max_request_age_secs, 7);
}

#[test]
fn watching_a_fixed_store_is_a_no_op() {
    let store = ConfigStore::fixed(AgentConfig::default());
    store.watch_file().expect("nothing to watch");
}

#[tokio::test]
async fn watched_file_edits_are_published() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[policy]\nmode = \"lockdown\"\n").expect("write config");

    let store = ConfigStore::open(&path).expect("should open");
    let mut rx = store.subscribe();
    store.watch_file().expect("watcher should start");
    std::fs::write(&path, "[policy]\nmode = \"monitor\"\n").expect("rewrite config");

    let published = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while rx.borrow_and_update().policy.mode != ClientMode::Monitor {
            rx.changed().await.expect("store alive");
        }
    })
    .await;
    assert!(published.is_ok(), "config change was not published by the watcher");
    assert_eq!(store.current().policy.mode, ClientMode::Monitor);
}

#[test]
fn edits_to_sibling_files_are_ignored() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[policy]\nmode = \"lockdown\"\n").expect("write config");

    let store = ConfigStore::open(&path).expect("should open");
    let rx = store.subscribe();
    store.watch_file().expect("watcher should start");
    std::fs::write(tmp.path().join("other.toml"), "[policy]\nmode = \"monitor\"\n")
        .expect("write sibling");

    std::thread::sleep(std::time::Duration::from_millis(300));
    assert!(!rx.has_changed().expect("store alive"));
    assert_eq!(store.current().policy.mode, ClientMode::Lockdown);
}

#[test]
fn zero_request_age_is_flagged() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[endpoint]\nmax_request_age_secs = 0\n").expect("write config");

    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let config = tracing::subscriber::with_default(subscriber, || {
        AgentConfig::load_from(&path, |_| None).expect("should load")
    });

    assert!(config.endpoint.expires_immediately());
    assert!(!AgentConfig::default().endpoint.expires_immediately());
    let output = logs.contents();
    assert!(output.contains("WARN"), "expected a warning, got: {output}");
    assert!(output.contains("denied on the first sweep"));
}

/// Log sink shared between the subscriber and the assertions.
#[derive(Clone, Default)]
struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("test lock")).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("test lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
