//! Configuration loading and hot reload.
//!
//! Loads agent configuration from `/etc/execgate/config.toml` (or
//! `$EXECGATE_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults. A missing file yields the defaults, which
//! are the most restrictive settings.
//!
//! Precedence: env vars > config file > defaults.
//!
//! [`ConfigStore`] publishes the current configuration through a
//! `tokio::sync::watch` channel and can watch the file for edits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::decision::ClientMode;
use crate::signature::scheduler::{online_cores, SchedulerSettings, DEFAULT_SIZE_CEILING};
use crate::types::PlatformBinarySource;

/// Env var naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "EXECGATE_CONFIG_PATH";

/// Configuration file used when `$EXECGATE_CONFIG_PATH` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/execgate/config.toml";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File that failed.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    /// The file watcher could not be started.
    #[error("failed to watch config file: {0}")]
    Watch(#[from] notify::Error),
}

// ── Top-level config ────────────────────────────────────────────

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Decision policy (`[policy]`).
    pub policy: PolicyConfig,
    /// Event adapter timing (`[endpoint]`).
    pub endpoint: EndpointConfig,
    /// Signature scheduler pools (`[signature]`).
    pub signature: SignatureConfig,
    /// Rule source (`[rules]`).
    pub rules: RulesConfig,
    /// Log output (`[logging]`).
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let path = Self::config_path_with(env);
        Self::load_from(&path, env)
    }

    /// Load a specific file and apply overrides from `env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load_from(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => {
                info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        config.apply_overrides(env);
        if config.endpoint.expires_immediately() {
            warn!(
                max_request_age_secs = 0,
                "every pending authorization request will be denied on the first sweep"
            );
        }
        Ok(config)
    }

    /// Resolve the config file path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV).map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
    }

    /// Parse a TOML string without env overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("EXECGATE_MODE") {
            match v.to_ascii_lowercase().as_str() {
                "lockdown" => self.policy.mode = ClientMode::Lockdown,
                "monitor" => self.policy.mode = ClientMode::Monitor,
                _ => warn!(var = "EXECGATE_MODE", value = %v, "ignoring invalid env override"),
            }
        }

        if let Some(v) = env("EXECGATE_MAX_REQUEST_AGE_SECS") {
            match v.parse() {
                Ok(n) => self.endpoint.max_request_age_secs = n,
                Err(_) => warn!(
                    var = "EXECGATE_MAX_REQUEST_AGE_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        // Rules.
        if let Some(v) = env("EXECGATE_RULES_SERVER_URL") {
            self.rules.server_url = Some(v);
        }
        if let Some(v) = env("EXECGATE_MACHINE_ID") {
            self.rules.machine_id = Some(v);
        }
        if let Some(v) = env("EXECGATE_RULE_DATABASE") {
            self.rules.database_path = Some(PathBuf::from(v));
        }

        if let Some(v) = env("EXECGATE_LOGS_DIR") {
            self.logging.logs_dir = PathBuf::from(v);
        }
    }

    /// Scheduler pool sizing derived from `[signature]`.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            size_ceiling: self.signature.size_ceiling_bytes,
            primary_workers: self
                .signature
                .primary_workers
                .unwrap_or_else(online_cores)
                .max(1),
            secondary_workers: self.signature.secondary_workers.max(1),
        }
    }
}

// ── Policy config ───────────────────────────────────────────────

/// Decision policy flags (`[policy]`).
///
/// The three `allow_*_programs` keys are optional so a missing key can be
/// logged before falling back to `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Allow valid binaries that match no rule.
    pub allow_unknown_programs: Option<bool>,
    /// Allow binaries without a code signature.
    pub allow_unsigned_programs: Option<bool>,
    /// Allow binaries with a broken or uncheckable signature.
    pub allow_invalid_programs: Option<bool>,
    /// `lockdown` or `monitor`.
    pub mode: ClientMode,
    /// Directories applications must live in; empty disables the check.
    pub allowed_application_directories: Vec<String>,
    /// Allow binaries outside the allowed directories.
    pub allow_misplaced_applications: bool,
    /// How platform binaries are recognised.
    pub platform_binary_source: PlatformBinarySource,
}

// ── Endpoint config ─────────────────────────────────────────────

/// Pending request timing (`[endpoint]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Requests older than this are denied by the sweep.
    pub max_request_age_secs: u64,
    /// Period of the expiration sweep.
    pub expiration_sweep_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_request_age_secs: 10,
            expiration_sweep_secs: 1,
        }
    }
}

impl EndpointConfig {
    /// Maximum request age.
    pub fn max_request_age(&self) -> Duration {
        Duration::from_secs(self.max_request_age_secs)
    }

    /// Whether a zero max age makes the sweep deny every pending request.
    pub fn expires_immediately(&self) -> bool {
        self.max_request_age_secs == 0
    }

    /// Sweep period, never zero.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiration_sweep_secs.max(1))
    }
}

// ── Signature config ────────────────────────────────────────────

/// Signature scheduler pools (`[signature]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Files at or above this size use the secondary pool.
    pub size_ceiling_bytes: u64,
    /// Primary pool size; defaults to the online core count.
    pub primary_workers: Option<usize>,
    /// Secondary pool size.
    pub secondary_workers: usize,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            size_ceiling_bytes: DEFAULT_SIZE_CEILING,
            primary_workers: None,
            secondary_workers: 1,
        }
    }
}

// ── Rules config ────────────────────────────────────────────────

/// Where rules are loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSourceKind {
    /// No rules; decisions use policy flags only.
    #[default]
    None,
    /// A JSON file on disk.
    Local,
    /// A sync server.
    Remote,
}

/// Rule source settings (`[rules]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Source kind.
    pub source: RuleSourceKind,
    /// JSON file for the `local` source.
    pub database_path: Option<PathBuf>,
    /// Sync server base URL for the `remote` source.
    pub server_url: Option<String>,
    /// Machine identifier sent to the sync server.
    pub machine_id: Option<String>,
    /// Seconds between refreshes.
    pub refresh_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            source: RuleSourceKind::None,
            database_path: None,
            server_url: None,
            machine_id: None,
            refresh_interval_secs: 60,
        }
    }
}

impl RulesConfig {
    /// Refresh period, never zero.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

// ── Logging config ──────────────────────────────────────────────

/// Log output (`[logging]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs.
    pub logs_dir: PathBuf,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("/var/log/execgate"),
            level: "info".to_owned(),
        }
    }
}

// ── Config store ────────────────────────────────────────────────

/// Current configuration plus change notification.
pub struct ConfigStore {
    path: Option<PathBuf>,
    tx: watch::Sender<Arc<AgentConfig>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .field("current", &*self.tx.borrow())
            .finish()
    }
}

impl ConfigStore {
    /// Store holding a fixed configuration with no backing file.
    pub fn fixed(config: AgentConfig) -> Arc<Self> {
        Self::with_path(None, config)
    }

    /// Load `path` (with process env overrides) and keep it as the backing file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the initial load fails.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, ConfigError> {
        let path = path.into();
        let config = AgentConfig::load_from(&path, |key| std::env::var(key).ok())?;
        Ok(Self::with_path(Some(path), config))
    }

    fn with_path(path: Option<PathBuf>, config: AgentConfig) -> Arc<Self> {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Arc::new(Self {
            path,
            tx,
            watcher: Mutex::new(None),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current configuration.
    pub fn current(&self) -> Arc<AgentConfig> {
        Arc::clone(&self.tx.borrow())
    }

    /// Receiver notified on every published change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AgentConfig>> {
        self.tx.subscribe()
    }

    /// Publish a configuration; returns whether it differed from the current one.
    pub fn publish(&self, config: AgentConfig) -> bool {
        let config = Arc::new(config);
        self.tx.send_if_modified(|current| {
            if **current == *config {
                return false;
            }
            *current = config;
            true
        })
    }

    /// Re-read the backing file and publish it if it changed.
    ///
    /// A file that fails to load leaves the current configuration in place.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        let config = AgentConfig::load_from(path, |key| std::env::var(key).ok())?;
        let changed = self.publish(config);
        if changed {
            info!(path = %path.display(), "configuration reloaded");
        }
        Ok(changed)
    }

    /// Reload whenever the backing file is modified.
    ///
    /// Watches the containing directory so editors that replace the file
    /// are seen. The watcher lives as long as the store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Watch`] if the watcher cannot be started.
    pub fn watch_file(self: &Arc<Self>) -> Result<(), ConfigError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(ToOwned::to_owned);

        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                if let Ok(evt) = event {
                    if evt.kind.is_modify() || evt.kind.is_create() {
                        for changed in evt.paths {
                            if let Err(e) = tx.send(changed) {
                                warn!(error = %e, "failed to send config watcher event");
                            }
                        }
                    }
                }
            })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);

        let store: Weak<Self> = Arc::downgrade(self);
        std::thread::spawn(move || {
            while let Ok(changed) = rx.recv() {
                if changed.file_name() != file_name.as_deref() {
                    continue;
                }
                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(e) = store.reload() {
                    warn!(error = %e, "config reload failed, keeping previous configuration");
                }
            }
        });

        info!(path = %path.display(), "watching config file");
        Ok(())
    }
}
