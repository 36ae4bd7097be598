//! Agent composition.
//!
//! Builds a running authorization agent from configuration: the
//! `codesign` oracle, the configured rule source, a log-backed notifier
//! and a config file watcher. The OS security provider binding lives
//! outside this crate and is passed in as an [`EndpointSecurityFactory`].

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::authorization::{self, AuthorizationDeps, AuthorizationHandle};
use crate::config::ConfigStore;
use crate::endpoint::EndpointSecurityFactory;
use crate::notification::LogNotifier;
use crate::rules::source::source_from_config;
use crate::signature::codesign::CodesignOracle;

/// Start the orchestrator with production collaborators.
///
/// Starts watching the store's backing file so edits are applied live.
///
/// # Errors
///
/// Fails if the `[rules]` section is incomplete or the provider cannot be
/// created or initialized.
pub fn launch(
    config: Arc<ConfigStore>,
    endpoint_factory: EndpointSecurityFactory,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<AuthorizationHandle> {
    let current = config.current();
    let rule_source = source_from_config(&current.rules).context("invalid [rules] section")?;
    if let Some(source) = &rule_source {
        info!(source = %source.describe(), "rule source configured");
    }

    if let Err(e) = config.watch_file() {
        warn!(error = %e, "config watcher unavailable, edits need a restart");
    }

    let agent_binary = match std::env::current_exe() {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(error = %e, "cannot resolve own executable");
            None
        }
    };

    authorization::start(
        AuthorizationDeps {
            config,
            endpoint_factory,
            oracle: Arc::new(CodesignOracle::default()),
            rule_source,
            notifier: Arc::new(LogNotifier),
            agent_binary,
        },
        shutdown_rx,
    )
}

/// Run the agent until SIGINT.
///
/// Loads `config_path`, installs production logging, launches the
/// orchestrator and on interrupt denies everything still pending before
/// returning.
///
/// # Errors
///
/// Fails if configuration or logging cannot be set up, or the agent
/// cannot be launched.
pub async fn run(
    config_path: &Path,
    endpoint_factory: EndpointSecurityFactory,
) -> anyhow::Result<()> {
    let config = ConfigStore::open(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let logging = config.current().logging.clone();
    let _guard = crate::logging::init_production(&logging.logs_dir, &logging.level)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = launch(config, endpoint_factory, shutdown_rx)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, denying pending requests");
    // Receiver lives in the run loop until it exits.
    let _ = shutdown_tx.send(true);
    handle.join().await.context("authorization loop panicked")?;

    info!("execgate stopped");
    Ok(())
}
