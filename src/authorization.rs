//! Authorization orchestrator.
//!
//! Wires the endpoint client, the signature scheduler and the decision
//! engine together:
//!
//! 1. A parsed exec request passes the application directory check, then is
//!    verified by the scheduler on a spawned task.
//! 2. The verdict is evaluated by the decision engine and answered through
//!    the client exactly once.
//! 3. File changes invalidate overlapping pending requests and cached
//!    verdicts.
//! 4. A periodic sweep expires stale requests; a second timer refreshes the
//!    rule database.
//!
//! The run loop owns no component state itself. Each component guards its
//! own state and no component lock is held while calling another.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, ConfigStore};
use crate::decision::path_policy::ApplicationDirectoryPolicy;
use crate::decision::{DecisionEngine, DecisionPolicy};
use crate::endpoint::client::{ClientError, ClientSettings, EndpointSecurityClient};
use crate::endpoint::{ClientEvent, EndpointSecurityFactory};
use crate::notification::Notifier;
use crate::rules::source::RuleSource;
use crate::rules::{RuleDatabaseStatus, RulesError};
use crate::signature::scheduler::SignatureScheduler;
use crate::signature::SignatureOracle;
use crate::types::{
    AuthorizationRequest, ExecInvalidation, FileChangeNotification, InvalidationReason, Verdict,
};

/// Signature checks canceled by invalidation are retried this many times
/// while the request is still pending.
const MAX_CHECK_ATTEMPTS: u32 = 3;

/// Collaborators needed to start the orchestrator.
pub struct AuthorizationDeps {
    /// Configuration provider.
    pub config: Arc<ConfigStore>,
    /// Creates the OS security provider.
    pub endpoint_factory: EndpointSecurityFactory,
    /// Static code-signature check.
    pub oracle: Arc<dyn SignatureOracle>,
    /// Rule database source; `None` disables rules.
    pub rule_source: Option<Arc<dyn RuleSource>>,
    /// User-facing notification sink.
    pub notifier: Arc<dyn Notifier>,
    /// The agent's own executable.
    pub agent_binary: Option<PathBuf>,
}

/// Handle to a running orchestrator.
pub struct AuthorizationHandle {
    join: JoinHandle<()>,
    orchestrator: Arc<Orchestrator>,
}

impl AuthorizationHandle {
    /// Number of exec requests awaiting a decision.
    pub fn pending_requests(&self) -> usize {
        self.orchestrator.client.pending_count()
    }

    /// The decision engine in use.
    pub fn engine(&self) -> Arc<DecisionEngine> {
        Arc::clone(&self.orchestrator.engine)
    }

    /// The signature scheduler in use.
    pub fn scheduler(&self) -> Arc<SignatureScheduler> {
        Arc::clone(&self.orchestrator.scheduler)
    }

    /// Fetch and install rules now, bypassing the refresh timer.
    ///
    /// # Errors
    ///
    /// Returns [`RulesError`] if no source is configured, the fetch fails,
    /// or the database is invalid.
    pub async fn refresh_rules(&self) -> Result<RuleDatabaseStatus, RulesError> {
        let source = self
            .orchestrator
            .rule_source
            .as_ref()
            .ok_or(RulesError::MissingSetting("rules.source"))?;
        let database = source.fetch().await?;
        self.orchestrator.engine.install_rules(database)
    }

    /// Wait for the run loop to finish after shutdown.
    ///
    /// # Errors
    ///
    /// Returns the join error if the loop panicked.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.join.await
    }
}

/// Start the orchestrator.
///
/// Creates the provider client (clear cache, subscribe), builds the
/// scheduler and engine from the current configuration, kicks off the
/// first rule refresh and spawns the run loop. The loop stops when
/// `shutdown_rx` flips to `true` or its sender is dropped.
///
/// # Errors
///
/// Fails if the provider cannot be created or initialized.
pub fn start(
    deps: AuthorizationDeps,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<AuthorizationHandle> {
    let config = deps.config.current();

    let api = (deps.endpoint_factory)().context("failed to create the endpoint security provider")?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let client = EndpointSecurityClient::create(
        api,
        client_settings(&config, deps.agent_binary.clone()),
        events_tx,
    )
    .context("failed to initialize the endpoint security client")?;

    let scheduler = SignatureScheduler::new(deps.oracle, config.scheduler_settings());
    let engine = Arc::new(DecisionEngine::new(DecisionPolicy::from_config(
        &config.policy,
    )));

    let orchestrator = Arc::new(Orchestrator {
        client,
        scheduler,
        engine,
        path_policy: RwLock::new(ApplicationDirectoryPolicy::from_config(&config.policy)),
        notifier: deps.notifier,
        rule_source: deps.rule_source,
        refreshing: AtomicBool::new(false),
        agent_binary: deps.agent_binary,
    });

    orchestrator.spawn_rule_refresh();

    let config_rx = deps.config.subscribe();
    let join = tokio::spawn(run(
        Arc::clone(&orchestrator),
        events_rx,
        config_rx,
        shutdown_rx,
        config,
    ));

    info!(mode = ?orchestrator.engine.policy().mode, "authorization started");
    Ok(AuthorizationHandle { join, orchestrator })
}

fn client_settings(config: &AgentConfig, agent_binary: Option<PathBuf>) -> ClientSettings {
    ClientSettings {
        platform_binary_source: config.policy.platform_binary_source,
        agent_binary,
    }
}

async fn run(
    orchestrator: Arc<Orchestrator>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    mut config_rx: watch::Receiver<Arc<AgentConfig>>,
    mut shutdown_rx: watch::Receiver<bool>,
    config: Arc<AgentConfig>,
) {
    let mut max_age = config.endpoint.max_request_age();

    let mut sweep = tokio::time::interval(config.endpoint.sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut refresh = tokio::time::interval(config.rules.refresh_interval());
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the first immediate ticks; the initial refresh already ran.
    sweep.tick().await;
    refresh.tick().await;

    let has_rules = orchestrator.rule_source.is_some();
    let mut config_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::ExecRequest(request)) => orchestrator.authorize(request),
                Some(ClientEvent::FileChanged(notification)) => {
                    orchestrator.on_file_change(&notification);
                }
                None => {
                    warn!("endpoint event channel closed");
                    break;
                }
            },
            _ = sweep.tick() => orchestrator.expire_stale(max_age),
            _ = refresh.tick(), if has_rules => orchestrator.spawn_rule_refresh(),
            changed = config_rx.changed(), if config_open => {
                if changed.is_err() {
                    config_open = false;
                } else {
                    let config = Arc::clone(&config_rx.borrow_and_update());
                    max_age = config.endpoint.max_request_age();
                    orchestrator.apply_config(&config);
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("authorization shutting down");
                    break;
                }
            }
        }
    }

    orchestrator.client.shutdown();
    info!("authorization stopped");
}

struct Orchestrator {
    client: Arc<EndpointSecurityClient>,
    scheduler: Arc<SignatureScheduler>,
    engine: Arc<DecisionEngine>,
    path_policy: RwLock<ApplicationDirectoryPolicy>,
    notifier: Arc<dyn Notifier>,
    rule_source: Option<Arc<dyn RuleSource>>,
    refreshing: AtomicBool,
    agent_binary: Option<PathBuf>,
}

impl Orchestrator {
    fn authorize(self: &Arc<Self>, request: AuthorizationRequest) {
        let check = self
            .path_policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check(&request.binary_path);
        if check.misplaced {
            error!(
                path = %request.binary_path.display(),
                "application is not being started from an allowed directory"
            );
        }
        if !check.allowed {
            self.respond(&request, false, false);
            let message = format!("Blocked: {} (invalid path)", request.binary_path.display());
            info!(request_id = request.id.0, "{message}");
            self.notifier.show_notification(&message);
            return;
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.verify_and_decide(request).await;
        });
    }

    async fn verify_and_decide(&self, request: AuthorizationRequest) {
        let path = request.binary_path.display().to_string();
        let mut attempts = 0u32;
        let verdict = loop {
            match self
                .scheduler
                .check_signature_for(&request.binary_path, &request.code_directory_hash)
                .await
            {
                Some(verdict) => break verdict,
                None => {
                    attempts = attempts.saturating_add(1);
                    if attempts >= MAX_CHECK_ATTEMPTS || !self.client.is_pending(request.id) {
                        debug!(request_id = request.id.0, %path, "signature check canceled");
                        return;
                    }
                    debug!(request_id = request.id.0, %path, "signature check canceled, retrying");
                }
            }
        };

        match verdict {
            Verdict::Failed => error!(%path, "failed to validate the code signature"),
            Verdict::Invalid => info!(%path, "invalid code signature"),
            Verdict::NotSigned => info!(%path, "application is not signed"),
            Verdict::Valid => {}
        }

        let decision = self.engine.evaluate(&request, verdict);
        if decision.monitored {
            warn!(%path, reason = %decision.reason, "monitor mode: would have blocked");
        }

        if !self.respond(&request, decision.allow, decision.cacheable) {
            return;
        }

        if decision.allow {
            info!(request_id = request.id.0, cached = decision.cacheable, "Allowed: '{path}'");
        } else {
            info!(request_id = request.id.0, reason = %decision.reason, "Blocked: '{path}'");
            self.notifier.show_notification(&format!("Blocked: {path}"));
        }
    }

    /// Answer a request; `false` if it was already closed or the provider failed.
    fn respond(&self, request: &AuthorizationRequest, allow: bool, cache: bool) -> bool {
        match self.client.set_authorization(request.id, allow, cache) {
            Ok(()) => true,
            Err(ClientError::UnknownRequest(id)) => {
                debug!(request_id = id.0, "request closed before its decision");
                false
            }
            Err(e) => {
                error!(request_id = request.id.0, error = %e, "failed to answer exec request");
                false
            }
        }
    }

    fn on_file_change(&self, notification: &FileChangeNotification) {
        let invalidations = self.client.invalidate_on_file_change(notification);
        if notification.is_broad() {
            self.scheduler.invalidate_cache();
        } else {
            for path in &notification.paths {
                self.scheduler.invalidate_cache_for(path);
            }
        }
        for invalidation in &invalidations {
            self.report_invalidation(invalidation);
        }
    }

    fn expire_stale(&self, max_age: Duration) {
        for invalidation in self.client.expire_stale_requests(Instant::now(), max_age) {
            self.report_invalidation(&invalidation);
        }
    }

    fn report_invalidation(&self, invalidation: &ExecInvalidation) {
        let path = invalidation.binary_path.display();
        let message = match invalidation.reason {
            InvalidationReason::ApplicationChanged => {
                warn!(
                    request_id = invalidation.id.0,
                    "'{path}' has been denied execution because the application has been changed on disk"
                );
                format!("Denied '{path}' (application changed)")
            }
            InvalidationReason::Expired => {
                warn!(
                    request_id = invalidation.id.0,
                    "the authorization request for '{path}' has taken too long and has expired"
                );
                format!("Authorization request expired: '{path}'")
            }
        };
        self.notifier.show_notification(&message);
    }

    fn apply_config(&self, config: &AgentConfig) {
        self.engine
            .set_policy(DecisionPolicy::from_config(&config.policy));
        *self
            .path_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) =
            ApplicationDirectoryPolicy::from_config(&config.policy);
        self.client
            .update_settings(client_settings(config, self.agent_binary.clone()));

        if let Err(e) = self.client.invalidate_kernel_cache() {
            error!(error = %e, "failed to clear kernel cache after configuration change");
        }
        self.scheduler.invalidate_cache();
        info!(mode = ?config.policy.mode, "configuration applied");
    }

    fn spawn_rule_refresh(self: &Arc<Self>) {
        let Some(source) = self.rule_source.clone() else {
            return;
        };
        if self.refreshing.swap(true, Ordering::AcqRel) {
            debug!("rule refresh already running");
            return;
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            match source.fetch().await {
                Ok(database) => {
                    if let Err(e) = orchestrator.engine.install_rules(database) {
                        warn!(source = %source.describe(), error = %e, "rule refresh rejected");
                    }
                }
                Err(e) => warn!(source = %source.describe(), error = %e, "rule refresh failed"),
            }
            orchestrator.refreshing.store(false, Ordering::Release);
        });
    }
}
