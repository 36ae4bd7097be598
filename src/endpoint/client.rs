//! Endpoint-security client.
//!
//! Owns the provider connection and the pending request registry. Provider
//! callbacks run on arbitrary threads; each one does a short registry update
//! under the registry lock and forwards a [`ClientEvent`] to the
//! orchestrator. Kernel responses are always issued after the lock is
//! released.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::handle::KernelHandle;
use super::parser;
use super::registry::{PendingEntry, PendingRequestRegistry};
use super::{
    ClientEvent, EndpointError, EndpointSecurityApi, RawEvent, RawMessage, RawProcess,
    SUBSCRIBED_EVENTS,
};
use crate::types::{
    ExecInvalidation, FileChangeNotification, InvalidationReason, PlatformBinarySource, RequestId,
};

/// Parser settings that may change with configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSettings {
    /// How platform binaries are recognised.
    pub platform_binary_source: PlatformBinarySource,
    /// The agent's own executable, always classified as [`crate::types::BinaryType::Agent`].
    pub agent_binary: Option<PathBuf>,
}

/// Errors returned by [`EndpointSecurityClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request was already answered, expired or invalidated.
    #[error("unknown or already answered request: {0}")]
    UnknownRequest(RequestId),
    /// The provider rejected the operation.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Adapter between the OS security provider and the orchestrator.
pub struct EndpointSecurityClient {
    api: Arc<dyn EndpointSecurityApi>,
    registry: Mutex<PendingRequestRegistry>,
    settings: RwLock<ClientSettings>,
    next_id: AtomicI64,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl EndpointSecurityClient {
    /// Connect to the provider, clear its cache and subscribe to all events.
    ///
    /// # Errors
    ///
    /// Any provider failure here is fatal: the client is torn down and the
    /// error returned.
    pub fn create(
        api: Arc<dyn EndpointSecurityApi>,
        settings: ClientSettings,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<Arc<Self>, EndpointError> {
        let client = Arc::new(Self {
            api: Arc::clone(&api),
            registry: Mutex::new(PendingRequestRegistry::new()),
            settings: RwLock::new(settings),
            next_id: AtomicI64::new(1),
            events,
        });

        let weak = Arc::downgrade(&client);
        api.new_client(Box::new(move |message| match weak.upgrade() {
            Some(client) => client.handle_message(message),
            None => warn!(token = message.token.0, "message delivered after client shutdown"),
        }))?;

        if let Err(e) = api.clear_cache().and_then(|()| api.subscribe(&SUBSCRIBED_EVENTS)) {
            api.delete_client();
            return Err(e);
        }

        info!(
            events = SUBSCRIBED_EVENTS.len(),
            "endpoint security client started"
        );
        Ok(client)
    }

    /// Entry point for every provider message.
    pub fn handle_message(&self, message: RawMessage) {
        match &message.event {
            RawEvent::AuthExec(process) => self.on_exec_event(&message, process),
            other => self.on_file_change_event(other),
        }
    }

    fn on_exec_event(&self, message: &RawMessage, process: &RawProcess) {
        let token = match self.api.copy_message(message) {
            Ok(token) => token,
            Err(e) => {
                error!(
                    path = %process.executable.path,
                    error = %e,
                    "failed to retain exec message, denying"
                );
                if let Err(e) = self.api.respond_auth_result(message.token, false, false) {
                    error!(error = %e, "failed to deny unretained exec message");
                }
                return;
            }
        };
        let handle = KernelHandle::new(Arc::clone(&self.api), token);

        let settings = self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let request = match parser::parse_exec(process, &settings, Utc::now(), || {
            self.allocate_id()
        }) {
            Ok(request) => request,
            Err(e) => {
                warn!(path = %process.executable.path, error = %e, "unparsable exec event, denying");
                deny(handle);
                return;
            }
        };

        let id = request.id;
        debug!(request_id = id.0, path = %request.binary_path.display(), "exec request received");
        let entry = PendingEntry {
            request: request.clone(),
            handle,
            received_at: Instant::now(),
        };
        let inserted = self.lock_registry().insert(entry);
        if let Err(rejected) = inserted {
            error!(request_id = id.0, "duplicate request identifier, denying");
            deny(rejected.handle);
            return;
        }

        if self.events.send(ClientEvent::ExecRequest(request)).is_err() {
            warn!(request_id = id.0, "orchestrator gone, denying exec request");
            let taken = self.lock_registry().take(id);
            if let Some(entry) = taken {
                deny(entry.handle);
            }
        }
    }

    fn on_file_change_event(&self, event: &RawEvent) {
        let Some(notification) = parser::parse_file_change(event) else {
            return;
        };
        if self
            .events
            .send(ClientEvent::FileChanged(notification))
            .is_err()
        {
            debug!("orchestrator gone, dropping file change notification");
        }
    }

    fn allocate_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lock_registry(&self) -> MutexGuard<'_, PendingRequestRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer a pending request exactly once.
    ///
    /// When `cache` is set the binary path is recorded in the kernel-cached
    /// set so a later change to it flushes the kernel cache.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownRequest`] if the request was already
    /// answered, expired or invalidated, and [`ClientError::Endpoint`] if the
    /// provider rejects the response.
    pub fn set_authorization(
        &self,
        id: RequestId,
        allow: bool,
        cache: bool,
    ) -> Result<(), ClientError> {
        let entry = {
            let mut registry = self.lock_registry();
            let entry = registry.take(id);
            if let Some(entry) = entry.as_ref().filter(|_| cache) {
                registry.record_cached(entry.request.binary_path.clone());
            }
            entry
        };
        let Some(entry) = entry else {
            warn!(request_id = id.0, "authorization for unknown request ignored");
            return Err(ClientError::UnknownRequest(id));
        };
        entry.handle.respond(allow, cache)?;
        Ok(())
    }

    /// Deny and release every request received at least `max_age` before `now`.
    pub fn expire_stale_requests(&self, now: Instant, max_age: Duration) -> Vec<ExecInvalidation> {
        let expired = self.lock_registry().drain_expired(now, max_age);
        expired
            .into_iter()
            .map(|entry| close(entry, InvalidationReason::Expired))
            .collect()
    }

    /// Deny and release pending requests touched by a file change.
    ///
    /// Also flushes the kernel cache when the change overlaps a path the
    /// kernel was told to cache, or cannot be scoped at all.
    pub fn invalidate_on_file_change(
        &self,
        notification: &FileChangeNotification,
    ) -> Vec<ExecInvalidation> {
        let (hit, flush) = {
            let mut registry = self.lock_registry();
            let hit = registry.drain_overlapping(&notification.paths);
            let flush =
                notification.is_broad() || registry.touches_cached_path(&notification.paths);
            if flush {
                registry.clear_cached_paths();
            }
            (hit, flush)
        };

        if flush {
            debug!(kind = ?notification.kind, "file change touches kernel cache, clearing");
            if let Err(e) = self.api.clear_cache() {
                error!(error = %e, "failed to clear kernel cache");
            }
        }

        hit.into_iter()
            .map(|entry| close(entry, InvalidationReason::ApplicationChanged))
            .collect()
    }

    /// Drop every kernel-cached decision.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::ClearCache`] on provider failure.
    pub fn invalidate_kernel_cache(&self) -> Result<(), EndpointError> {
        self.lock_registry().clear_cached_paths();
        self.api.clear_cache()
    }

    /// Replace parser settings for subsequent exec events.
    pub fn update_settings(&self, settings: ClientSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Whether a request is still awaiting its decision.
    pub fn is_pending(&self, id: RequestId) -> bool {
        self.lock_registry().contains(id)
    }

    /// Number of requests awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.lock_registry().len()
    }

    /// Deny every pending request and disconnect from the provider.
    pub fn shutdown(&self) {
        let pending = self.lock_registry().drain_all();
        if !pending.is_empty() {
            warn!(count = pending.len(), "denying pending requests on shutdown");
        }
        for entry in pending {
            deny(entry.handle);
        }
        self.api.delete_client();
        info!("endpoint security client stopped");
    }
}

fn deny(handle: KernelHandle) {
    let token = handle.token();
    if let Err(e) = handle.respond(false, false) {
        error!(token = token.0, error = %e, "failed to deny exec request");
    }
}

fn close(entry: PendingEntry, reason: InvalidationReason) -> ExecInvalidation {
    deny(entry.handle);
    ExecInvalidation {
        id: entry.request.id,
        binary_path: entry.request.binary_path,
        reason,
    }
}
