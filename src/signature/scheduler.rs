//! Signature verification scheduler.
//!
//! Resolves a binary path to a [`Verdict`] with:
//! - a result cache keyed by path,
//! - at most one in-flight oracle call per path (later callers wait on the
//!   first call and share its verdict),
//! - two bounded worker pools: a primary pool sized to the core count for
//!   small root-owned files, and a small secondary pool for bundles, large
//!   files and files owned by other users.
//!
//! Invalidation cancels overlapping in-flight checks. A canceled check
//! never publishes a verdict: its waiters observe `None` and its oracle
//! future is dropped.

use std::collections::HashMap;
use std::fs::Metadata;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, warn};

use super::SignatureOracle;
use crate::types::{paths_overlap, BinaryHash, Verdict};

/// Files at or above this size go to the secondary pool (10 MiB).
pub const DEFAULT_SIZE_CEILING: u64 = 10_485_760;

/// Worker pool sizing and routing thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Size ceiling for primary-pool routing, in bytes.
    pub size_ceiling: u64,
    /// Concurrent checks in the primary pool.
    pub primary_workers: usize,
    /// Concurrent checks in the secondary pool.
    pub secondary_workers: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            size_ceiling: DEFAULT_SIZE_CEILING,
            primary_workers: online_cores(),
            secondary_workers: 1,
        }
    }
}

/// Number of online cores, at least 1.
pub fn online_cores() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Worker pool a check runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Core-count sized pool for cheap, trusted files.
    Primary,
    /// Small pool for bundles, large files and non-root files.
    Secondary,
}

/// Filesystem facts used for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Whether the path is a directory (bundle).
    pub is_dir: bool,
    /// File size in bytes.
    pub size: u64,
    /// Owning user id, when the platform reports one.
    pub owner_uid: Option<u32>,
}

impl FileInfo {
    /// Extract routing facts from file metadata.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            owner_uid: owner_uid(metadata),
        }
    }
}

#[cfg(unix)]
fn owner_uid(metadata: &Metadata) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.uid())
}

#[cfg(not(unix))]
fn owner_uid(_metadata: &Metadata) -> Option<u32> {
    None
}

/// Pick the worker pool for a file.
pub fn route(info: &FileInfo, size_ceiling: u64) -> QueueKind {
    if info.is_dir || info.size >= size_ceiling || info.owner_uid != Some(0) {
        QueueKind::Secondary
    } else {
        QueueKind::Primary
    }
}

struct InFlightCheck {
    check_id: u64,
    cancel: watch::Sender<bool>,
    waiters: Vec<oneshot::Sender<Verdict>>,
}

#[derive(Default)]
struct SchedulerState {
    results: HashMap<PathBuf, Verdict>,
    in_flight: HashMap<PathBuf, InFlightCheck>,
}

/// Cached, deduplicated, pool-bounded signature verification.
pub struct SignatureScheduler {
    oracle: Arc<dyn SignatureOracle>,
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
    primary: Arc<Semaphore>,
    secondary: Arc<Semaphore>,
    next_check_id: AtomicU64,
}

impl SignatureScheduler {
    /// Create a scheduler in front of `oracle`.
    pub fn new(oracle: Arc<dyn SignatureOracle>, settings: SchedulerSettings) -> Arc<Self> {
        let primary = Arc::new(Semaphore::new(settings.primary_workers.max(1)));
        let secondary = Arc::new(Semaphore::new(settings.secondary_workers.max(1)));
        Arc::new(Self {
            oracle,
            settings,
            state: Mutex::new(SchedulerState::default()),
            primary,
            secondary,
            next_check_id: AtomicU64::new(1),
        })
    }

    /// Resolve the verdict for `path`.
    ///
    /// Returns `NotSigned` without a check when the kernel reported no
    /// code-directory hash, and `Failed` (uncached) when the path cannot be
    /// inspected. Returns `None` if the check was canceled by invalidation.
    pub async fn check_signature_for(
        self: &Arc<Self>,
        path: &Path,
        known_hash: &BinaryHash,
    ) -> Option<Verdict> {
        if known_hash.is_empty() {
            return Some(Verdict::NotSigned);
        }
        if let Some(verdict) = self.cached_verdict(path) {
            debug!(path = %path.display(), %verdict, "signature cache hit");
            return Some(verdict);
        }

        let info = match tokio::fs::metadata(path).await {
            Ok(metadata) => FileInfo::from_metadata(&metadata),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot inspect binary for signature check");
                return Some(Verdict::Failed);
            }
        };

        self.enqueue(path, &info).await.ok()
    }

    fn enqueue(self: &Arc<Self>, path: &Path, info: &FileInfo) -> oneshot::Receiver<Verdict> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock_state();

        if let Some(verdict) = state.results.get(path) {
            let _send_result = tx.send(*verdict);
            return rx;
        }
        if let Some(check) = state.in_flight.get_mut(path) {
            debug!(path = %path.display(), check_id = check.check_id, "joining in-flight signature check");
            check.waiters.push(tx);
            return rx;
        }

        let check_id = self.next_check_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancel_rx) = watch::channel(false);
        state.in_flight.insert(
            path.to_path_buf(),
            InFlightCheck {
                check_id,
                cancel,
                waiters: vec![tx],
            },
        );
        drop(state);

        let queue = route(info, self.settings.size_ceiling);
        debug!(path = %path.display(), check_id, ?queue, "scheduling signature check");
        let scheduler = Arc::clone(self);
        let path = path.to_path_buf();
        tokio::spawn(async move {
            scheduler.run_check(path, check_id, queue, cancel_rx).await;
        });
        rx
    }

    async fn run_check(
        &self,
        path: PathBuf,
        check_id: u64,
        queue: QueueKind,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let pool = match queue {
            QueueKind::Primary => Arc::clone(&self.primary),
            QueueKind::Secondary => Arc::clone(&self.secondary),
        };

        let _permit = tokio::select! {
            permit = pool.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.complete(&path, check_id, Verdict::Failed);
                    return;
                }
            },
            () = cancelled(&mut cancel_rx) => {
                debug!(path = %path.display(), check_id, "signature check canceled before start");
                return;
            }
        };

        let status = tokio::select! {
            status = self.oracle.check(&path) => status,
            () = cancelled(&mut cancel_rx) => {
                debug!(path = %path.display(), check_id, "signature check canceled");
                return;
            }
        };

        self.complete(&path, check_id, status.into());
    }

    fn complete(&self, path: &Path, check_id: u64, verdict: Verdict) {
        let waiters = {
            let mut state = self.lock_state();
            let current = state
                .in_flight
                .get(path)
                .is_some_and(|check| check.check_id == check_id);
            if !current {
                return;
            }
            let Some(check) = state.in_flight.remove(path) else {
                return;
            };
            if verdict != Verdict::Failed {
                state.results.insert(path.to_path_buf(), verdict);
            }
            check.waiters
        };

        debug!(path = %path.display(), check_id, %verdict, waiters = waiters.len(), "signature check complete");
        for waiter in waiters {
            let _send_result = waiter.send(verdict);
        }
    }

    /// Cancel in-flight checks and drop cached verdicts overlapping `path`.
    ///
    /// Overlap is component-wise in either direction: a write inside a bundle
    /// drops the bundle's verdict, a directory drops every descendant.
    pub fn invalidate_cache_for(&self, path: &Path) {
        let mut state = self.lock_state();
        let canceled: Vec<PathBuf> = state
            .in_flight
            .keys()
            .filter(|candidate| paths_overlap(candidate, path))
            .cloned()
            .collect();
        for key in &canceled {
            if let Some(check) = state.in_flight.remove(key) {
                check.cancel.send_replace(true);
            }
        }
        let before = state.results.len();
        state.results.retain(|cached, _| !paths_overlap(cached, path));
        let dropped = before.saturating_sub(state.results.len());
        if dropped > 0 || !canceled.is_empty() {
            debug!(
                path = %path.display(),
                dropped,
                canceled = canceled.len(),
                "signature cache invalidated"
            );
        }
    }

    /// Cancel every in-flight check and clear every cached verdict.
    pub fn invalidate_cache(&self) {
        let mut state = self.lock_state();
        for (_, check) in state.in_flight.drain() {
            check.cancel.send_replace(true);
        }
        state.results.clear();
        debug!("signature cache cleared");
    }

    /// Cached verdict for `path`, if any.
    pub fn cached_verdict(&self, path: &Path) -> Option<Verdict> {
        self.lock_state().results.get(path).copied()
    }

    /// Number of checks currently queued or running.
    pub fn in_flight_count(&self) -> usize {
        self.lock_state().in_flight.len()
    }

    /// Number of cached verdicts.
    pub fn cached_count(&self) -> usize {
        self.lock_state().results.len()
    }

    /// Routing and pool settings in effect.
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves once the check is canceled or its in-flight entry is dropped.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
