//! Pending request registry.
//!
//! Tracks every exec request that has been handed to the orchestrator but
//! not yet answered, together with the kernel handle that must eventually
//! receive exactly one response. Entries leave the registry through exactly
//! one of [`PendingRequestRegistry::take`] (decided),
//! [`PendingRequestRegistry::drain_expired`] (expired) or
//! [`PendingRequestRegistry::drain_overlapping`] (application changed); the
//! caller then owns the handle and must answer it.
//!
//! The registry also keeps the set of paths the kernel has been told to
//! cache so file changes can flush the kernel cache when needed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use super::handle::KernelHandle;
use crate::types::{paths_overlap, AuthorizationRequest, RequestId};

/// A request awaiting its decision.
#[derive(Debug)]
pub struct PendingEntry {
    /// The parsed request.
    pub request: AuthorizationRequest,
    /// Retained kernel message; consumed by the single response.
    pub handle: KernelHandle,
    /// Monotonic receive time used for expiry.
    pub received_at: Instant,
}

/// Map of in-flight requests plus the kernel-cached path set.
#[derive(Debug, Default)]
pub struct PendingRequestRegistry {
    entries: HashMap<RequestId, PendingEntry>,
    cached_paths: HashSet<PathBuf>,
}

impl PendingRequestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new pending request.
    ///
    /// # Errors
    ///
    /// Hands the entry back if its identifier is already tracked; the
    /// existing entry is left untouched.
    pub fn insert(&mut self, entry: PendingEntry) -> Result<(), PendingEntry> {
        let id = entry.request.id;
        if self.entries.contains_key(&id) {
            return Err(entry);
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Remove a request for answering. `None` if it was already answered,
    /// expired or invalidated.
    pub fn take(&mut self, id: RequestId) -> Option<PendingEntry> {
        self.entries.remove(&id)
    }

    /// Whether `id` is still awaiting a decision.
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Record that the kernel was told to cache a decision for `path`.
    pub fn record_cached(&mut self, path: PathBuf) {
        self.cached_paths.insert(path);
    }

    /// Remove every request received at least `max_age` before `now`.
    pub fn drain_expired(&mut self, now: Instant, max_age: Duration) -> Vec<PendingEntry> {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.received_at) >= max_age)
            .map(|(id, _)| *id)
            .collect();
        self.remove_all(expired)
    }

    /// Remove every request whose binary path overlaps any of `paths`.
    pub fn drain_overlapping(&mut self, paths: &[PathBuf]) -> Vec<PendingEntry> {
        let hit: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                paths
                    .iter()
                    .any(|changed| paths_overlap(&entry.request.binary_path, changed))
            })
            .map(|(id, _)| *id)
            .collect();
        self.remove_all(hit)
    }

    /// Whether any changed path overlaps a kernel-cached path.
    pub fn touches_cached_path(&self, paths: &[PathBuf]) -> bool {
        self.cached_paths
            .iter()
            .any(|cached| paths.iter().any(|changed| paths_overlap(cached, changed)))
    }

    /// Forget every kernel-cached path.
    pub fn clear_cached_paths(&mut self) {
        self.cached_paths.clear();
    }

    /// Whether `path` is in the kernel-cached set.
    pub fn is_cached(&self, path: &Path) -> bool {
        self.cached_paths.contains(path)
    }

    /// Remove every pending request.
    pub fn drain_all(&mut self) -> Vec<PendingEntry> {
        let mut drained: Vec<PendingEntry> = self.entries.drain().map(|(_, e)| e).collect();
        drained.sort_by_key(|e| e.request.id);
        drained
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_all(&mut self, mut ids: Vec<RequestId>) -> Vec<PendingEntry> {
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }
}
