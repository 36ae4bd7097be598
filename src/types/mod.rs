//! Core domain types shared by the endpoint adapter, the signature scheduler,
//! the decision engine and the authorization orchestrator.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signing-identifier prefix used by OS-vendor binaries.
pub const PLATFORM_SIGNING_ID_PREFIX: &str = "com.apple.";

// ── Requests ────────────────────────────────────────────────────

/// Process-lifetime-unique identifier assigned to each intercepted exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Digest algorithm behind a code-directory hash.
///
/// The kernel can only carry 20 bytes, so SHA-256 digests arrive truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    /// Full SHA-1 digest.
    Sha1,
    /// SHA-256 digest truncated to its first 20 bytes.
    TruncatedSha256,
}

/// Code-directory hash reported for a binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryHash {
    /// Digest algorithm.
    pub hash_type: HashType,
    /// Uppercase hex digest; empty when the binary carries no code directory.
    pub hex: String,
}

impl BinaryHash {
    /// A hash for a binary with no code directory.
    pub fn empty() -> Self {
        Self {
            hash_type: HashType::TruncatedSha256,
            hex: String::new(),
        }
    }

    /// Whether the kernel reported no code-directory hash.
    pub fn is_empty(&self) -> bool {
        self.hex.is_empty()
    }
}

/// Trust class of the binary being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
    /// Signed by the OS vendor.
    Platform,
    /// The agent's own executable.
    Agent,
    /// Everything else.
    ThirdParty,
}

/// Where the "platform binary" classification comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformBinarySource {
    /// Trust the kernel-reported `is_platform_binary` flag.
    KernelFlag,
    /// Re-derive from the `com.apple.` signing-identifier prefix.
    SigningId,
    /// Require both the kernel flag and the signing-identifier prefix.
    #[default]
    Both,
}

impl PlatformBinarySource {
    /// Classify a binary from its kernel flag and signing identifier.
    pub fn is_platform(self, kernel_flag: bool, signing_identifier: &str) -> bool {
        let vendor_id = signing_identifier.starts_with(PLATFORM_SIGNING_ID_PREFIX);
        match self {
            Self::KernelFlag => kernel_flag,
            Self::SigningId => vendor_id,
            Self::Both => kernel_flag && vendor_id,
        }
    }
}

/// A parsed exec-authorization request awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Unique request identifier.
    pub id: RequestId,
    /// Binary (or enclosing bundle) path being executed.
    pub binary_path: PathBuf,
    /// Parent process id.
    pub parent_pid: i32,
    /// Process id.
    pub pid: i32,
    /// Effective user id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
    /// Code-directory hash, possibly empty.
    pub code_directory_hash: BinaryHash,
    /// Signing identifier, possibly empty.
    pub signing_identifier: String,
    /// Team identifier, possibly empty.
    pub team_identifier: String,
    /// Raw kernel `is_platform_binary` flag.
    pub is_platform_binary: bool,
    /// Resolved trust class.
    pub binary_type: BinaryType,
    /// When the exec event was received.
    pub created_at: DateTime<Utc>,
}

// ── File changes ────────────────────────────────────────────────

/// Kind of filesystem mutation reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    /// Unrecognised mutation; triggers a full cache reset.
    Unknown,
    /// File contents written.
    Write,
    /// File removed.
    Unlink,
    /// File moved.
    Rename,
    /// Shared writable mapping created.
    Mmap,
    /// Hard link created.
    Link,
    /// File truncated.
    Truncate,
    /// File created.
    Create,
    /// Filesystem mounted.
    Mount,
    /// Filesystem unmounted.
    Unmount,
}

/// A canonical file-change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeNotification {
    /// Mutation kind.
    pub kind: FileChangeKind,
    /// Every path touched by the mutation.
    pub paths: Vec<PathBuf>,
}

impl FileChangeNotification {
    /// Whether the notification cannot be scoped and must reset every cache.
    pub fn is_broad(&self) -> bool {
        self.kind == FileChangeKind::Unknown || self.paths.is_empty()
    }
}

/// Why a pending request was denied without a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The request outlived the maximum request age.
    Expired,
    /// The binary changed on disk while the request was pending.
    ApplicationChanged,
}

/// A pending request that was force-denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInvalidation {
    /// Identifier of the denied request.
    pub id: RequestId,
    /// Binary path of the denied request.
    pub binary_path: PathBuf,
    /// Why it was denied.
    pub reason: InvalidationReason,
}

// ── Signatures ──────────────────────────────────────────────────

/// Outcome of a code-signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Signature present and valid.
    Valid,
    /// Signature present but broken.
    Invalid,
    /// No code signature.
    NotSigned,
    /// The check itself failed (I/O or API error).
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::NotSigned => "not signed",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

// ── Path helpers ────────────────────────────────────────────────

/// Normalize a path by resolving `.` and `..` components without filesystem access.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Whether either path is a component-wise prefix of the other.
///
/// A write inside a bundle overlaps the bundle; a directory overlaps every
/// descendant.
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
