//! Endpoint-security adapter.
//!
//! Bridges the OS security provider and the rest of the agent:
//! - [`EndpointSecurityApi`] is the provider surface (client lifecycle,
//!   subscriptions, message retention and auth responses).
//! - [`client::EndpointSecurityClient`] parses raw kernel messages, tracks
//!   in-flight exec requests and guarantees exactly one response per exec.
//! - [`handle::KernelHandle`] owns a retained kernel message until it is
//!   answered and released.
//!
//! Provider callbacks may arrive on any thread. The client only does brief
//! lock-protected bookkeeping on them and forwards [`ClientEvent`]s over an
//! unbounded channel to the orchestrator.

pub mod client;
pub mod handle;
pub mod parser;
pub mod registry;

use std::sync::Arc;

use crate::types::{AuthorizationRequest, FileChangeNotification};

/// `mmap` flag marking a copy-on-write mapping.
pub const MAP_PRIVATE: i32 = 0x0002;

/// `mmap` protection bit allowing writes.
pub const PROT_WRITE: i32 = 0x02;

/// Opaque reference to a kernel message held by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageToken(pub u64);

/// Kernel event types the agent subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Exec authorization; must be answered.
    AuthExec,
    /// File written.
    NotifyWrite,
    /// File unlinked.
    NotifyUnlink,
    /// File renamed.
    NotifyRename,
    /// File mapped into memory.
    NotifyMmap,
    /// Hard link created.
    NotifyLink,
    /// File truncated.
    NotifyTruncate,
    /// File created.
    NotifyCreate,
    /// Filesystem mounted.
    NotifyMount,
    /// Filesystem unmounted.
    NotifyUnmount,
}

/// Every event type the client subscribes to at startup.
pub const SUBSCRIBED_EVENTS: [EventType; 10] = [
    EventType::AuthExec,
    EventType::NotifyWrite,
    EventType::NotifyUnlink,
    EventType::NotifyRename,
    EventType::NotifyMmap,
    EventType::NotifyLink,
    EventType::NotifyTruncate,
    EventType::NotifyCreate,
    EventType::NotifyMount,
    EventType::NotifyUnmount,
];

/// A file reference carried by a kernel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    /// Absolute path as reported by the kernel; may be empty when truncated.
    pub path: String,
}

impl RawFile {
    /// Build a file reference from a path.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Destination of a rename or create event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawDestination {
    /// The destination already existed and was replaced.
    ExistingFile(RawFile),
    /// A new entry inside a directory.
    NewPath {
        /// Containing directory.
        dir: RawFile,
        /// Entry name.
        filename: String,
    },
}

/// Process metadata of an exec target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProcess {
    /// Executable file.
    pub executable: RawFile,
    /// Parent process id.
    pub ppid: i32,
    /// Process id from the audit token.
    pub pid: i32,
    /// Effective user id from the audit token.
    pub euid: u32,
    /// Group id.
    pub gid: u32,
    /// Raw code-directory hash bytes (20 bytes, or empty).
    pub cdhash: Vec<u8>,
    /// Signing identifier, empty if unsigned.
    pub signing_id: String,
    /// Team identifier, empty if none.
    pub team_id: String,
    /// Kernel `is_platform_binary` flag.
    pub is_platform_binary: bool,
}

/// Event payload of a kernel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// Exec authorization request.
    AuthExec(RawProcess),
    /// Write notification.
    Write {
        /// Written file.
        target: RawFile,
    },
    /// Unlink notification.
    Unlink {
        /// Removed file.
        target: RawFile,
    },
    /// Rename notification.
    Rename {
        /// Original location.
        source: RawFile,
        /// New location.
        destination: RawDestination,
    },
    /// Memory-map notification.
    Mmap {
        /// Mapped file.
        source: RawFile,
        /// `mmap` flags.
        flags: i32,
        /// `mmap` protection bits.
        protection: i32,
    },
    /// Hard-link notification.
    Link {
        /// Linked file.
        source: RawFile,
        /// Directory receiving the link.
        target_dir: RawFile,
        /// Name of the new link.
        target_filename: String,
    },
    /// Truncate notification.
    Truncate {
        /// Truncated file.
        target: RawFile,
    },
    /// Create notification.
    Create {
        /// Created entry.
        destination: RawDestination,
    },
    /// Mount notification.
    Mount {
        /// Mount point.
        mount_point: RawFile,
    },
    /// Unmount notification.
    Unmount {
        /// Mount point.
        mount_point: RawFile,
    },
    /// Any other event type, by raw provider code.
    Unsupported(u32),
}

/// A kernel message as handed to the provider callback.
///
/// Only valid for the duration of the callback unless retained with
/// [`EndpointSecurityApi::copy_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Provider reference to the message.
    pub token: MessageToken,
    /// Decoded event payload.
    pub event: RawEvent,
}

/// Callback invoked by the provider for every delivered message.
pub type MessageCallback = Box<dyn Fn(RawMessage) + Send + Sync>;

/// Errors reported by the OS security provider.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The provider client could not be created.
    #[error("failed to create endpoint security client: {0}")]
    NewClient(String),
    /// Event subscription was rejected.
    #[error("failed to subscribe to endpoint security events: {0}")]
    Subscribe(String),
    /// The kernel decision cache could not be cleared.
    #[error("failed to clear the endpoint security cache: {0}")]
    ClearCache(String),
    /// A kernel message could not be retained.
    #[error("failed to copy endpoint security message: {0}")]
    CopyMessage(String),
    /// An auth response was rejected.
    #[error("failed to respond to endpoint security message: {0}")]
    Respond(String),
}

/// The OS security provider consumed by the adapter.
///
/// Implementations wrap the platform API; tests provide in-memory fakes.
pub trait EndpointSecurityApi: Send + Sync {
    /// Create the provider client and register the message callback.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NewClient`] if the client cannot be created.
    fn new_client(&self, callback: MessageCallback) -> Result<(), EndpointError>;

    /// Unsubscribe and tear down the provider client.
    fn delete_client(&self);

    /// Subscribe to the given event types.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Subscribe`] if the subscription is rejected.
    fn subscribe(&self, events: &[EventType]) -> Result<(), EndpointError>;

    /// Answer an auth message.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Respond`] if the provider rejects the answer.
    fn respond_auth_result(
        &self,
        token: MessageToken,
        allow: bool,
        cache: bool,
    ) -> Result<(), EndpointError>;

    /// Retain a message beyond its callback so it can be answered later.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::CopyMessage`] if the message cannot be retained.
    fn copy_message(&self, message: &RawMessage) -> Result<MessageToken, EndpointError>;

    /// Release a retained message.
    fn free_message(&self, token: MessageToken);

    /// Drop every decision the kernel has cached.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::ClearCache`] on provider failure.
    fn clear_cache(&self) -> Result<(), EndpointError>;
}

/// Factory producing the provider; invoked once at startup.
pub type EndpointSecurityFactory =
    Box<dyn FnOnce() -> Result<Arc<dyn EndpointSecurityApi>, EndpointError> + Send>;

/// Events forwarded from the adapter to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A parsed exec request now tracked as pending.
    ExecRequest(AuthorizationRequest),
    /// A filesystem mutation that may invalidate cached or pending decisions.
    FileChanged(FileChangeNotification),
}
