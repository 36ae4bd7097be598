//! Raw kernel message parsing.
//!
//! Exec events become [`AuthorizationRequest`]s; file-mutation events become
//! canonical [`FileChangeNotification`]s.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::client::ClientSettings;
use super::{RawDestination, RawEvent, RawFile, RawProcess, MAP_PRIVATE, PROT_WRITE};
use crate::types::{
    AuthorizationRequest, BinaryHash, BinaryType, FileChangeKind, FileChangeNotification, HashType,
    RequestId,
};

/// Byte length of a kernel code-directory hash.
pub const CDHASH_LEN: usize = 20;

/// Why an exec message could not be parsed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    /// The kernel reported no executable path.
    #[error("exec event carries an empty executable path")]
    EmptyPath,
    /// The code-directory hash has an unexpected length.
    #[error("malformed code directory hash: {0} bytes")]
    MalformedCdHash(usize),
}

/// Parse an exec event into a request.
///
/// `next_id` is only invoked once parsing has succeeded so failed parses do
/// not consume identifiers.
///
/// # Errors
///
/// Returns [`ParseError`] when the executable path or hash is unusable.
pub fn parse_exec(
    process: &RawProcess,
    settings: &ClientSettings,
    now: DateTime<Utc>,
    next_id: impl FnOnce() -> RequestId,
) -> Result<AuthorizationRequest, ParseError> {
    if process.executable.path.is_empty() {
        return Err(ParseError::EmptyPath);
    }
    let executable = PathBuf::from(&process.executable.path);
    let code_directory_hash = parse_cdhash(&process.cdhash)?;

    let is_agent = settings
        .agent_binary
        .as_deref()
        .is_some_and(|agent| agent == executable.as_path());
    let binary_type = if is_agent {
        BinaryType::Agent
    } else if settings
        .platform_binary_source
        .is_platform(process.is_platform_binary, &process.signing_id)
    {
        BinaryType::Platform
    } else {
        BinaryType::ThirdParty
    };

    Ok(AuthorizationRequest {
        id: next_id(),
        binary_path: resolve_bundle_path(&executable),
        parent_pid: process.ppid,
        pid: process.pid,
        uid: process.euid,
        gid: process.gid,
        code_directory_hash,
        signing_identifier: process.signing_id.clone(),
        team_identifier: process.team_id.clone(),
        is_platform_binary: process.is_platform_binary,
        binary_type,
        created_at: now,
    })
}

fn parse_cdhash(bytes: &[u8]) -> Result<BinaryHash, ParseError> {
    if bytes.iter().all(|b| *b == 0) {
        return Ok(BinaryHash::empty());
    }
    if bytes.len() != CDHASH_LEN {
        return Err(ParseError::MalformedCdHash(bytes.len()));
    }
    Ok(BinaryHash {
        hash_type: HashType::TruncatedSha256,
        hex: hex::encode_upper(bytes),
    })
}

/// Map an executable inside a signed bundle to the bundle directory.
///
/// `Foo.app/Contents/MacOS/Foo` resolves to `Foo.app` when
/// `Foo.app/Contents/_CodeSignature` exists; any other path is returned as is.
pub fn resolve_bundle_path(executable: &Path) -> PathBuf {
    if let Some(bundle) = executable.ancestors().nth(3) {
        if !bundle.as_os_str().is_empty() && bundle.join("Contents/_CodeSignature").exists() {
            return bundle.to_path_buf();
        }
    }
    executable.to_path_buf()
}

/// Parse a NOTIFY event into a canonical notification.
///
/// Returns `None` for events that cannot mutate a file (private or
/// read-only mappings) and for non-notify events.
pub fn parse_file_change(event: &RawEvent) -> Option<FileChangeNotification> {
    let (kind, paths) = match event {
        RawEvent::Write { target } => (FileChangeKind::Write, vec![file_path(target)]),
        RawEvent::Unlink { target } => (FileChangeKind::Unlink, vec![file_path(target)]),
        RawEvent::Rename {
            source,
            destination,
        } => (
            FileChangeKind::Rename,
            vec![file_path(source), destination_path(destination)],
        ),
        RawEvent::Mmap {
            source,
            flags,
            protection,
        } => {
            if flags & MAP_PRIVATE != 0 || protection & PROT_WRITE == 0 {
                return None;
            }
            (FileChangeKind::Mmap, vec![file_path(source)])
        }
        RawEvent::Link {
            source,
            target_dir,
            target_filename,
        } => (
            FileChangeKind::Link,
            vec![file_path(source), file_path(target_dir).join(target_filename)],
        ),
        RawEvent::Truncate { target } => (FileChangeKind::Truncate, vec![file_path(target)]),
        RawEvent::Create { destination } => {
            (FileChangeKind::Create, vec![destination_path(destination)])
        }
        RawEvent::Mount { mount_point } => (FileChangeKind::Mount, vec![file_path(mount_point)]),
        RawEvent::Unmount { mount_point } => {
            (FileChangeKind::Unmount, vec![file_path(mount_point)])
        }
        RawEvent::AuthExec(_) => return None,
        RawEvent::Unsupported(_) => (FileChangeKind::Unknown, Vec::new()),
    };
    let paths = paths
        .into_iter()
        .filter(|p| !p.as_os_str().is_empty())
        .collect();
    Some(FileChangeNotification { kind, paths })
}

fn file_path(file: &RawFile) -> PathBuf {
    PathBuf::from(&file.path)
}

fn destination_path(destination: &RawDestination) -> PathBuf {
    match destination {
        RawDestination::ExistingFile(file) => file_path(file),
        RawDestination::NewPath { dir, filename } => file_path(dir).join(filename),
    }
}
