//! Code-signature verification.
//!
//! The [`SignatureOracle`] trait abstracts the platform's static code check;
//! [`codesign::CodesignOracle`] is the default implementation. The
//! [`scheduler::SignatureScheduler`] sits in front of an oracle and adds
//! result caching, per-path deduplication and two bounded worker pools.

pub mod codesign;
pub mod scheduler;

use std::path::Path;

use async_trait::async_trait;

use crate::types::Verdict;

/// Raw outcome of a static code check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSignatureStatus {
    /// Signature present and valid.
    Valid,
    /// Signature missing or broken.
    Invalid,
    /// The binary could not be read.
    IoError,
    /// The check itself failed.
    InternalError,
}

impl From<CodeSignatureStatus> for Verdict {
    fn from(status: CodeSignatureStatus) -> Self {
        match status {
            CodeSignatureStatus::Valid => Verdict::Valid,
            CodeSignatureStatus::Invalid => Verdict::Invalid,
            CodeSignatureStatus::IoError | CodeSignatureStatus::InternalError => Verdict::Failed,
        }
    }
}

/// Static code-signature validity check.
///
/// Implementations may be slow; the scheduler drops the returned future
/// when a check is canceled, so implementations must release resources on
/// drop.
#[async_trait]
pub trait SignatureOracle: Send + Sync {
    /// Verify the code signature of a file or bundle.
    async fn check(&self, path: &Path) -> CodeSignatureStatus;
}
