//! `codesign(1)` backed signature oracle.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CodeSignatureStatus, SignatureOracle};

/// Default location of the platform `codesign` tool.
pub const DEFAULT_CODESIGN_PATH: &str = "/usr/bin/codesign";

/// Runs `codesign --verify --deep --strict <path>` per check.
///
/// The child is killed when the check future is dropped.
#[derive(Debug, Clone)]
pub struct CodesignOracle {
    program: PathBuf,
}

impl Default for CodesignOracle {
    fn default() -> Self {
        Self::with_program(DEFAULT_CODESIGN_PATH)
    }
}

impl CodesignOracle {
    /// Use a different verification program accepting the same arguments.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Program invoked for each check.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl SignatureOracle for CodesignOracle {
    async fn check(&self, path: &Path) -> CodeSignatureStatus {
        let status = Command::new(&self.program)
            .args(["--verify", "--deep", "--strict"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) => match status.code() {
                Some(0) => CodeSignatureStatus::Valid,
                Some(1) => CodeSignatureStatus::Invalid,
                code => {
                    debug!(path = %path.display(), ?code, "codesign exited abnormally");
                    CodeSignatureStatus::InternalError
                }
            },
            Err(e) => {
                warn!(
                    program = %self.program.display(),
                    path = %path.display(),
                    error = %e,
                    "failed to run codesign"
                );
                CodeSignatureStatus::IoError
            }
        }
    }
}
