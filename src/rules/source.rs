//! Rule database sources.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use super::{parse_rule_database, RuleDatabase, RulesError};
use crate::config::{RuleSourceKind, RulesConfig};

/// Timeout for a single sync-server request.
const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where rule databases come from.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Fetch and parse the current rule database.
    ///
    /// The returned database may be `Invalid`; callers decide whether to
    /// install it.
    ///
    /// # Errors
    ///
    /// Returns [`RulesError`] when the document cannot be obtained at all.
    async fn fetch(&self) -> Result<RuleDatabase, RulesError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Reads a JSON rule file from disk.
#[derive(Debug, Clone)]
pub struct LocalRuleSource {
    path: PathBuf,
}

impl LocalRuleSource {
    /// Source backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Rule file location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleSource for LocalRuleSource {
    async fn fetch(&self) -> Result<RuleDatabase, RulesError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| RulesError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "read rule database");
        Ok(parse_rule_database(&bytes))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Downloads rules from a sync server with `POST {server}/v1/rules/{machine_id}`.
#[derive(Debug, Clone)]
pub struct RemoteRuleSource {
    endpoint: Url,
    client: reqwest::Client,
}

impl RemoteRuleSource {
    /// Build a source for `server_url` and `machine_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RulesError::Url`] if the URL cannot be parsed or cannot
    /// carry path segments.
    pub fn new(server_url: &str, machine_id: &str) -> Result<Self, RulesError> {
        let endpoint = rules_endpoint(server_url, machine_id)?;
        let client = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()?;
        Ok(Self { endpoint, client })
    }

    /// Fully resolved request URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Join `/v1/rules/{machine_id}` onto the server URL.
///
/// # Errors
///
/// Returns [`RulesError::Url`] for unparsable or non-hierarchical URLs.
pub fn rules_endpoint(server_url: &str, machine_id: &str) -> Result<Url, RulesError> {
    let mut url = Url::parse(server_url).map_err(|e| RulesError::Url(format!("{server_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| RulesError::Url(format!("{server_url}: cannot be a base")))?
        .pop_if_empty()
        .extend(["v1", "rules", machine_id]);
    Ok(url)
}

#[async_trait]
impl RuleSource for RemoteRuleSource {
    async fn fetch(&self) -> Result<RuleDatabase, RulesError> {
        let response = self.client.post(self.endpoint.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RulesError::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        debug!(url = %self.endpoint, bytes = bytes.len(), "downloaded rule database");
        Ok(parse_rule_database(&bytes))
    }

    fn describe(&self) -> String {
        format!("sync server {}", self.endpoint)
    }
}

/// Build the configured rule source; `None` when rules are disabled.
///
/// # Errors
///
/// Returns [`RulesError::MissingSetting`] or [`RulesError::Url`] for an
/// incomplete configuration.
pub fn source_from_config(config: &RulesConfig) -> Result<Option<Arc<dyn RuleSource>>, RulesError> {
    let source: Arc<dyn RuleSource> = match config.source {
        RuleSourceKind::None => return Ok(None),
        RuleSourceKind::Local => {
            let path = config
                .database_path
                .as_ref()
                .ok_or(RulesError::MissingSetting("rules.database_path"))?;
            Arc::new(LocalRuleSource::new(path))
        }
        RuleSourceKind::Remote => {
            let server_url = config
                .server_url
                .as_deref()
                .ok_or(RulesError::MissingSetting("rules.server_url"))?;
            let machine_id = config
                .machine_id
                .as_deref()
                .ok_or(RulesError::MissingSetting("rules.machine_id"))?;
            Arc::new(RemoteRuleSource::new(server_url, machine_id)?)
        }
    };
    info!(source = %source.describe(), "rule source configured");
    Ok(Some(source))
}
