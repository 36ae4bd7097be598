//! Hash-keyed rule database.
//!
//! Rules arrive as JSON (`{"rules": [...]}`) from a [`source::RuleSource`]
//! and are parsed into an immutable [`RuleDatabase`] snapshot. A snapshot
//! is always replaced wholesale, never merged.
//!
//! Parsing is lenient per entry: a malformed entry is dropped and logged and
//! the database status degrades to [`RuleDatabaseStatus::Partial`]. The
//! database is [`RuleDatabaseStatus::Invalid`] when the document itself is
//! unusable or every entry was dropped.

pub mod source;

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

/// Length of a full SHA-256 hex digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Length of the kernel's truncated code-directory hash, in hex characters.
pub const TRUNCATED_HASH_HEX_LEN: usize = 40;

/// What a rule hash identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    /// A specific binary (code-directory hash).
    Binary,
    /// A signing certificate.
    Certificate,
}

/// Effect of a matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePolicy {
    /// Allowlist entry.
    Allow,
    /// Denylist entry.
    Deny,
}

/// A single rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// What the hash identifies.
    pub rule_type: RuleType,
    /// Allow or deny.
    pub policy: RulePolicy,
    /// Message shown when the rule fires.
    pub message: String,
    /// Truncated, uppercased hash key.
    pub hash: String,
}

/// Parse outcome of a rule document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDatabaseStatus {
    /// Every entry parsed.
    Valid,
    /// Some entries were dropped; the rest are usable.
    Partial,
    /// Unusable; must not replace the active snapshot.
    Invalid,
}

/// Immutable rule snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDatabase {
    /// Parse outcome.
    pub status: RuleDatabaseStatus,
    /// Binary rules keyed by truncated hash.
    pub binary_rules: HashMap<String, Rule>,
    /// Certificate rules keyed by truncated hash.
    pub certificate_rules: HashMap<String, Rule>,
}

impl RuleDatabase {
    /// A valid database with no rules.
    pub fn empty() -> Self {
        Self {
            status: RuleDatabaseStatus::Valid,
            binary_rules: HashMap::new(),
            certificate_rules: HashMap::new(),
        }
    }

    fn invalid() -> Self {
        Self {
            status: RuleDatabaseStatus::Invalid,
            ..Self::empty()
        }
    }

    /// Binary rule for a code-directory hash, if any.
    pub fn binary_rule(&self, hash: &str) -> Option<&Rule> {
        self.binary_rules.get(hash)
    }

    /// Total number of rules.
    pub fn rule_count(&self) -> usize {
        self.binary_rules
            .len()
            .saturating_add(self.certificate_rules.len())
    }
}

impl Default for RuleDatabase {
    fn default() -> Self {
        Self::empty()
    }
}

/// Errors produced while obtaining a rule database.
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    /// The rule file could not be read.
    #[error("failed to read rule database {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The sync server could not be reached or answered badly.
    #[error("rule server request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The sync server URL is unusable.
    #[error("invalid rule server url: {0}")]
    Url(String),
    /// The configured source lacks a required setting.
    #[error("rule source setting '{0}' is missing")]
    MissingSetting(&'static str),
    /// The sync server answered with a non-success status.
    #[error("rule server returned HTTP {0}")]
    Status(u16),
    /// The document parsed to an invalid database.
    #[error("rule database is invalid")]
    InvalidDatabase,
}

#[derive(Debug, Deserialize)]
struct JsonRule {
    rule_type: String,
    policy: String,
    sha256: String,
    #[serde(default)]
    custom_msg: String,
}

/// Parse a JSON rule document.
///
/// Never fails: problems are reported through [`RuleDatabase::status`].
pub fn parse_rule_database(bytes: &[u8]) -> RuleDatabase {
    let document: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(document) => document,
        Err(e) => {
            warn!(error = %e, "rule database is not valid JSON");
            return RuleDatabase::invalid();
        }
    };
    let Some(entries) = document.get("rules").and_then(serde_json::Value::as_array) else {
        warn!("rule database has no \"rules\" list");
        return RuleDatabase::invalid();
    };

    let mut database = RuleDatabase::empty();
    for (index, entry) in entries.iter().enumerate() {
        match parse_rule(entry) {
            Ok(rule) => {
                let map = match rule.rule_type {
                    RuleType::Binary => &mut database.binary_rules,
                    RuleType::Certificate => &mut database.certificate_rules,
                };
                map.insert(rule.hash.clone(), rule);
            }
            Err(reason) => {
                warn!(index, reason, "dropping malformed rule");
                database.status = RuleDatabaseStatus::Partial;
            }
        }
    }

    if database.status == RuleDatabaseStatus::Partial && database.rule_count() == 0 {
        database.status = RuleDatabaseStatus::Invalid;
    }
    database
}

fn parse_rule(entry: &serde_json::Value) -> Result<Rule, &'static str> {
    let raw = JsonRule::deserialize(entry).map_err(|_| "missing or mistyped fields")?;
    let rule_type = match raw.rule_type.as_str() {
        "BINARY" => RuleType::Binary,
        "CERTIFICATE" => RuleType::Certificate,
        _ => return Err("unknown rule_type"),
    };
    let policy = match raw.policy.as_str() {
        // WHITELIST* and BLACKLIST are legacy spellings.
        "ALLOWLIST" | "WHITELIST" | "WHITELIST_COMPILER" => RulePolicy::Allow,
        "DENYLIST" | "BLACKLIST" => RulePolicy::Deny,
        _ => return Err("unknown policy"),
    };
    let hash = normalize_hash(&raw.sha256).ok_or("sha256 must be 64 hex characters")?;
    Ok(Rule {
        rule_type,
        policy,
        message: raw.custom_msg,
        hash,
    })
}

/// Truncate a SHA-256 hex digest to the kernel's 20-byte form, uppercased.
///
/// Returns `None` unless the input is exactly 64 hex characters.
pub fn normalize_hash(sha256: &str) -> Option<String> {
    if sha256.len() != SHA256_HEX_LEN || hex::decode(sha256).is_err() {
        return None;
    }
    sha256
        .get(..TRUNCATED_HASH_HEX_LEN)
        .map(str::to_ascii_uppercase)
}
