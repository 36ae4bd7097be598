//! Decision engine.
//!
//! [`decide`] is a pure function of the request, its signature verdict, the
//! active rule snapshot and the policy flags. [`DecisionEngine`] holds the
//! current snapshot and policy behind their own locks and swaps them
//! atomically on refresh or configuration change.

pub mod path_policy;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PolicyConfig;
use crate::rules::{RuleDatabase, RuleDatabaseStatus, RulePolicy, RulesError};
use crate::types::{AuthorizationRequest, BinaryType, Verdict};

/// Enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// Enforce every deny.
    #[default]
    Lockdown,
    /// Log implicit denies but allow them; explicit deny rules still apply.
    Monitor,
}

/// Resolved policy flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecisionPolicy {
    /// Allow valid binaries with no matching rule.
    pub allow_unknown_programs: bool,
    /// Allow binaries without a code signature.
    pub allow_unsigned_programs: bool,
    /// Allow binaries whose signature is invalid or could not be checked.
    pub allow_invalid_programs: bool,
    /// Enforcement mode.
    pub mode: ClientMode,
}

impl DecisionPolicy {
    /// Resolve flags from configuration; missing keys fall back to `false`.
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            allow_unknown_programs: required_flag(
                config.allow_unknown_programs,
                "allow_unknown_programs",
            ),
            allow_unsigned_programs: required_flag(
                config.allow_unsigned_programs,
                "allow_unsigned_programs",
            ),
            allow_invalid_programs: required_flag(
                config.allow_invalid_programs,
                "allow_invalid_programs",
            ),
            mode: config.mode,
        }
    }
}

fn required_flag(value: Option<bool>, key: &str) -> bool {
    value.unwrap_or_else(|| {
        warn!(key, "policy key missing, defaulting to false");
        false
    })
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionReason {
    /// Valid platform binary or the agent itself.
    TrustedBinary,
    /// Matched an allowlist rule.
    RuleAllow,
    /// Matched a denylist rule.
    RuleDeny {
        /// The rule's custom message.
        message: String,
    },
    /// Valid signature, no rule.
    UnknownProgram,
    /// No code signature.
    UnsignedProgram,
    /// Broken code signature.
    InvalidSignature,
    /// The signature check itself failed.
    VerificationFailed,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrustedBinary => f.write_str("trusted binary"),
            Self::RuleAllow => f.write_str("allowlist rule"),
            Self::RuleDeny { message } if message.is_empty() => f.write_str("denylist rule"),
            Self::RuleDeny { message } => write!(f, "denylist rule: {message}"),
            Self::UnknownProgram => f.write_str("unknown program"),
            Self::UnsignedProgram => f.write_str("unsigned program"),
            Self::InvalidSignature => f.write_str("invalid code signature"),
            Self::VerificationFailed => f.write_str("code signature check failed"),
        }
    }
}

/// Outcome for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether execution is allowed.
    pub allow: bool,
    /// Whether the kernel may cache the answer.
    pub cacheable: bool,
    /// Path through the decision table.
    pub reason: DecisionReason,
    /// Allowed only because of monitor mode.
    pub monitored: bool,
}

/// Evaluate a request against a verdict, rules and policy.
///
/// Only the trusted-binary allow is cacheable, so a later rule refresh is
/// never shadowed by a kernel-cached answer.
pub fn decide(
    request: &AuthorizationRequest,
    verdict: Verdict,
    rules: &RuleDatabase,
    policy: &DecisionPolicy,
) -> Decision {
    let mut explicit = false;
    let (allow, cacheable, reason) = match verdict {
        Verdict::Failed => (
            policy.allow_invalid_programs,
            false,
            DecisionReason::VerificationFailed,
        ),
        Verdict::Invalid => (
            policy.allow_invalid_programs,
            false,
            DecisionReason::InvalidSignature,
        ),
        Verdict::NotSigned => (
            policy.allow_unsigned_programs,
            false,
            DecisionReason::UnsignedProgram,
        ),
        Verdict::Valid => match request.binary_type {
            BinaryType::Platform | BinaryType::Agent => (true, true, DecisionReason::TrustedBinary),
            BinaryType::ThirdParty => {
                match rules.binary_rule(&request.code_directory_hash.hex) {
                    Some(rule) if rule.policy == RulePolicy::Allow => {
                        (true, false, DecisionReason::RuleAllow)
                    }
                    Some(rule) => {
                        explicit = true;
                        (
                            false,
                            false,
                            DecisionReason::RuleDeny {
                                message: rule.message.clone(),
                            },
                        )
                    }
                    None => (
                        policy.allow_unknown_programs,
                        false,
                        DecisionReason::UnknownProgram,
                    ),
                }
            }
        },
    };

    if !allow && !explicit && policy.mode == ClientMode::Monitor {
        return Decision {
            allow: true,
            cacheable: false,
            reason,
            monitored: true,
        };
    }

    Decision {
        allow,
        cacheable,
        reason,
        monitored: false,
    }
}

/// Holds the active rule snapshot and policy.
#[derive(Debug, Default)]
pub struct DecisionEngine {
    rules: RwLock<Arc<RuleDatabase>>,
    policy: RwLock<DecisionPolicy>,
}

impl DecisionEngine {
    /// Engine with an empty rule set and the given policy.
    pub fn new(policy: DecisionPolicy) -> Self {
        Self {
            rules: RwLock::new(Arc::new(RuleDatabase::empty())),
            policy: RwLock::new(policy),
        }
    }

    /// Decide a request against the current snapshot and policy.
    pub fn evaluate(&self, request: &AuthorizationRequest, verdict: Verdict) -> Decision {
        let rules = self.rule_snapshot();
        let policy = self.policy();
        decide(request, verdict, &rules, &policy)
    }

    /// Replace the rule snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RulesError::InvalidDatabase`] for an invalid database; the
    /// previous snapshot stays active.
    pub fn install_rules(&self, database: RuleDatabase) -> Result<RuleDatabaseStatus, RulesError> {
        let status = database.status;
        match status {
            RuleDatabaseStatus::Invalid => {
                warn!("rejecting invalid rule database, keeping previous rules");
                return Err(RulesError::InvalidDatabase);
            }
            RuleDatabaseStatus::Partial => {
                warn!(
                    rules = database.rule_count(),
                    "rule database contained invalid rules, installing the rest"
                );
            }
            RuleDatabaseStatus::Valid => {
                info!(rules = database.rule_count(), "rule database installed");
            }
        }
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(database);
        Ok(status)
    }

    /// Replace the policy flags.
    pub fn set_policy(&self, policy: DecisionPolicy) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Current policy flags.
    pub fn policy(&self) -> DecisionPolicy {
        *self.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current rule snapshot.
    pub fn rule_snapshot(&self) -> Arc<RuleDatabase> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }
}
