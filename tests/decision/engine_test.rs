//! Decision table and engine tests.

use std::path::PathBuf;

use chrono::Utc;

use execgate::decision::{decide, ClientMode, DecisionEngine, DecisionPolicy, DecisionReason};
use execgate::rules::{parse_rule_database, RuleDatabase, RuleDatabaseStatus, RulesError};
use execgate::types::{AuthorizationRequest, BinaryHash, BinaryType, HashType, RequestId, Verdict};

const ALLOWED_SHA: &str = "1111111111111111111111111111111111111111111111111111111111111111";
const DENIED_SHA: &str = "2222222222222222222222222222222222222222222222222222222222222222";

fn request(binary_type: BinaryType, sha_prefix: &str) -> AuthorizationRequest {
    AuthorizationRequest {
        id: RequestId(1),
        binary_path: PathBuf::from("/usr/local/bin/tool"),
        parent_pid: 1,
        pid: 100,
        uid: 501,
        gid: 20,
        code_directory_hash: BinaryHash {
            hash_type: HashType::TruncatedSha256,
            hex: sha_prefix.get(..40).unwrap_or(sha_prefix).to_ascii_uppercase(),
        },
        signing_identifier: "org.example.tool".to_owned(),
        team_identifier: String::new(),
        is_platform_binary: binary_type == BinaryType::Platform,
        binary_type,
        created_at: Utc::now(),
    }
}

fn rules() -> RuleDatabase {
    let body = format!(
        r#"{{"rules":[
            {{"rule_type":"BINARY","policy":"ALLOWLIST","sha256":"{ALLOWED_SHA}","custom_msg":""}},
            {{"rule_type":"BINARY","policy":"DENYLIST","sha256":"{DENIED_SHA}","custom_msg":"not on this machine"}}
        ]}}"#
    );
    let db = parse_rule_database(body.as_bytes());
    assert_eq!(db.status, RuleDatabaseStatus::Valid);
    db
}

fn policy(unknown: bool, unsigned: bool, invalid: bool) -> DecisionPolicy {
    DecisionPolicy {
        allow_unknown_programs: unknown,
        allow_unsigned_programs: unsigned,
        allow_invalid_programs: invalid,
        mode: ClientMode::Lockdown,
    }
}

const UNKNOWN_SHA: &str = "3333333333333333333333333333333333333333333333333333333333333333";

#[test]
fn valid_platform_and_agent_binaries_are_cached_allows() {
    let strict = policy(false, false, false);
    for binary_type in [BinaryType::Platform, BinaryType::Agent] {
        let decision = decide(
            &request(binary_type, UNKNOWN_SHA),
            Verdict::Valid,
            &rules(),
            &strict,
        );
        assert!(decision.allow);
        assert!(decision.cacheable);
        assert_eq!(decision.reason, DecisionReason::TrustedBinary);
    }
}

#[test]
fn allowlisted_third_party_is_allowed_uncached() {
    let decision = decide(
        &request(BinaryType::ThirdParty, ALLOWED_SHA),
        Verdict::Valid,
        &rules(),
        &policy(false, false, false),
    );
    assert!(decision.allow);
    assert!(!decision.cacheable);
    assert_eq!(decision.reason, DecisionReason::RuleAllow);
}

#[test]
fn denylist_wins_over_allow_unknown() {
    let decision = decide(
        &request(BinaryType::ThirdParty, DENIED_SHA),
        Verdict::Valid,
        &rules(),
        &policy(true, true, true),
    );
    assert!(!decision.allow);
    assert_eq!(
        decision.reason,
        DecisionReason::RuleDeny {
            message: "not on this machine".to_owned()
        }
    );
}

#[test]
fn unknown_program_follows_policy() {
    let req = request(BinaryType::ThirdParty, UNKNOWN_SHA);
    let denied = decide(&req, Verdict::Valid, &rules(), &policy(false, true, true));
    assert!(!denied.allow);
    assert_eq!(denied.reason, DecisionReason::UnknownProgram);

    let allowed = decide(&req, Verdict::Valid, &rules(), &policy(true, false, false));
    assert!(allowed.allow);
    assert!(!allowed.cacheable);
}

#[test]
fn unsigned_follows_policy_even_for_allowlisted_hash() {
    let req = request(BinaryType::ThirdParty, ALLOWED_SHA);
    assert!(!decide(&req, Verdict::NotSigned, &rules(), &policy(true, false, true)).allow);

    let allowed = decide(&req, Verdict::NotSigned, &rules(), &policy(false, true, false));
    assert!(allowed.allow);
    assert!(!allowed.cacheable);
    assert_eq!(allowed.reason, DecisionReason::UnsignedProgram);
}

#[test]
fn invalid_and_failed_follow_allow_invalid() {
    let req = request(BinaryType::Platform, UNKNOWN_SHA);
    for verdict in [Verdict::Invalid, Verdict::Failed] {
        assert!(!decide(&req, verdict, &rules(), &policy(true, true, false)).allow);
        let allowed = decide(&req, verdict, &rules(), &policy(false, false, true));
        assert!(allowed.allow);
        assert!(!allowed.cacheable);
    }
}

#[test]
fn monitor_mode_allows_implicit_denies_only() {
    let mut monitor = policy(false, false, false);
    monitor.mode = ClientMode::Monitor;

    let unknown = decide(
        &request(BinaryType::ThirdParty, UNKNOWN_SHA),
        Verdict::Valid,
        &rules(),
        &monitor,
    );
    assert!(unknown.allow);
    assert!(unknown.monitored);
    assert!(!unknown.cacheable);

    let denied = decide(
        &request(BinaryType::ThirdParty, DENIED_SHA),
        Verdict::Valid,
        &rules(),
        &monitor,
    );
    assert!(!denied.allow);
    assert!(!denied.monitored);
}

#[test]
fn engine_keeps_previous_rules_on_invalid_install() {
    let engine = DecisionEngine::new(policy(false, false, false));
    assert_eq!(engine.rule_snapshot().rule_count(), 0);

    engine.install_rules(rules()).expect("valid database installs");
    assert_eq!(engine.rule_snapshot().rule_count(), 2);

    let result = engine.install_rules(parse_rule_database(b"garbage"));
    assert!(matches!(result, Err(RulesError::InvalidDatabase)));
    assert_eq!(engine.rule_snapshot().rule_count(), 2);

    let decision = engine.evaluate(&request(BinaryType::ThirdParty, ALLOWED_SHA), Verdict::Valid);
    assert!(decision.allow);
}

#[test]
fn engine_installs_partial_databases() {
    let engine = DecisionEngine::new(policy(false, false, false));
    let body = format!(
        r#"{{"rules":[
            {{"rule_type":"BINARY","policy":"ALLOWLIST","sha256":"{ALLOWED_SHA}","custom_msg":""}},
            {{"rule_type":"BINARY","policy":"ALLOWLIST","sha256":"nothex","custom_msg":""}}
        ]}}"#
    );

    let status = engine
        .install_rules(parse_rule_database(body.as_bytes()))
        .expect("partial database installs");
    assert_eq!(status, RuleDatabaseStatus::Partial);
    assert_eq!(engine.rule_snapshot().rule_count(), 1);
}

#[test]
fn policy_changes_apply_to_later_evaluations() {
    let engine = DecisionEngine::new(policy(false, false, false));
    let req = request(BinaryType::ThirdParty, UNKNOWN_SHA);
    assert!(!engine.evaluate(&req, Verdict::Valid).allow);

    engine.set_policy(policy(true, false, false));
    assert!(engine.evaluate(&req, Verdict::Valid).allow);
}
