//! execgate CLI entry point.
//!
//! Operator commands for inspecting rule databases, running a one-off
//! signature check and validating configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use execgate::config::AgentConfig;
use execgate::decision::path_policy::ApplicationDirectoryPolicy;
use execgate::decision::DecisionPolicy;
use execgate::rules::source::{source_from_config, LocalRuleSource, RuleSource};
use execgate::rules::{RuleDatabase, RuleDatabaseStatus};
use execgate::signature::codesign::CodesignOracle;
use execgate::signature::SignatureOracle;
use execgate::types::Verdict;

/// execgate: host binary-authorization agent.
#[derive(Parser)]
#[command(name = "execgate", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Rule database operations.
    Rules {
        /// Rule subcommand.
        #[command(subcommand)]
        command: RulesCommand,
    },
    /// Verify the code signature of a file or bundle.
    Signature {
        /// Path to check.
        path: PathBuf,
    },
    /// Configuration operations.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Rule database subcommands.
#[derive(Subcommand)]
enum RulesCommand {
    /// Parse a rule database file and report its status.
    Validate {
        /// JSON rule file.
        file: PathBuf,
    },
    /// Fetch rules once from the configured source.
    Fetch,
}

/// Configuration subcommands.
#[derive(Subcommand)]
enum ConfigCommand {
    /// Load the configuration and print the resolved policy.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    execgate::logging::init_cli();

    match cli.command {
        Command::Rules {
            command: RulesCommand::Validate { file },
        } => {
            let database = LocalRuleSource::new(&file)
                .fetch()
                .await
                .with_context(|| format!("failed to load {}", file.display()))?;
            Ok(report_rules(&database))
        }
        Command::Rules {
            command: RulesCommand::Fetch,
        } => handle_fetch().await,
        Command::Signature { path } => handle_signature(&path).await,
        Command::Config {
            command: ConfigCommand::Check,
        } => handle_config_check(),
    }
}

/// Print a rule database summary; non-zero exit when invalid.
fn report_rules(database: &RuleDatabase) -> ExitCode {
    println!("status: {:?}", database.status);
    println!("binary rules: {}", database.binary_rules.len());
    println!("certificate rules: {}", database.certificate_rules.len());
    if database.status == RuleDatabaseStatus::Invalid {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Run the configured rule source once.
async fn handle_fetch() -> anyhow::Result<ExitCode> {
    let config = AgentConfig::load().context("failed to load configuration")?;
    let Some(source) = source_from_config(&config.rules).context("invalid [rules] section")?
    else {
        println!("no rule source configured");
        return Ok(ExitCode::SUCCESS);
    };
    println!("source: {}", source.describe());
    let database = source.fetch().await.context("rule fetch failed")?;
    Ok(report_rules(&database))
}

/// Run the codesign oracle against a path.
async fn handle_signature(path: &std::path::Path) -> anyhow::Result<ExitCode> {
    let oracle = CodesignOracle::default();
    let verdict = Verdict::from(oracle.check(path).await);
    println!("{}: {verdict}", path.display());
    Ok(if verdict == Verdict::Valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Load configuration and print what the agent would enforce.
fn handle_config_check() -> anyhow::Result<ExitCode> {
    let config = AgentConfig::load().context("failed to load configuration")?;
    let policy = DecisionPolicy::from_config(&config.policy);
    let directories = ApplicationDirectoryPolicy::from_config(&config.policy);

    println!("mode: {:?}", policy.mode);
    println!("allow_unknown_programs: {}", policy.allow_unknown_programs);
    println!("allow_unsigned_programs: {}", policy.allow_unsigned_programs);
    println!("allow_invalid_programs: {}", policy.allow_invalid_programs);
    println!(
        "platform_binary_source: {:?}",
        config.policy.platform_binary_source
    );
    if directories.directories().is_empty() {
        println!("allowed_application_directories: (any)");
    } else {
        for dir in directories.directories() {
            println!("allowed_application_directory: {}", dir.display());
        }
        println!(
            "allow_misplaced_applications: {}",
            config.policy.allow_misplaced_applications
        );
    }
    println!(
        "max_request_age: {}s",
        config.endpoint.max_request_age().as_secs()
    );
    println!("rule source: {:?}", config.rules.source);

    source_from_config(&config.rules).context("invalid [rules] section")?;
    Ok(ExitCode::SUCCESS)
}
