use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use pve_core::{IssueId, IssueStatus, ProposalId, ResolutionMethod, RuleFilter, RuleType};
use pve_engine::{load_configuration_file, load_entitlements_file, IssueTransition, Runner};
use pve_license::{EntitlementLookup, InMemoryEntitlements};

#[derive(Parser)]
#[command(name = "pve", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the current directory (creates .pve/, config, db)
    Init,

    /// Check configuration and report rule definitions that fail to load
    Doctor,

    #[command(subcommand)]
    Rules(RulesCommand),

    #[command(subcommand)]
    Config(ConfigCommand),

    /// Validate a configuration file without persisting anything
    Validate {
        file: PathBuf,
        /// YAML list of entitlements held by the proposal
        #[arg(long)]
        entitlements: Option<PathBuf>,
    },

    /// Validate a stored configuration and record issues plus an audit entry
    Workflow {
        proposal: String,
        #[arg(long, default_value = "cli")]
        triggered_by: String,
        #[arg(long)]
        entitlements: Option<PathBuf>,
    },

    #[command(subcommand)]
    Issues(IssuesCommand),
}

#[derive(Subcommand)]
enum RulesCommand {
    /// List rules in the current snapshot
    List {
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_parser = parse_rule_type)]
        rule_type: Option<RuleType>,
        #[arg(long)]
        active: Option<bool>,
    },
    /// Store rule definitions from a YAML list and refresh the snapshot
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Store a product configuration for later workflow runs
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum IssuesCommand {
    List {
        entity: String,
        #[arg(long, value_parser = parse_issue_status)]
        status: Option<IssueStatus>,
    },
    Resolve {
        id: String,
        #[arg(long, default_value = "manual", value_parser = parse_resolution_method)]
        method: ResolutionMethod,
        #[arg(long)]
        by: String,
    },
    Ignore {
        id: String,
        #[arg(long)]
        by: String,
    },
    FalsePositive {
        id: String,
        #[arg(long)]
        by: String,
    },
}

fn parse_rule_type(s: &str) -> Result<RuleType, String> {
    RuleType::parse(s).ok_or_else(|| format!("unknown rule type: {s}"))
}

fn parse_issue_status(s: &str) -> Result<IssueStatus, String> {
    IssueStatus::parse(s).ok_or_else(|| format!("unknown issue status: {s}"))
}

fn parse_resolution_method(s: &str) -> Result<ResolutionMethod, String> {
    ResolutionMethod::parse(s).ok_or_else(|| format!("unknown resolution method: {s}"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn entitlements(path: Option<&Path>) -> anyhow::Result<Arc<dyn EntitlementLookup>> {
    let held = match path {
        Some(p) => load_entitlements_file(p)?,
        None => vec![],
    };
    Ok(Arc::new(InMemoryEntitlements::shared(held)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = std::env::current_dir()?;

    match cli.cmd {
        Command::Init => {
            Runner::init_repo(&root)?;
            eprintln!("Initialized pve in {}", root.display());
        }
        Command::Doctor => {
            let r = Runner::open(root, entitlements(None)?)?;
            print_json(&r.doctor()?)?;
        }
        Command::Rules(RulesCommand::List {
            category,
            rule_type,
            active,
        }) => {
            let r = Runner::open(root, entitlements(None)?)?;
            let filter = RuleFilter {
                category,
                rule_type,
                is_active: active,
            };
            print_json(&r.engine.list_rules(&filter))?;
        }
        Command::Rules(RulesCommand::Import { file }) => {
            let r = Runner::open(root, entitlements(None)?)?;
            let snap = r.import_rules(&file)?;
            print_json(&serde_json::json!({
                "version": snap.version,
                "rules": snap.len(),
                "rejected": snap.rejected,
                "digest": snap.digest,
            }))?;
        }
        Command::Config(ConfigCommand::Import { file }) => {
            let r = Runner::open(root, entitlements(None)?)?;
            let config = r.import_configuration(&file)?;
            print_json(&serde_json::json!({
                "proposal_id": config.proposal_id,
                "products": config.products.len(),
                "relationships": config.relationships.len(),
            }))?;
        }
        Command::Validate { file, entitlements: held } => {
            let r = Runner::open(root, entitlements(held.as_deref())?)?;
            let config = load_configuration_file(&file)?;
            print_json(&r.engine.validate_product_configuration(&config).await?)?;
        }
        Command::Workflow {
            proposal,
            triggered_by,
            entitlements: held,
        } => {
            let r = Runner::open(root, entitlements(held.as_deref())?)?;
            let result = r
                .engine
                .execute_validation_workflow(&ProposalId::from_str(proposal), &triggered_by)
                .await?;
            print_json(&result)?;
            if result.persistence_pending {
                // give the background retry a chance before the runtime shuts down
                tokio::time::sleep(r.cfg.write_timeout()).await;
            }
        }
        Command::Issues(cmd) => {
            let r = Runner::open(root, entitlements(None)?)?;
            let tracker = r.engine.issues();
            match cmd {
                IssuesCommand::List { entity, status } => print_json(&tracker.list(&entity, status)?)?,
                IssuesCommand::Resolve { id, method, by } => {
                    print_json(&tracker.resolve(&IssueId::from_str(id), method, &by)?)?
                }
                IssuesCommand::Ignore { id, by } => {
                    print_json(&tracker.transition(&IssueId::from_str(id), IssueTransition::Ignore, &by)?)?
                }
                IssuesCommand::FalsePositive { id, by } => {
                    print_json(&tracker.transition(&IssueId::from_str(id), IssueTransition::FalsePositive, &by)?)?
                }
            }
        }
    }

    Ok(())
}
