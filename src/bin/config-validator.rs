//! # ClusterOps Configuration Validator
//!
//! Command-line tool for validating orchestrator configuration and role
//! command order documents before starting the server.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clusterops_core::config::ConfigManager;
use clusterops_core::ordering::{RoleCommandOrderResolver, RoleOrderingRules};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate ClusterOps orchestrator configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment overlay to apply (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load, merge and validate the configuration (default)
    Validate,

    /// Print the merged configuration as JSON, secrets masked
    Show,

    /// Check a role command order document for cycles
    RoleOrder {
        /// Document to check; defaults to `ordering.rules_file`
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Optional sections to activate on top of the general dependencies
        #[arg(short, long)]
        section: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run(cli) {
        error!("{err:#}");
        eprintln!("❌ {err:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let manager = ConfigManager::load_from_directory_with_env(cli.config_dir, &cli.environment)
        .with_context(|| format!("configuration for '{}' is invalid", cli.environment))?;

    match cli.command.unwrap_or(Commands::Validate) {
        Commands::Validate => {
            let rules = manager
                .load_role_order_rules()
                .context("role command order document is invalid")?;
            check_rules(&rules)?;
            println!(
                "✅ Configuration for '{}' is valid ({} role order rules)",
                manager.environment(),
                rules.rules().len()
            );
        }
        Commands::Show => {
            let json = serde_json::to_string_pretty(&manager.debug_config())?;
            println!("{json}");
        }
        Commands::RoleOrder { file, section } => {
            let rules = match file {
                Some(path) => {
                    let document = std::fs::read_to_string(&path)
                        .with_context(|| format!("cannot read {}", path.display()))?;
                    let sections: Vec<&str> = section.iter().map(String::as_str).collect();
                    RoleOrderingRules::from_json_str(&document, &sections)
                        .with_context(|| format!("cannot parse {}", path.display()))?
                }
                None => manager.load_role_order_rules()?,
            };
            check_rules(&rules)?;
            println!("✅ {} rules, no cycles", rules.rules().len());
        }
    }
    Ok(())
}

/// Resolve every declared pair at once so any cycle in the document shows up.
fn check_rules(rules: &RoleOrderingRules) -> Result<()> {
    let order = RoleCommandOrderResolver::resolve(rules.pairs(), rules)
        .context("role command order contains a cycle")?;
    info!(pairs = order.pairs().len(), "Role command order resolved");
    Ok(())
}
