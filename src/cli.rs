use crate::config::types::{RunnerConfig, StartMethod};
use crate::package::{self, CheckPackage};
use crate::runner::launcher;
use crate::runner::result::{CheckResult, CheckStatus};
use crate::runner::scheduler::Runner;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Internal role selector (hidden; used by spawn-style check children)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a check package against submitted files
    Run {
        /// Declarative check package (JSON document)
        #[arg(long)]
        checks: Option<PathBuf>,
        /// Name of a linked native package loader
        #[arg(long)]
        package: Option<String>,
        /// Child start method
        #[arg(long, default_value = "fork")]
        start_method: StartMethod,
        /// Upper bound on concurrently running checks
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Include logs of passing checks in the output
        #[arg(long)]
        log: bool,
        /// Submitted files
        files: Vec<PathBuf>,
    },
    /// List the checks a package registers, in display order
    List {
        /// Declarative check package (JSON document)
        #[arg(long)]
        checks: Option<PathBuf>,
        /// Name of a linked native package loader
        #[arg(long)]
        package: Option<String>,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(role) = cli.internal_role.as_deref() {
        if role != "check" {
            return Err(anyhow::anyhow!("unsupported internal role: {role}"));
        }
        launcher::child_role_main()?;
        return Ok(());
    }

    let command = cli.command.ok_or_else(|| anyhow::anyhow!("missing command"))?;
    match command {
        Commands::Run {
            checks,
            package,
            start_method,
            max_parallel,
            log,
            files,
        } => {
            let package = load_package(checks, package)?;
            let config = RunnerConfig {
                start_method,
                max_parallel,
            };
            let results = Runner::new(package, config).run(&files)?;
            let rendered = with_log_policy(results, log);
            println!("{}", serde_json::to_string_pretty(&rendered)?);
            Ok(())
        }
        Commands::List { checks, package } => {
            let package = load_package(checks, package)?;
            for def in package.registry().iter() {
                println!("{}\t{}", def.name, def.description);
            }
            Ok(())
        }
    }
}

fn load_package(checks: Option<PathBuf>, name: Option<String>) -> Result<CheckPackage> {
    match (checks, name) {
        (Some(path), None) => Ok(package::load_declarative(&path)?),
        (None, Some(name)) => Ok(package::load_registered(&name)?),
        _ => Err(anyhow::anyhow!(
            "specify exactly one of --checks or --package"
        )),
    }
}

/// Logs are collected even on Pass, but only surfaced with --log.
fn with_log_policy(mut results: Vec<CheckResult>, keep_pass_logs: bool) -> Vec<CheckResult> {
    if !keep_pass_logs {
        for result in &mut results {
            if result.status == CheckStatus::Pass {
                result.log.clear();
            }
        }
    }
    results
}

/// clap needs the typed start-method argument to parse from its flag.
impl clap::builder::ValueParserFactory for StartMethod {
    type Parser = clap::builder::ValueParser;

    fn value_parser() -> Self::Parser {
        clap::builder::ValueParser::new(|s: &str| s.parse::<StartMethod>())
    }
}
