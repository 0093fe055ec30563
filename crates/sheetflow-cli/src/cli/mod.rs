//! CLI command definitions for the `sflow` binary.
//!
//! Every command reads a plan file; `run` and `analyze` also load a workbook
//! (the JSON format written by `InMemoryWorkbook::save`).

pub mod analyze;
pub mod plan;
pub mod run;
pub mod validate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, Color};
use serde_json::Value;

use sheetflow_infra::{default_config_path, load_engine_config, load_engine_config_strict};
use sheetflow_types::config::EngineConfig;
use sheetflow_types::impact::ImpactSeverity;
use sheetflow_types::workflow::{ExecutionStrategy, OperationStatus};

/// Run coordinated spreadsheet workflows.
#[derive(Parser)]
#[command(name = "sflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine configuration file (default: ~/.sheetflow/config.toml).
    #[arg(long, global = true, env = "SHEETFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a plan against a workbook file.
    Run {
        /// Plan file (.yaml, .yml or .json).
        plan: PathBuf,

        /// Workbook JSON file.
        #[arg(long, short)]
        workbook: PathBuf,

        /// Override the plan's execution strategy.
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Context variable as NAME=VALUE (VALUE parsed as JSON, else string).
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,

        /// Leave the workbook file untouched.
        #[arg(long)]
        no_save: bool,
    },

    /// Assess the impact of every operation in a plan without running it.
    Analyze {
        plan: PathBuf,

        #[arg(long, short)]
        workbook: PathBuf,
    },

    /// Check a plan's dependency graph and print its execution levels.
    Validate {
        plan: PathBuf,

        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    Sequential,
    Parallel,
    Adaptive,
}

impl From<StrategyArg> for ExecutionStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Sequential => ExecutionStrategy::Sequential,
            StrategyArg::Parallel => ExecutionStrategy::Parallel,
            StrategyArg::Adaptive => ExecutionStrategy::Adaptive,
        }
    }
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    if name.is_empty() {
        return Err(format!("missing variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Resolve the engine configuration.
///
/// An explicit path must exist and be valid. The default location falls
/// back to built-in defaults when missing or malformed.
pub async fn load_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = explicit {
        return load_engine_config_strict(path)
            .await
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    Ok(match default_config_path() {
        Some(path) => load_engine_config(&path).await,
        None => EngineConfig::default(),
    })
}

/// Dispatch a parsed command.
pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref()).await?;
    let output = Output {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Run {
            plan,
            workbook,
            strategy,
            vars,
            no_save,
        } => {
            let args = run::RunArgs {
                plan,
                workbook,
                strategy: strategy.map(Into::into),
                vars,
                save: !no_save,
            };
            run::run_plan(args, config, output).await
        }
        Commands::Analyze { plan, workbook } => analyze::analyze_plan(&plan, &workbook, config, output).await,
        Commands::Validate { plan, strategy } => {
            validate::validate_plan(&plan, strategy.map(Into::into), &config, output).await
        }
    }
}

/// Output switches shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

pub(crate) fn status_cell(status: OperationStatus) -> Cell {
    let color = match status {
        OperationStatus::Succeeded => Color::Green,
        OperationStatus::Failed => Color::Red,
        OperationStatus::Skipped => Color::Yellow,
        OperationStatus::Cancelled => Color::DarkGrey,
        OperationStatus::RolledBack => Color::Magenta,
    };
    Cell::new(status).fg(color)
}

pub(crate) fn severity_cell(severity: ImpactSeverity) -> Cell {
    let color = match severity {
        ImpactSeverity::Low => Color::Green,
        ImpactSeverity::Medium => Color::Yellow,
        ImpactSeverity::High => Color::Red,
        ImpactSeverity::Critical => Color::Magenta,
    };
    Cell::new(severity).fg(color)
}
