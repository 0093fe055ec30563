//! `sflow validate`: build a plan's workflow without touching a workbook.

use std::path::Path;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;
use tracing::Instrument;

use sheetflow_core::workflow::build_workflow;
use sheetflow_observe::attrs::SPAN_VALIDATE;
use sheetflow_types::config::EngineConfig;
use sheetflow_types::workflow::{ExecutionStrategy, Workflow};

use super::Output;
use super::plan::{Plan, load_plan};

/// Resource id used for targets when no workbook is given.
const PLAN_RESOURCE: &str = "plan";

pub async fn validate_plan(
    path: &Path,
    strategy: Option<ExecutionStrategy>,
    config: &EngineConfig,
    output: Output,
) -> Result<()> {
    let span = tracing::info_span!(SPAN_VALIDATE, plan = %path.display());
    async move {
        let plan = load_plan(path).await?;
        let workflow = check(&plan, strategy, config)?;
        print_levels(&workflow, output)
    }
    .instrument(span)
    .await
}

fn check(plan: &Plan, strategy: Option<ExecutionStrategy>, config: &EngineConfig) -> Result<Workflow> {
    let operations = plan.operations(PLAN_RESOURCE)?;
    Ok(build_workflow(operations, strategy.or(plan.strategy), config)?)
}

fn print_levels(workflow: &Workflow, output: Output) -> Result<()> {
    if output.json {
        let levels: Vec<Vec<&str>> = workflow
            .levels
            .iter()
            .map(|level| level.iter().map(|&i| workflow.operations[i].id.as_str()).collect())
            .collect();
        let body = json!({
            "valid": true,
            "strategy": workflow.strategy,
            "operations": workflow.operations.len(),
            "levels": levels,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }
    if output.quiet {
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Level").fg(Color::Cyan),
            Cell::new("Operation"),
            Cell::new("Kind"),
            Cell::new("Range"),
            Cell::new("Depends on"),
        ]);

    for (level, indices) in workflow.levels.iter().enumerate() {
        for &i in indices {
            let op = &workflow.operations[i];
            let depends = if op.depends_on.is_empty() {
                "-".to_string()
            } else {
                op.depends_on.join(", ")
            };
            table.add_row(vec![
                Cell::new(level),
                Cell::new(&op.id),
                Cell::new(op.kind.name()),
                Cell::new(op.target.range.to_string()),
                Cell::new(depends),
            ]);
        }
    }
    println!("{table}");
    println!(
        "{} {} operation(s) in {} level(s), {} strategy",
        style("*").green().bold(),
        workflow.operations.len(),
        workflow.levels.len(),
        style(workflow.strategy).cyan()
    );
    Ok(())
}
