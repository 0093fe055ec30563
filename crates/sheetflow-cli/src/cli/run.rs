//! `sflow run`: execute a plan against a workbook file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Value, json};
use tracing::Instrument;

use sheetflow_core::Engine;
use sheetflow_infra::{InMemoryWorkbook, TracingSink};
use sheetflow_observe::attrs::SPAN_RUN;
use sheetflow_types::config::EngineConfig;
use sheetflow_types::workflow::{ExecutionStrategy, OperationOutcome, WorkflowExecutionResult};

use super::plan::load_plan;
use super::{Output, severity_cell, status_cell};

pub struct RunArgs {
    pub plan: PathBuf,
    pub workbook: PathBuf,
    /// Takes precedence over the plan's strategy.
    pub strategy: Option<ExecutionStrategy>,
    /// Merged over the plan's variables.
    pub vars: Vec<(String, Value)>,
    pub save: bool,
}

pub async fn run_plan(args: RunArgs, config: EngineConfig, output: Output) -> Result<()> {
    let span = tracing::info_span!(SPAN_RUN, plan = %args.plan.display());
    async move {
        let plan = load_plan(&args.plan).await?;
        let workbook = InMemoryWorkbook::load(&args.workbook).await?;
        let operations = plan.operations(workbook.resource_id())?;
        let strategy = args.strategy.or(plan.strategy);

        let mut variables: HashMap<String, Value> = plan.variables;
        variables.extend(args.vars);

        let engine = Engine::with_sink(
            workbook.clone(),
            workbook.clone(),
            config,
            Arc::new(TracingSink::new()),
        )?;
        let handle = engine.submit_workflow_with_context(operations, strategy, None, variables)?;

        if !output.quiet && !output.json {
            println!(
                "{} Running workflow {} ({})",
                style("*").green().bold(),
                style(handle).cyan(),
                style(strategy.unwrap_or_default()).dim()
            );
        }

        let watcher = {
            let engine = engine.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("{} cancelling, waiting for running operations", style("!").yellow().bold());
                    if let Err(err) = engine.cancel_workflow(handle) {
                        tracing::debug!(error = %err, "cancel after completion");
                    }
                }
            })
        };
        let finished = engine.await_result(handle).await;
        watcher.abort();

        // The workbook reflects whatever was applied, including compensation.
        if args.save {
            workbook
                .save(&args.workbook)
                .await
                .with_context(|| format!("failed to save {}", args.workbook.display()))?;
        }

        match finished {
            Ok(result) => {
                print_result(&result, None, output)?;
                if !result.success {
                    let failed = result.errors.len().max(1);
                    bail!("workflow finished with {failed} error(s)");
                }
                Ok(())
            }
            Err(err) => {
                if let Some(partial) = err.partial_result() {
                    print_result(partial, Some(&err.to_string()), output)?;
                }
                Err(err.into())
            }
        }
    }
    .instrument(span)
    .await
}

fn print_result(result: &WorkflowExecutionResult, error: Option<&str>, output: Output) -> Result<()> {
    if output.json {
        let body = match error {
            Some(error) => json!({ "error": error, "partial": result }),
            None => serde_json::to_value(result)?,
        };
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
            Cell::new("Operation").fg(Color::Cyan),
            Cell::new("Level"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Impact"),
            Cell::new("Detail"),
        ]);

    for outcome in &result.outcomes {
        table.add_row(vec![
            Cell::new(&outcome.operation_id),
            Cell::new(outcome.level),
            status_cell(outcome.status),
            Cell::new(outcome.attempts),
            outcome.impact.map(severity_cell).unwrap_or_else(|| Cell::new("-")),
            Cell::new(detail(outcome)),
        ]);
    }
    println!("{table}");

    let summary = format!(
        "{} level(s), {} of {} succeeded in {} ms",
        result.levels_executed,
        result.succeeded().count(),
        result.outcomes.len(),
        result.duration_ms
    );
    if result.success {
        println!("{} {summary}", style("*").green().bold());
    } else {
        println!("{} {summary}", style("x").red().bold());
    }
    if result.cancelled {
        println!("  {}", style("cancelled before completion").yellow());
    }
    if let Some(error) = error {
        println!("  Error: {}", style(error).red());
    }
    for err in &result.errors {
        println!("  {}", style(err).red());
    }
    Ok(())
}

/// Short per-operation note: the error, or a hint about the output.
fn detail(outcome: &OperationOutcome) -> String {
    if let Some(error) = &outcome.error {
        return error.clone();
    }
    let mut notes = Vec::new();
    if outcome.from_cache {
        notes.push("cached".to_string());
    }
    if !outcome.retries.is_empty() {
        notes.push(format!("{} retr(y/ies)", outcome.retries.len()));
    }
    if let Some(cells) = outcome.output.as_ref().and_then(|out| out.get("updated_cells")) {
        notes.push(format!("{cells} cell(s) updated"));
    }
    notes.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sheetflow_infra::WorkbookData;
    use std::collections::BTreeMap;

    async fn fixture(dir: &std::path::Path, plan: &str) -> (PathBuf, PathBuf) {
        let mut sheets = BTreeMap::new();
        sheets.insert("Q1".to_string(), vec![vec![json!(1), json!(2)]]);
        sheets.insert("Out".to_string(), Vec::new());
        let data = WorkbookData {
            resource_id: "budget".into(),
            sheets,
            artifacts: Vec::new(),
        };
        let book = dir.join("book.json");
        InMemoryWorkbook::from_data(data).save(&book).await.unwrap();
        let plan_path = dir.join("plan.yaml");
        tokio::fs::write(&plan_path, plan).await.unwrap();
        (plan_path, book)
    }

    const COPY_PLAN: &str = r#"
operations:
  - id: read
    type: read_range
    range: Q1!A1:B1
  - id: copy
    type: write_range
    range: Out!A1:B1
    depends_on: [read]
    bindings:
      - { field: values, key: read.values }
"#;

    fn quiet() -> Output {
        Output { json: false, quiet: true }
    }

    #[tokio::test]
    async fn run_copies_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let (plan, book) = fixture(dir.path(), COPY_PLAN).await;

        let args = RunArgs {
            plan,
            workbook: book.clone(),
            strategy: None,
            vars: Vec::new(),
            save: true,
        };
        run_plan(args, EngineConfig::default(), quiet()).await.unwrap();

        let saved = InMemoryWorkbook::load(&book).await.unwrap();
        let out = saved.key("Out!A1:B1").unwrap();
        assert_eq!(saved.values(&out), Some(vec![vec![json!(1), json!(2)]]));
    }

    #[tokio::test]
    async fn no_save_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (plan, book) = fixture(dir.path(), COPY_PLAN).await;
        let before = tokio::fs::read_to_string(&book).await.unwrap();

        let args = RunArgs {
            plan,
            workbook: book.clone(),
            strategy: Some(ExecutionStrategy::Sequential),
            vars: Vec::new(),
            save: false,
        };
        run_plan(args, EngineConfig::default(), quiet()).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&book).await.unwrap(), before);
    }

    #[tokio::test]
    async fn unresolved_binding_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let plan = r#"
operations:
  - id: w
    type: write_range
    range: Out!A1
    bindings:
      - { field: values, key: nowhere }
"#;
        let (plan, book) = fixture(dir.path(), plan).await;
        let args = RunArgs {
            plan,
            workbook: book,
            strategy: None,
            vars: Vec::new(),
            save: false,
        };
        assert!(run_plan(args, EngineConfig::default(), quiet()).await.is_err());
    }

    #[test]
    fn detail_prefers_error() {
        let mut outcome = OperationOutcome::cancelled("x", 0, "upstream failed");
        assert_eq!(detail(&outcome), "upstream failed");
        outcome.error = None;
        outcome.from_cache = true;
        outcome.output = Some(json!({ "updated_cells": 4 }));
        assert_eq!(detail(&outcome), "cached, 4 cell(s) updated");
    }
}
