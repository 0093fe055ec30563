//! `sflow analyze`: impact reports for every operation in a plan.

use std::path::Path;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tracing::Instrument;

use sheetflow_core::Engine;
use sheetflow_infra::InMemoryWorkbook;
use sheetflow_observe::attrs::SPAN_ANALYZE;
use sheetflow_types::config::EngineConfig;
use sheetflow_types::impact::{ImpactReport, ImpactSeverity};

use super::plan::load_plan;
use super::{Output, severity_cell};

pub async fn analyze_plan(plan: &Path, workbook: &Path, config: EngineConfig, output: Output) -> Result<()> {
    let span = tracing::info_span!(SPAN_ANALYZE, plan = %plan.display());
    async move {
        let reports = collect_reports(plan, workbook, config).await?;
        print_reports(&reports, output)
    }
    .instrument(span)
    .await
}

async fn collect_reports(plan: &Path, workbook: &Path, config: EngineConfig) -> Result<Vec<ImpactReport>> {
    let plan = load_plan(plan).await?;
    let workbook = InMemoryWorkbook::load(workbook).await?;
    let operations = plan.operations(workbook.resource_id())?;
    let engine = Engine::new(workbook.clone(), workbook, config)?;

    let mut reports = Vec::with_capacity(operations.len());
    for op in &operations {
        reports.push(engine.analyze_impact(op).await);
    }
    Ok(reports)
}

fn print_reports(reports: &[ImpactReport], output: Output) -> Result<()> {
    if output.json {
        println!("{}", serde_json::to_string_pretty(reports)?);
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
            Cell::new("Kind"),
            Cell::new("Target"),
            Cell::new("Cells"),
            Cell::new("Dependents"),
            Cell::new("Est. ms"),
            Cell::new("Severity"),
        ]);

    for report in reports {
        let severity = if report.requires_confirmation {
            severity_cell(report.severity).add_attribute(comfy_table::Attribute::Bold)
        } else {
            severity_cell(report.severity)
        };
        table.add_row(vec![
            Cell::new(&report.operation_id),
            Cell::new(&report.operation_kind),
            Cell::new(report.target.range.to_string()),
            Cell::new(report.cells),
            Cell::new(report.dependents.len()),
            Cell::new(report.estimated_duration_ms),
            severity,
        ]);
    }
    println!("{table}");

    for report in reports {
        if report.warnings.is_empty() && report.recommendations.is_empty() {
            continue;
        }
        println!();
        println!("{}", style(&report.operation_id).bold());
        for warning in &report.warnings {
            println!("  {} {warning}", style("!").yellow());
        }
        for recommendation in &report.recommendations {
            println!("  {} {recommendation}", style("-").dim());
        }
    }

    let gated: Vec<&str> = reports
        .iter()
        .filter(|r| r.requires_confirmation)
        .map(|r| r.operation_id.as_str())
        .collect();
    if !gated.is_empty() {
        println!();
        println!(
            "{} needs `confirmed: true` to run: {}",
            style(ImpactSeverity::Critical).magenta().bold(),
            gated.join(", ")
        );
    }
    Ok(())
}
