//! sheetflow command-line runner.
//!
//! Binary name: `sflow`
//!
//! Parses arguments, installs tracing, then dispatches to the command
//! handlers in `cli`.

mod cli;

use clap::Parser;
use sheetflow_observe::TracingOptions;

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,sheetflow_core=debug,sheetflow::events=debug",
        _ => "trace",
    };
    sheetflow_observe::init_tracing_with(TracingOptions {
        enable_otel: cli.otel,
        json: cli.log_json,
        default_filter: filter.to_string(),
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let outcome = cli::dispatch(cli).await;
    sheetflow_observe::shutdown_tracing();
    outcome
}
