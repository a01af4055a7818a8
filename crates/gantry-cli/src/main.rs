//! Gantry CLI entry point.
//!
//! Binary name: `gantry`
//!
//! Parses CLI arguments, initializes tracing, wires the engine against the
//! SQLite store in the data directory, then dispatches to a command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use gantry_observe::{TracingOptions, init_tracing, shutdown_tracing};

use cli::workflow::Output;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut tracing_options = TracingOptions::from_verbosity(cli.verbose);
    if cli.quiet && cli.verbose == 0 {
        tracing_options.default_filter = "error".to_string();
    }
    tracing_options.json = cli.json;
    tracing_options.otel = cli.otel;
    init_tracing(&tracing_options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let out = Output {
        json: cli.json,
        quiet: cli.quiet,
    };

    // Commands that never touch the database.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "gantry", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::workflow::validate(file, out),
        Commands::Plan { file } => return cli::workflow::plan(file, out),
        _ => {}
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Run { file, inputs } => cli::workflow::run(&state, &file, &inputs, out).await,
        Commands::Resume { run_id, file } => {
            cli::workflow::resume(&state, &run_id, &file, out).await
        }
        Commands::Cancel { run_id } => cli::workflow::cancel(&state, &run_id, out).await,
        Commands::Status { target, limit } => {
            cli::status::status(&state, target.as_deref(), limit, out).await
        }
        Commands::Checkpoints { run_id } => cli::status::checkpoints(&state, &run_id, out).await,
        Commands::Completions { .. } | Commands::Validate { .. } | Commands::Plan { .. } => {
            Ok(())
        }
    }
}
