//! Petal command-line entry point.
//!
//! Binary name: `petal`
//!
//! Parses arguments, loads project settings, wires the filesystem-backed
//! stores and adapters, then dispatches to `compose`, `run`, `verify` or
//! `diff`.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.quiet { -1 } else { cli.verbose.min(i8::MAX as u8) as i8 };
    if let Err(e) = petal_observe::tracing_setup::init_tracing(
        petal_observe::tracing_setup::filter_for_verbosity(level),
        cli.otel,
    ) {
        eprintln!("warning: tracing setup failed: {e}");
    }

    let result = dispatch(cli).await;
    petal_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Compose(args) => {
            let state = AppState::init(&project_dir, None).await?;
            cli::compose::handle_compose(&state, &args).await
        }
        Commands::Run(args) => {
            let state = AppState::init(&project_dir, args.parallelism).await?;
            cli::run::handle_run(&state, &args, cli.quiet).await
        }
        Commands::Verify { lock, offline } => {
            let state = AppState::init(&project_dir, None).await?;
            cli::lock::handle_verify(&state, &lock, offline).await
        }
        Commands::Diff { old, new, json } => cli::lock::handle_diff(&old, &new, json).await,
    }
}
