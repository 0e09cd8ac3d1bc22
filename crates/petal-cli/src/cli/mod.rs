//! CLI command definitions for the `petal` binary.

pub mod compose;
pub mod lock;
pub mod run;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

/// Compile and run local-first workflows.
#[derive(Parser)]
#[command(name = "petal", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Suppress everything except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// More logging (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "PETAL_OTEL")]
    pub otel: bool,

    /// Project root: settings, document references, runs and cache live here.
    #[arg(short = 'C', long = "project", global = true, env = "PETAL_PROJECT")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a document into a lock artifact.
    Compose(ComposeArgs),

    /// Execute a document or lock artifact.
    Run(RunArgs),

    /// Check a lock artifact's hash, layering and source digests.
    Verify {
        /// Lock artifact to check.
        lock: PathBuf,

        /// Skip comparing recorded source digests against files on disk.
        #[arg(long)]
        offline: bool,
    },

    /// Compare two lock artifacts.
    Diff {
        old: PathBuf,
        new: PathBuf,

        /// Print the differences as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Inputs to compilation, shared by `compose` and `run`.
#[derive(Args, Debug, Clone, Default)]
pub struct CompileArgs {
    /// Overlay documents applied after the document's own, in order.
    #[arg(long = "overlay", value_name = "FILE")]
    pub overlays: Vec<PathBuf>,

    /// Profile to select.
    #[arg(long)]
    pub profile: Option<String>,

    /// Parameter override; the value is coerced to the declared type.
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,
}

#[derive(Args, Debug, Clone)]
pub struct ComposeArgs {
    /// Root document.
    pub document: PathBuf,

    #[command(flatten)]
    pub compile: CompileArgs,

    /// Write the lock artifact here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Root document to compile and run. Not needed with `--lock` or
    /// `--resume`.
    pub document: Option<PathBuf>,

    #[command(flatten)]
    pub compile: CompileArgs,

    /// Execute this lock artifact without recompiling.
    #[arg(long, conflicts_with = "document")]
    pub lock: Option<PathBuf>,

    /// Maximum steps dispatched concurrently.
    #[arg(long, env = "PETAL_PARALLELISM")]
    pub parallelism: Option<usize>,

    /// Print the run manifest without invoking any adapter.
    #[arg(long)]
    pub dry_run: bool,

    /// Continue a paused or failed run.
    #[arg(long, value_name = "RUN_ID")]
    pub resume: Option<uuid::Uuid>,

    /// Approve a gate awaiting approval (with `--resume`).
    #[arg(long, value_name = "STEP", requires = "resume")]
    pub approve: Vec<String>,

    /// Reject a gate awaiting approval (with `--resume`).
    #[arg(long, value_name = "STEP", requires = "resume")]
    pub reject: Vec<String>,

    /// Comment recorded with approvals and rejections.
    #[arg(long, requires = "resume")]
    pub comment: Option<String>,
}

/// `KEY=VALUE`. The value stays a string; the compiler coerces it.
fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    Ok((key.to_string(), Value::String(value.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("target=linux=x86").unwrap(),
            ("target".to_string(), Value::String("linux=x86".to_string()))
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=3").is_err());
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "petal", "run", "--resume", "0190f0a4-7f5e-7c3a-9d2e-1b2c3d4e5f60", "--approve", "review",
            "--comment", "ok", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.approve, vec!["review".to_string()]);
        assert!(args.document.is_none());

        assert!(Cli::try_parse_from(["petal", "run", "--approve", "x"]).is_err());
        assert!(Cli::try_parse_from(["petal", "run", "a.yaml", "--lock", "l.json"]).is_err());
    }
}
