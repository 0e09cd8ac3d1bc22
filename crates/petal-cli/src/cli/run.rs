//! `petal run`: execute a document or lock artifact, or resume a run.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use petal_core::lock::{load_lock, to_pretty_json};
use petal_core::store::RunStore;
use petal_types::lock::LockFile;
use petal_types::run::{Approval, Event, EventKind, RunManifest, RunStatus};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::RunArgs;
use super::compose::compile_document;
use crate::state::AppState;

/// Copy of the executed plan kept next to the run's state, used by resume.
const RUN_LOCK_FILE: &str = "lock.json";

pub async fn handle_run(state: &AppState, args: &RunArgs, quiet: bool) -> Result<ExitCode> {
    Ok(match execute(state, args, quiet).await? {
        None | Some(RunStatus::Succeeded) => ExitCode::SUCCESS,
        Some(RunStatus::Paused) => ExitCode::from(2),
        Some(RunStatus::Failed | RunStatus::Cancelled) => ExitCode::FAILURE,
    })
}

/// Final run status, or `None` for a dry run.
async fn execute(state: &AppState, args: &RunArgs, quiet: bool) -> Result<Option<RunStatus>> {
    let lock = match (&args.lock, &args.document, args.resume) {
        (Some(path), _, _) => read_lock(path).await?,
        (None, Some(document), _) => compile_document(state, document, &args.compile)?,
        (None, None, Some(run_id)) => {
            read_lock(&state.engine.store().run_dir(run_id).join(RUN_LOCK_FILE)).await?
        }
        (None, None, None) => bail!("nothing to run: pass a document, --lock or --resume"),
    };

    if args.dry_run {
        let options = state.run_options();
        let manifest = state.engine.dry_run(&lock, &options.env);
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(None);
    }

    let mut options = state.run_options();
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling...");
            cancel.cancel();
        }
    });

    let mut events = state.engine.events().subscribe();
    let outcome = match args.resume {
        Some(run_id) => {
            let snapshot = state
                .engine
                .store()
                .load_snapshot(run_id)
                .await?
                .with_context(|| format!("no saved state for run {run_id}"))?;
            let approvals = approvals(args);
            let run = state.engine.resume(&lock, snapshot, &approvals, options);
            follow(run, &mut events, quiet).await?
        }
        None => {
            let run_id = Uuid::now_v7();
            options.run_id = Some(run_id);
            save_run_lock(&state.engine.store().run_dir(run_id), &lock).await?;
            let run = state.engine.run(&lock, options);
            follow(run, &mut events, quiet).await?
        }
    };

    if !quiet {
        print_summary(&outcome.manifest);
    }
    Ok(Some(outcome.status))
}

async fn read_lock(path: &Path) -> Result<LockFile> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read lock artifact {}", path.display()))?;
    load_lock(&text).with_context(|| format!("invalid lock artifact {}", path.display()))
}

async fn save_run_lock(run_dir: &Path, lock: &LockFile) -> Result<()> {
    tokio::fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;
    tokio::fs::write(run_dir.join(RUN_LOCK_FILE), to_pretty_json(lock)?)
        .await
        .with_context(|| format!("failed to write lock into {}", run_dir.display()))?;
    Ok(())
}

fn approvals(args: &RunArgs) -> Vec<Approval> {
    let decisions = args
        .approve
        .iter()
        .map(|id| (id, true))
        .chain(args.reject.iter().map(|id| (id, false)));
    decisions
        .map(|(step_id, approved)| Approval {
            step_id: step_id.clone(),
            approved,
            comment: args.comment.clone(),
        })
        .collect()
}

/// Drive the run while printing its events to stderr.
async fn follow<F, T, E>(run: F, events: &mut broadcast::Receiver<Event>, quiet: bool) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::pin!(run);
    loop {
        tokio::select! {
            biased;
            outcome = &mut run => {
                while let Ok(event) = events.try_recv() {
                    print_event(&event, quiet);
                }
                return Ok(outcome?);
            }
            received = events.recv() => match received {
                Ok(event) => print_event(&event, quiet),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(run.await?),
            },
        }
    }
}

fn print_event(event: &Event, quiet: bool) {
    if quiet {
        return;
    }
    if let Some(line) = describe(event) {
        eprintln!("{line}");
    }
}

fn describe(event: &Event) -> Option<String> {
    let step = event.step_id.as_deref().unwrap_or("-");
    let line = match event.event_kind {
        EventKind::RunStarted => format!("run {} started", event.run_id),
        EventKind::RunFinished => return None,
        EventKind::StepStarted => format!("  {step}: started (attempt {})", event.attempt),
        EventKind::StepFinished => {
            let status = event.status.map(|s| s.to_string()).unwrap_or_else(|| "finished".to_string());
            let took = event.duration_ms.map(|ms| format!(" in {ms}ms")).unwrap_or_default();
            match &event.error {
                Some(error) => format!("  {step}: {status}{took}: {error}"),
                None => format!("  {step}: {status}{took}"),
            }
        }
        EventKind::StepSkipped => format!("  {step}: skipped"),
        EventKind::StepRetrying => format!(
            "  {step}: retrying after attempt {}: {}",
            event.attempt,
            event.error.as_deref().unwrap_or("failed")
        ),
        EventKind::CacheHit => format!("  {step}: cache hit"),
        EventKind::AwaitingApproval => format!("  {step}: awaiting approval"),
        EventKind::Error => format!("  {step}: error: {}", event.error.as_deref().unwrap_or("unknown")),
    };
    Some(line)
}

fn print_summary(manifest: &RunManifest) {
    println!("run {} {}", manifest.run_id, manifest.status);
    for step in &manifest.steps {
        let cached = if step.cache_hit { " (cached)" } else { "" };
        println!("  {:<24} {}{cached}", step.id, step.status);
    }
    if manifest.status == RunStatus::Paused {
        println!(
            "resume with: petal run --resume {} --approve <step> | --reject <step>",
            manifest.run_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CompileArgs;
    use tempfile::TempDir;

    fn args(document: Option<&Path>) -> RunArgs {
        RunArgs {
            document: document.map(Path::to_path_buf),
            compile: CompileArgs::default(),
            lock: None,
            parallelism: None,
            dry_run: false,
            resume: None,
            approve: Vec::new(),
            reject: Vec::new(),
            comment: None,
        }
    }

    const GATED: &str = r#"
petal: "1"
name: release
steps:
  - {id: build, uses: eval, with: {expr: "2 * 21"}}
  - {id: review, uses: human, needs: [build], with: {prompt: "ship it?"}}
  - {id: ship, uses: eval, needs: [review], with: {expr: "1"}}
"#;

    #[tokio::test]
    async fn test_gate_pauses_then_resumes_from_saved_lock() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("release.yaml"), GATED).await.unwrap();
        let state = AppState::init(dir.path(), Some(2)).await.unwrap();

        let status = execute(&state, &args(Some(&dir.path().join("release.yaml"))), true).await.unwrap();
        assert_eq!(status, Some(RunStatus::Paused));

        let runs: Vec<_> = std::fs::read_dir(state.engine.store().root()).unwrap().collect();
        assert_eq!(runs.len(), 1);
        let run_id: Uuid = runs[0].as_ref().unwrap().file_name().to_string_lossy().parse().unwrap();

        let mut resume = args(None);
        resume.resume = Some(run_id);
        resume.approve = vec!["review".to_string()];
        let status = execute(&state, &resume, true).await.unwrap();
        assert_eq!(status, Some(RunStatus::Succeeded));

        let snapshot = state.engine.store().load_snapshot(run_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert_eq!(snapshot.records["build"].outputs["result"], serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_dry_run_invokes_nothing() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("release.yaml"), GATED).await.unwrap();
        let state = AppState::init(dir.path(), None).await.unwrap();

        let mut dry = args(Some(&dir.path().join("release.yaml")));
        dry.dry_run = true;
        assert_eq!(execute(&state, &dry, true).await.unwrap(), None);
        assert!(!state.engine.store().root().exists());
    }

    #[tokio::test]
    async fn test_nothing_to_run() {
        let dir = TempDir::new().unwrap();
        let state = AppState::init(dir.path(), None).await.unwrap();
        assert!(execute(&state, &args(None), true).await.is_err());
    }

    #[test]
    fn test_approvals_share_comment() {
        let mut a = args(None);
        a.approve = vec!["qa".to_string()];
        a.reject = vec!["prod".to_string()];
        a.comment = Some("see ticket".to_string());
        let got = approvals(&a);
        assert_eq!(got.len(), 2);
        assert!(got[0].approved && !got[1].approved);
        assert_eq!(got[1].comment.as_deref(), Some("see ticket"));
    }

    #[test]
    fn test_describe_retry_event() {
        let event = Event::for_step(EventKind::StepRetrying, Uuid::nil(), "fetch")
            .attempt(2)
            .error("exited with status 1");
        assert_eq!(
            describe(&event).unwrap(),
            "  fetch: retrying after attempt 2: exited with status 1"
        );
        assert!(describe(&Event::new(EventKind::RunFinished, Uuid::nil())).is_none());
    }
}
