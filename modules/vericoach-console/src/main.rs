use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vericoach_client::{
    upload_files, ChannelConfig, EventChannel, RunApi, RunSession, SessionConfig, SessionNotice,
    TracingSink, UploadFile,
};
use vericoach_common::{Config, RunTarget, StartOptions};
use vericoach_console::{render_page, render_report};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vericoach=info".parse()?))
        .init();

    info!("Verification coach starting...");

    let config = Config::from_env();

    let api = Arc::new(RunApi::new(
        config.backend_url.clone(),
        config.request_timeout,
    )?);

    if std::env::args().nth(1).as_deref() == Some("--list") {
        return list_runs(&api).await;
    }
    let args = CliArgs::parse(std::env::args().skip(1))?;
    let diag = Arc::new(TracingSink);
    let channel = EventChannel::new(
        ChannelConfig::new(config.channel_url.clone(), config.deployment),
        diag.clone(),
    );
    let session = RunSession::new(
        api.clone(),
        channel,
        SessionConfig {
            poll_interval: config.poll_interval,
            ..SessionConfig::default()
        },
        config.deployment,
        diag,
    );

    let target = resolve_target(&api, &args).await?;
    let spec_content = match args.spec.as_ref() {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };

    let run_id = session
        .start(
            target,
            spec_content,
            args.spec.as_ref().map(|p| p.display().to_string()),
            StartOptions {
                generate_patches: args.patches,
                watch: false,
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(run_id = %run_id, "Run started");

    let mut states = session.subscribe();
    let mut notices = session.subscribe_notices();
    let mut last_phase = session.snapshot().phase;

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if state.phase != last_phase {
                    info!(phase = state.phase.as_str(), "Run phase changed");
                    last_phase = state.phase;
                }
                if let Some(run) = state.run.as_ref() {
                    if let Some(phase) = run.current_phase.as_deref() {
                        info!(phase, progress = run.progress_percent, "Progress");
                    }
                }
                if state.phase.is_terminal() {
                    break;
                }
            }
            notice = notices.recv() => {
                match notice {
                    Ok(SessionNotice::StartFailed(msg)) => warn!(%msg, "Start failed"),
                    Ok(SessionNotice::CancelFailed(msg)) => warn!(%msg, "Cancel failed"),
                    Ok(SessionNotice::Connectivity(msg)) => warn!(%msg, "Connectivity"),
                    Err(_) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, cancelling run");
                session.cancel().await;
            }
        }
    }

    let state = session.snapshot();
    session.shutdown().await;

    info!(phase = state.phase.as_str(), "Run finished");
    if let Some(fatal) = state.fatal.as_deref() {
        warn!(fatal, "Run failed");
    }

    let report = render_report(&state);
    let title = format!("Run {run_id}");
    std::fs::write(&args.out, render_page(&title, &report))?;
    println!("Report written to {}", args.out.display());

    if let Some(consensus) = state.verdict.as_ref().and_then(|v| v.consensus.as_ref()) {
        println!(
            "\n=== Verdict: {} (score {:.2}) ===",
            consensus.overall_status, consensus.weighted_score
        );
        for judge in &consensus.judges {
            println!("  {} [{}]: {}", judge.role, judge.model, judge.status);
        }
    }

    Ok(())
}

async fn list_runs(api: &RunApi) -> Result<()> {
    let resp = api.list().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    if resp.runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in &resp.runs {
        let created = run
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<9}  {}  {}",
            run.run_id,
            run.status.as_str(),
            created,
            run.target.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

struct CliArgs {
    target: PathBuf,
    /// Treat the target as a backend-side repository path instead of
    /// uploading local files.
    repo: bool,
    spec: Option<PathBuf>,
    patches: bool,
    out: PathBuf,
}

impl CliArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut target = None;
        let mut repo = false;
        let mut spec = None;
        let mut patches = false;
        let mut out = PathBuf::from("report.html");

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--repo" => repo = true,
                "--patches" => patches = true,
                "--spec" => {
                    let value = args.next();
                    anyhow::ensure!(value.is_some(), "--spec requires a file path");
                    spec = value.map(PathBuf::from);
                }
                "--out" => {
                    let value = args.next();
                    anyhow::ensure!(value.is_some(), "--out requires a file path");
                    out = PathBuf::from(value.unwrap());
                }
                other => {
                    anyhow::ensure!(target.is_none(), "Unexpected argument: {other}");
                    target = Some(PathBuf::from(other));
                }
            }
        }

        let target = target
            .ok_or_else(|| anyhow::anyhow!("Usage: coach <path> [--repo] [--spec <file>] [--patches] [--out <file>]"))?;
        Ok(Self {
            target,
            repo,
            spec,
            patches,
            out,
        })
    }
}

/// Upload the local file set (or pass the repository path through) and
/// produce the target the run will verify.
async fn resolve_target(api: &RunApi, args: &CliArgs) -> Result<RunTarget> {
    if args.repo {
        return Ok(RunTarget::Repository {
            path: args.target.display().to_string(),
        });
    }

    let files = collect_files(&args.target)?;
    anyhow::ensure!(!files.is_empty(), "No files found under {}", args.target.display());
    info!(files = files.len(), "Uploading target");
    let outcome = upload_files(api, &files, |percent| {
        info!(percent, "Upload progress");
    })
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(RunTarget::Upload { path: outcome.path })
}

/// Recursively collect files under `root`, skipping hidden entries and
/// build output.
fn collect_files(root: &Path) -> Result<Vec<UploadFile>> {
    if root.is_file() {
        return Ok(vec![UploadFile {
            relative_path: root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            contents: std::fs::read(root)?,
        }]);
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name == "target" || name == "node_modules" {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else {
                let relative = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                files.push(UploadFile {
                    relative_path: relative,
                    contents: std::fs::read(&path)?,
                });
            }
        }
    }
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}
