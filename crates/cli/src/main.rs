//! CLI entry point for the subclip render queue
//!
//! Loads the configuration, queues the jobs from a JSON file and drains
//! them once, or serves the queue over HTTP with `--serve`.

use clap::{Parser, ValueEnum};
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use subclip_render::{
    check_stabilizer_available, locate_stabilizer, new_shared_status, run_status_server, AppState,
    Config, DrainError, DrainOptions, DrainSummary, Enqueued, FfprobeProbe, OverwriteDecision,
    ProcessSupervisor, QueueDrainer, RenderQueue, RenderRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// How to answer the overwrite question for existing outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OverwriteMode {
    /// Prompt on the terminal
    Ask,
    Yes,
    No,
}

/// Subclip Render - stabilize queued subclips through an external renderer
#[derive(Parser, Debug)]
#[command(name = "subclip-render")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// JSON file with an array of render requests to queue
    #[arg(short, long)]
    jobs: Option<PathBuf>,

    /// Answer for outputs that already exist
    #[arg(long, value_enum, default_value_t = OverwriteMode::Ask)]
    overwrite: OverwriteMode,

    /// Serve the queue over HTTP on this address instead of draining once
    #[arg(long, value_name = "ADDR")]
    serve: Option<SocketAddr>,

    /// Skip the stabilizer preflight check. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Debug-level logging, including stabilizer output
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose))
        .init();
}

fn load_config(path: &Path) -> Result<Config, String> {
    if path.exists() {
        Config::load(path).map_err(|e| format!("{}: {}", path.display(), e))
    } else {
        info!(path = %path.display(), "no config file, using defaults");
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

fn read_requests(path: &Path) -> Result<Vec<RenderRequest>, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Ask once on the terminal; anything unrecognized cancels.
fn prompt_overwrite(conflicts: &[PathBuf]) -> OverwriteDecision {
    println!("These outputs already exist:");
    for path in conflicts {
        println!("  {}", path.display());
    }
    print!("Overwrite them? [y]es / [n]o / [c]ancel: ");
    let _ = io::stdout().flush();

    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return OverwriteDecision::Cancel;
    }
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => OverwriteDecision::Yes,
        "n" | "no" => OverwriteDecision::No,
        _ => OverwriteDecision::Cancel,
    }
}

fn print_summary(summary: &DrainSummary) {
    if summary.aborted {
        println!("Cancelled; nothing was rendered.");
        return;
    }
    for report in &summary.reports {
        println!(
            "[{}] {} -> {}",
            report.job.state, report.job.output_name, report.job.status_message
        );
    }
    println!(
        "Rendered {}, failed {}{}",
        summary.rendered,
        summary.failed,
        if summary.cancelled {
            " (interrupted, remaining jobs not started)"
        } else {
            ""
        }
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let queue = RenderQueue::new();
    if let Some(path) = &args.jobs {
        let requests = match read_requests(path) {
            Ok(requests) => requests,
            Err(e) => {
                error!("Failed to read jobs: {}", e);
                return ExitCode::FAILURE;
            }
        };
        for request in requests {
            let source = request.source_video_path.clone();
            match queue.enqueue(request) {
                Ok(Enqueued::Added(_)) => {}
                Ok(Enqueued::Duplicate(id)) => {
                    warn!(job_id = %id, source = %source.display(), "duplicate job skipped")
                }
                Err(e) => warn!("job not queued: {}", e),
            }
        }
    }

    if args.skip_checks {
        warn!("Skipping stabilizer preflight (--skip-checks enabled)");
    } else {
        let Some(executable) = locate_stabilizer(config.stabilizer.executable.as_deref()) else {
            error!("Stabilizer executable not found; set STABILIZER_PATH or stabilizer.executable");
            return ExitCode::FAILURE;
        };
        match check_stabilizer_available(&executable) {
            Ok(version) => info!(executable = %executable.display(), %version, "stabilizer found"),
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let options = DrainOptions::from_config(&config);
    let drainer = Arc::new(QueueDrainer::new(
        queue,
        Arc::new(ProcessSupervisor::new()),
        Arc::new(FfprobeProbe),
        new_shared_status(),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping after cleanup");
                cancel.cancel();
            }
        });
    }

    if let Some(addr) = args.serve {
        let state = AppState::new(drainer, options, cancel.clone());
        return match run_status_server(addr, state, cancel).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Status server error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if drainer.queue().is_empty() {
        info!("Queue is empty, nothing to render");
        return ExitCode::SUCCESS;
    }

    let mode = args.overwrite;
    let decide = move |conflicts: &[PathBuf]| match mode {
        OverwriteMode::Ask => prompt_overwrite(conflicts),
        OverwriteMode::Yes => OverwriteDecision::Yes,
        OverwriteMode::No => OverwriteDecision::No,
    };

    match drainer.drain(options, decide, &cancel).await {
        Ok(summary) => {
            print_summary(&summary);
            if summary.failed > 0 || summary.cancelled {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(DrainError::ExecutableNotFound) => {
            error!("Stabilizer executable not found; no job was started");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Drain failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
