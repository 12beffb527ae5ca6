//! ase-scan binary - scans generated code for reintroduced vulnerabilities

use anyhow::Context;
use ase_sandbox::detect_engine;
use ase_scanner::config::{CheckPathsArgs, Command, MergeArgs, ScanArgs};
use ase_scanner::{check_paths, merge_results, security_scan, CancelToken, Cli, Dataset};
use clap::Parser;
use std::fs;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Conventional exit status for a process ended by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let result = match cli.command {
        Command::Scan(args) => scan(args).await,
        Command::Merge(args) => merge(args),
        Command::CheckPaths(args) => paths(args).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{:#}", err), "ase-scan failed");
            ExitCode::FAILURE
        }
    }
}

async fn scan(args: ScanArgs) -> anyhow::Result<ExitCode> {
    let engine = detect_engine();
    info!(runtime = engine.name(), code_dir = %args.code_dir.display(), "ase-scan starting");

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if on_interrupt.cancel() {
                warn!("interrupt received; waiting for running scans to finish (interrupt again to quit)");
            } else {
                error!("second interrupt received; quitting without waiting for running scans");
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
        }
    });

    let report = security_scan(
        engine,
        &args.code_dir,
        &args.dataset,
        &args.settings(),
        cancel,
    )
    .await?;

    let code = report.outcome.exit_code();
    Ok(if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(code as u8)
    })
}

fn merge(args: MergeArgs) -> anyhow::Result<ExitCode> {
    let merged = merge_results(&args.code_dir, &args.dataset)?;
    info!(merged = merged.len(), "merge finished");
    Ok(ExitCode::SUCCESS)
}

async fn paths(args: CheckPathsArgs) -> anyhow::Result<ExitCode> {
    let dataset = Dataset::load(&args.dataset)
        .with_context(|| format!("loading dataset {}", args.dataset.display()))?;
    let checks = check_paths(detect_engine(), &dataset, args.max_workers).await;

    let body = serde_json::to_string_pretty(&checks)?;
    match &args.output {
        Some(path) => fs::write(path, body + "\n")
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", body),
    }
    Ok(ExitCode::SUCCESS)
}
