//! pixiv-backup: unattended mirror of a Pixiv user's bookmarked and
//! followed-author works, built for always-on routers.

use std::time::Duration;

use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pixiv_backup_api::{ClientConfig, PixivClient};
use pixiv_backup_core::config::BackupConfig;
use pixiv_backup_core::status::{RuntimeStatus, ServiceState, StatusPublisher};
use pixiv_backup_core::{Error, Result};

mod cli;
mod downloader;
mod history;
mod logging;
mod logtail;
mod repair;
mod scanner;
mod scheduler;
mod uci;

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    if cli.daemon {
        return daemon_main().await;
    }
    let Some(command) = cli.command else {
        Cli::command()
            .print_help()
            .map_err(|e| Error::Internal(e.to_string()))?;
        return Ok(2);
    };

    match command {
        Command::Start { force_run } => {
            logging::init_cli();
            let config = uci::load_config().await?;
            if force_run {
                touch(&config.force_flag_path())?;
            }
            start_daemon()
        }
        Command::Stop => {
            logging::init_cli();
            let config = uci::load_config().await?;
            stop_daemon(&config).await
        }
        Command::Restart => {
            logging::init_cli();
            let config = uci::load_config().await?;
            let _ = stop_daemon(&config).await?;
            start_daemon()
        }
        Command::Status => {
            let config = uci::load_config().await?;
            print_status(&config)
        }
        Command::Test => {
            logging::init_cli();
            let config = uci::load_config().await?;
            test_connectivity(&config).await
        }
        Command::Trigger => {
            let config = uci::load_config().await?;
            touch(&config.force_flag_path())?;
            println!("force-run sentinel dropped");
            Ok(0)
        }
        Command::Run { count } => {
            let config = uci::load_config().await?;
            config.validate()?;
            config.ensure_directories()?;
            logging::init_daemon(config.log_dir());
            run_single_round(&config, count).await
        }
        Command::Log {
            lines,
            no_follow,
            file: _,
            syslog,
        } => {
            let config = uci::load_config().await?;
            logtail::tail_log(&config, lines, !no_follow, syslog).await
        }
        Command::Repair { check: _, apply } => {
            logging::init_cli();
            let config = uci::load_config().await?;
            let report = repair::run_repair(&config, apply);
            for issue in &report.issues {
                println!("issue: {issue}");
            }
            for fixed in &report.fixed {
                println!("fixed: {fixed}");
            }
            if report.clean() && report.fixed.is_empty() {
                println!("no problems found");
            }
            Ok(if report.clean() || apply { 0 } else { 1 })
        }
    }
}

async fn daemon_main() -> Result<i32> {
    // Logging needs the output directory before the first round runs.
    let config = uci::load_config().await?;
    let _ = std::fs::create_dir_all(config.log_dir());
    logging::init_daemon(config.log_dir());
    info!(version = env!("CARGO_PKG_VERSION"), "pixiv-backup daemon starting");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    Ok(scheduler::run_daemon(cancel).await)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    error!(error = %err, "cannot install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("stop signal received, finishing current work");
        cancel.cancel();
    });
}

fn start_daemon() -> Result<i32> {
    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("--daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    println!("daemon started (pid {})", child.id());
    Ok(0)
}

/// Drop the stop sentinel and wait for the daemon to acknowledge.
async fn stop_daemon(config: &BackupConfig) -> Result<i32> {
    touch(&config.stop_flag_path())?;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if !config.stop_flag_path().exists() {
            // Consumed: the daemon saw it. Give it a moment to publish.
            for _ in 0..20 {
                if matches!(
                    RuntimeStatus::read(&config.status_path()).map(|s| s.state),
                    Ok(ServiceState::Stopped)
                ) {
                    println!("daemon stopped");
                    return Ok(0);
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            println!("stop acknowledged");
            return Ok(0);
        }
    }
    // Nothing consumed the sentinel; no daemon is listening.
    let _ = std::fs::remove_file(config.stop_flag_path());
    println!("no running daemon found");
    Ok(0)
}

fn print_status(config: &BackupConfig) -> Result<i32> {
    let status = match RuntimeStatus::read(&config.status_path()) {
        Ok(status) => status,
        Err(_) => {
            println!("no status available (daemon has not run yet)");
            return Ok(1);
        }
    };
    println!("state:        {}", status.state.as_str());
    if let Some(phase) = &status.phase {
        println!("phase:        {phase}");
    }
    if let Some(message) = &status.message {
        println!("message:      {message}");
    }
    println!(
        "round:        {} processed, {} ok, {} skipped, {} failed",
        status.processed_total, status.success, status.skipped, status.failed
    );
    if let Some(queue) = &status.queue {
        println!(
            "queue:        {} pending, {} running, {} failed, {} done, {} permanent",
            queue.pending, queue.running, queue.failed, queue.done, queue.permanent_failed
        );
    }
    if status.rate_limited {
        println!("rate_limited: yes");
    }
    if status.hit_max_downloads {
        println!("hit_max:      yes");
    }
    if let Some(reason) = &status.cooldown_reason {
        println!("cooldown:     {reason:?}");
    }
    if let Some(next) = &status.next_run_at {
        println!("next_run_at:  {next}");
    }
    if let Some(err) = &status.last_error {
        println!("last_error:   [{}] {}", err.action, err.error);
    }
    println!("updated_at:   {}", status.updated_at);
    Ok(0)
}

async fn test_connectivity(config: &BackupConfig) -> Result<i32> {
    config.validate()?;
    println!("configuration complete");

    let client = PixivClient::new(ClientConfig {
        refresh_token: config.refresh_token.clone(),
        token_path: config.token_path(),
        timeout: Duration::from_secs(config.timeout_secs),
    })
    .map_err(|e| Error::Internal(e.to_string()))?;

    client
        .ensure_authenticated()
        .await
        .map_err(|e| Error::Internal(format!("token refresh failed: {e}")))?;
    println!("token refresh ok");

    match client.user_detail(config.user_id).await {
        Ok(detail) => {
            println!(
                "connected as {} (@{})",
                detail.user.name, detail.user.account
            );
            Ok(0)
        }
        Err(err) => {
            eprintln!("user lookup failed: {err}");
            Ok(1)
        }
    }
}

async fn run_single_round(config: &BackupConfig, budget: u32) -> Result<i32> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    let mut publisher = StatusPublisher::new(config.status_path());

    let outcome = scheduler::run_round(config, &cancel, Some(budget), &mut publisher).await;
    info!(
        success = outcome.stats.success,
        skipped = outcome.stats.skipped,
        failed = outcome.stats.failed,
        "round finished"
    );
    publish_final_state(&mut publisher);
    Ok(if outcome.fatal.is_some() { 1 } else { 0 })
}

fn publish_final_state(publisher: &mut StatusPublisher) {
    let mut status = RuntimeStatus::new(ServiceState::Stopped);
    if let Err(err) = publisher.publish(&mut status) {
        error!(error = %err, "could not publish final status");
    }
}

fn touch(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, b"")?;
    Ok(())
}
