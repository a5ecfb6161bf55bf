//! The hived binary: daemon lifecycle subcommands.

use std::process::exit;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use daemon::lifecycle::{self, Daemon, DaemonConfig, DaemonError};
use daemon::lock::FileLock;

/// Main lifecycle lock acquisition timeout.
const LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const LOCK_DELAY: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "hived", about = "cluster manager daemon", version)]
struct Cli {
  #[command(subcommand)]
  cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
  /// Start the daemon in the background and wait for it to run.
  Start,
  /// Stop the running daemon and wait for it to exit.
  Stop,
  /// Run the daemon in the foreground.
  Run,
  /// Probe the daemon, exit 0 when running.
  Running,
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();
  let config = DaemonConfig::load();
  init_tracing(&config, matches!(cli.cmd, Cmd::Run));

  let code = match dispatch(cli.cmd, config).await {
    Ok(code) => code,
    Err(e) => {
      if let Some(DaemonError::Bootstrap(_)) = e.downcast_ref::<DaemonError>() {
        eprintln!("hived: {e:#}");
        2
      } else {
        eprintln!("hived: {e:#}");
        1
      }
    }
  };
  exit(code);
}

async fn dispatch(cmd: Cmd, config: DaemonConfig) -> anyhow::Result<i32> {
  match cmd {
    Cmd::Run => {
      Daemon::new(config).run().await?;
      Ok(0)
    }
    Cmd::Start => start(config).await,
    Cmd::Stop => stop(config).await,
    Cmd::Running => {
      if lifecycle::daemon_running(&config.layout) {
        println!("running");
        Ok(0)
      } else {
        println!("not running");
        Ok(1)
      }
    }
  }
}

/// Spawn `hived run` detached and wait for the daemon to come up. The cli
/// lock serialises compound start-then-check sequences; the main lock
/// covers the actual state change.
async fn start(config: DaemonConfig) -> anyhow::Result<i32> {
  std::fs::create_dir_all(config.layout.lock_dir()).context("create lock dir")?;
  let _cli_lock = FileLock::acquire(config.layout.cli_lock(), LOCK_TIMEOUT, LOCK_DELAY)
    .await
    .context("cli lock")?;
  if lifecycle::daemon_running(&config.layout) {
    println!("already running");
    return Ok(0);
  }
  {
    let _main_lock = FileLock::acquire(config.layout.main_lock(), LOCK_TIMEOUT, LOCK_DELAY)
      .await
      .context("main lock")?;
    let exe = std::env::current_exe().context("locate hived")?;
    std::process::Command::new(exe)
      .arg("run")
      .env(hive_core::session::SESSION_ENV, config.session.to_string())
      .spawn()
      .context("spawn daemon")?;
    info!(session = %config.session, "daemon spawned");
  }
  if lifecycle::wait_running(&config.layout).await {
    println!("running");
    Ok(0)
  } else {
    anyhow::bail!("daemon did not come up");
  }
}

/// Signal the running daemon and wait for it to exit.
async fn stop(config: DaemonConfig) -> anyhow::Result<i32> {
  std::fs::create_dir_all(config.layout.lock_dir()).context("create lock dir")?;
  let _main_lock = FileLock::acquire(config.layout.main_lock(), LOCK_TIMEOUT, LOCK_DELAY)
    .await
    .context("main lock")?;
  let Some(pid) = lifecycle::daemon_pid(&config.layout) else {
    println!("not running");
    return Ok(0);
  };
  let status = std::process::Command::new("kill")
    .arg(pid.to_string())
    .status()
    .context("signal daemon")?;
  if !status.success() {
    anyhow::bail!("signal daemon pid {pid}");
  }
  if lifecycle::wait_stopped(&config.layout).await {
    println!("stopped");
    Ok(0)
  } else {
    anyhow::bail!("daemon did not stop");
  }
}

fn init_tracing(config: &DaemonConfig, to_file: bool) {
  use tracing_subscriber::EnvFilter;
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  if to_file && std::env::var_os("HIVE_LOG_STDERR").is_none() {
    let _ = std::fs::create_dir_all(config.layout.var());
    let appender = tracing_appender::rolling::daily(config.layout.var(), "hived.log");
    // the guard must live as long as the process; leak it on purpose
    let (writer, guard) = tracing_appender::non_blocking(appender);
    std::mem::forget(guard);
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();
  } else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
  }
}
