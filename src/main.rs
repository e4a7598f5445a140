use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lockwatch::{DetectorConfig, EventLoop, LockWatch, Monitor, enter_frame, thread};
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "lockwatch - reproduce a deadlock or a stall and watch it get reported"
)]
struct Cli {
    #[command(subcommand)]
    scenario: Scenario,

    /// JSON file with detector settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Time between detection ticks
    #[arg(long, global = true)]
    interval_ms: Option<u64>,

    /// How long the critical thread may stay unresponsive
    #[arg(long, global = true)]
    stall_threshold_ms: Option<u64>,

    /// Also append reports as JSON lines to this file
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// How long to keep the process alive after triggering the scenario
    #[arg(long, global = true, default_value_t = 10)]
    wait_secs: u64,
}

#[derive(Subcommand, Clone, Copy)]
enum Scenario {
    /// Two threads take two tracked mutexes in opposite order
    Explicit,
    /// Two threads enter two monitors in opposite order
    Implicit,
    /// The critical event loop gets stuck in a long task
    Stall,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DetectorConfig::from_file(path)?,
        None => DetectorConfig {
            initial_delay_ms: 500,
            detection_interval_ms: 1000,
            stall_threshold_ms: 2000,
            ..Default::default()
        },
    };
    if let Some(ms) = cli.interval_ms {
        config.detection_interval_ms = ms;
    }
    if let Some(ms) = cli.stall_threshold_ms {
        config.stall_threshold_ms = ms;
    }

    let mut watch = LockWatch::new(config);
    if let Some(path) = &cli.log {
        watch = watch.with_log(path);
    }

    let wait = Duration::from_secs(cli.wait_secs);
    match cli.scenario {
        Scenario::Explicit => explicit(watch, wait),
        Scenario::Implicit => implicit(watch, wait),
        Scenario::Stall => stall(watch, wait),
    }
}

fn explicit(watch: LockWatch, wait: Duration) -> Result<()> {
    let scheduler = watch.start()?;
    let first = Arc::new(scheduler.create_tracked_lock("Lock-1", (), false));
    let second = Arc::new(scheduler.create_tracked_lock("Lock-2", (), false));
    let barrier = Arc::new(Barrier::new(2));

    for (name, a, b) in [
        ("TrackedDeadlock-1", Arc::clone(&first), Arc::clone(&second)),
        ("TrackedDeadlock-2", second, first),
    ] {
        let barrier = Arc::clone(&barrier);
        thread::Builder::new().name(name.into()).spawn(move || {
            let _a = a.lock();
            tracing::info!("{name} holds {}, waiting for {}", a.name(), b.name());
            barrier.wait();
            let _b = b.lock();
        })?;
    }

    thread::sleep(wait);
    scheduler.stop();
    Ok(())
}

fn implicit(watch: LockWatch, wait: Duration) -> Result<()> {
    let scheduler = watch.start()?;
    let vault_a = Arc::new(Monitor::new(()));
    let vault_b = Arc::new(Monitor::new(()));
    let barrier = Arc::new(Barrier::new(2));

    for (name, outer, inner, outer_frame, inner_frame) in [
        ("MonitorDeadlock-1", Arc::clone(&vault_a), Arc::clone(&vault_b), "Vault::guard_a", "Vault::guard_b"),
        ("MonitorDeadlock-2", vault_b, vault_a, "Vault::guard_b", "Vault::guard_a"),
    ] {
        let barrier = Arc::clone(&barrier);
        thread::Builder::new().name(name.into()).spawn(move || {
            let _outer_frame = enter_frame(outer_frame);
            let _outer = outer.enter();
            barrier.wait();
            let _inner_frame = enter_frame(inner_frame);
            let _inner = inner.enter();
        })?;
    }

    thread::sleep(wait);
    scheduler.stop();
    Ok(())
}

fn stall(watch: LockWatch, wait: Duration) -> Result<()> {
    let (ui_loop, _ui_thread) =
        EventLoop::spawn("main-loop").context("Failed to start the event loop")?;
    let scheduler = watch.critical_thread(ui_loop.clone()).start()?;

    let busy = wait + Duration::from_secs(1);
    ui_loop.post(Box::new(move || {
        let _frame = enter_frame("MainActivity::on_click");
        tracing::info!("blocking the event loop for {busy:?}");
        thread::sleep(busy);
    }));

    thread::sleep(wait);
    scheduler.stop();
    Ok(())
}
