pub mod models {
    pub mod regions;
}

pub mod config;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod postgres;
    pub mod store;
}
pub mod generator;
pub mod retry;
pub mod sampling;
pub mod schema;
pub mod utils;
pub mod services {
    pub mod backfill;
    pub mod entities;
    pub mod ingest;
    pub mod provision;
    pub mod readings;
    pub mod realtime;
}

use crate::config::Config;
use crate::db::postgres::PgConnector;
use crate::generator::{Generator, ShutdownHandle};
use clap::Parser;
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::thread;

/// Seeds and continuously feeds a building-sensor database with synthetic data.
#[derive(Debug, Parser)]
#[command(name = "sensor-seeder", version)]
struct Cli {
    /// Wipe buildings, contacts, sensors and readings and generate everything anew.
    #[arg(long)]
    regenerate: bool,
    /// Load environment variables from this file instead of `./.env`.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

/// Variables already present in the process environment win over the file.
fn load_env(explicit: Option<PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        dotenvy::from_path(&path).map_err(|e| format!("failed to load {}: {}", path.display(), e))?;
        return Ok(Some(LoadedEnvFile { path, explicit: true }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    dotenvy::from_path(&default_path).map_err(|e| format!("failed to load {}: {}", default_path.display(), e))?;
    Ok(Some(LoadedEnvFile {
        path: default_path,
        explicit: false,
    }))
}

/// Forward SIGINT/SIGTERM: flag any running backfill, then wake the main thread.
fn spawn_signal_listener(shutdown: ShutdownHandle) -> Result<Receiver<i32>, String> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| format!("failed to register signal handlers: {}", e))?;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                shutdown.request();
                if tx.send(signal).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| format!("failed to start signal listener: {}", e))?;
    Ok(rx)
}

fn run(cli: &Cli) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    let g = &cfg.generator;
    info!(
        "Config loaded (db={}, buildings={}, batch_size={}, steady_interval={}s, seed={}, regenerate={})",
        g.database,
        g.building_count,
        g.batch_size,
        g.steady_interval.as_secs(),
        g.seed.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
        cli.regenerate
    );

    // 2) Generator + shutdown wiring
    let mut generator = Generator::new(PgConnector::new(&cfg.database_url), cfg.generator.clone());
    let signals = spawn_signal_listener(generator.shutdown_handle())?;

    // 3) Provision, seed/resume, backfill, first steady tick
    match generator.initialize(cli.regenerate) {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {
            info!("Shutdown requested during startup; exiting");
            return Ok(());
        }
        Err(e) => return Err(e.to_string()),
    }
    let status = generator.status();
    info!(
        "Running: {} sensor(s), {} tick(s) so far; press Ctrl-C to stop",
        status.sensor_count, status.ticks_emitted
    );

    // 4) Steady state until a signal arrives
    match signals.recv() {
        Ok(signal) => info!("Received signal {}, shutting down", signal),
        Err(_) => warn!("Signal listener exited; shutting down"),
    }
    generator.disconnect();
    let status = generator.status();
    info!(
        "Stopped after {} steady tick(s) ({} failed)",
        status.ticks_emitted, status.ticks_failed
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let loaded_env = match load_env(cli.env_file.clone()) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!("sensor-seeder {} starting", env!("CARGO_PKG_VERSION"));
    if let Err(e) = run(&cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
