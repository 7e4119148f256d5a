// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Command line entry point for the PSK-TLS Admin Server (spec §6).
//!
//! `start` runs the server in the foreground; `stop`/`status` operate
//! on a PID file, so a second invocation of this binary can manage an
//! already-running one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};

use scp81_core::card_engine::{CardEngine, CardProfile};
use scp81_core::keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
use scp81_server::{AdminServer, EngineFactory, ServerConfig};

const PID_FILE_ENV: &str = "SCP81_SERVER_PID_FILE";

#[derive(Parser)]
#[command(name = "scp81-server", about = "PSK-TLS GlobalPlatform Amendment B Admin Server")]
struct Options {
    #[command(subcommand)]
    cmd: Command,

    /// Log verbosity.
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server in the foreground until interrupted.
    Start {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8443)]
        port: u16,
        /// Path to a TOML key store document (spec §6 `--keystore`).
        #[arg(long)]
        keystore: Option<PathBuf>,
        #[arg(long, default_value_t = 100)]
        max_connections: usize,
        #[arg(long, default_value_t = 300.0)]
        session_timeout: f64,
    },
    /// Signal a running server (located via PID file) to stop.
    Stop,
    /// Report whether a server process is running.
    Status,
}

fn main() {
    let opts = Options::parse();
    simplelog::SimpleLogger::init(opts.log_level, simplelog::Config::default()).ok();

    let code = match run(opts.cmd) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cmd: Command) -> anyhow::Result<i32> {
    match cmd {
        Command::Start { host, port, keystore, max_connections, session_timeout } => {
            start(host, port, keystore, max_connections, session_timeout)
        }
        Command::Stop => stop(),
        Command::Status => status(),
    }
}

fn start(
    host: String,
    port: u16,
    keystore: Option<PathBuf>,
    max_connections: usize,
    session_timeout: f64,
) -> anyhow::Result<i32> {
    let config = ServerConfig { host, port, max_connections, session_timeout, ..Default::default() };
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return Ok(2);
    }

    let keystore: Arc<dyn KeyStore> = match keystore {
        Some(path) => Arc::new(FileKeyStore::open(&path)?),
        None => {
            info!("no --keystore given; running with an empty in-memory key store");
            Arc::new(MemoryKeyStore::new())
        }
    };

    let engine_factory: EngineFactory =
        Arc::new(|| CardEngine::new(CardProfile::new(vec![0xA0, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00])));

    let thread_pool_size = config.thread_pool_size;
    let server = AdminServer::new(config, keystore, engine_factory)?;

    write_pid_file(std::process::id());
    info!("starting on pid {}", std::process::id());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(thread_pool_size)
        .enable_all()
        .build()?;
    let result = runtime.block_on(async move {
        let server = Arc::new(server);
        let server_for_signal = server.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt, shutting down");
            server_for_signal.stop();
        });
        server.run().await
    });
    remove_pid_file();

    match result {
        Ok(()) => Ok(0),
        Err(e) => {
            error!("server exited with error: {e}");
            Ok(1)
        }
    }
}

fn stop() -> anyhow::Result<i32> {
    let Some(pid) = read_pid_file() else {
        error!("no PID file found; is the server running?");
        return Ok(1);
    };

    info!("sending SIGTERM to pid {pid}");
    let status = std::process::Command::new("kill").arg("-TERM").arg(pid.to_string()).status()?;
    if status.success() {
        Ok(0)
    } else {
        error!("failed to signal pid {pid}");
        Ok(1)
    }
}

fn status() -> anyhow::Result<i32> {
    match read_pid_file() {
        Some(pid) if is_process_running(pid) => {
            info!("server is running (pid {pid})");
            Ok(0)
        }
        Some(pid) => {
            info!("stale PID file for pid {pid}; process is not running");
            Ok(1)
        }
        None => {
            info!("server is not running");
            Ok(1)
        }
    }
}

fn is_process_running(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn pid_file_path() -> PathBuf {
    if let Ok(path) = std::env::var(PID_FILE_ENV) {
        return PathBuf::from(path);
    }
    Path::new("/tmp").join("scp81-server.pid")
}

fn write_pid_file(pid: u32) {
    let path = pid_file_path();
    if let Err(e) = std::fs::write(&path, pid.to_string()) {
        log::warn!("failed to write PID file {}: {e}", path.display());
    }
}

fn read_pid_file() -> Option<u32> {
    std::fs::read_to_string(pid_file_path()).ok()?.trim().parse().ok()
}

fn remove_pid_file() {
    let _ = std::fs::remove_file(pid_file_path());
}
