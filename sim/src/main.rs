// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Command line entry point for the Admin simulator (spec §6).

use clap::Parser;
use log::{info, LevelFilter};

use scp81_simulator::{AdminSimulator, SimulatorConfig};

#[derive(Parser)]
#[command(name = "scp81-simulator", about = "PSK-TLS Admin client simulator")]
struct Args {
    /// Path to a TOML simulator configuration (host, port, PSK identity/key, behavior).
    config: String,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    simplelog::SimpleLogger::init(args.log_level, simplelog::Config::default()).ok();

    let contents = tokio::fs::read_to_string(&args.config).await?;
    let config: SimulatorConfig = toml::from_str(&contents)?;

    let simulator = AdminSimulator::new(config)?;
    let outcome = simulator.run().await?;

    info!("session complete after {} step(s), status {:?}", outcome.steps, outcome.final_status);
    if !outcome.final_status.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}
