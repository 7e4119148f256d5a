// Copyright (c) 2024 The SCP81 Admin Harness Authors

use clap::{Parser, Subcommand};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use strum::{Display, EnumString};

use scp81_tests::{fragment_length, graceful_shutdown, handshake_auth, happy_path, idle_timeout, script_abort};

/// Runs the harness's end-to-end scenarios against a real loopback
/// server and simulator, outside of `cargo test`.
#[derive(Clone, Debug, Parser)]
pub struct Opts {
    #[clap(subcommand)]
    pub scenario: Scenario,

    /// Log level
    #[clap(long, default_value = "info", env)]
    pub log_level: LevelFilter,
}

/// One scenario per spec §8, plus `All` to run the full suite.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Subcommand, Display, EnumString)]
pub enum Scenario {
    /// Run every scenario in sequence
    All,
    /// S1: single SELECT script completes with Ok
    HappyPath,
    /// S2: unknown PSK identity never opens a session
    HandshakeAuth,
    /// S3: a failing SELECT mid-script aborts the remaining steps
    ScriptAbort,
    /// S4: a quiet client is closed as an idle timeout
    IdleTimeout,
    /// S5: an oversized step survives a small negotiated fragment length
    FragmentLength,
    /// S6: in-flight sessions drain cleanly on shutdown
    GracefulShutdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let _ = TermLogger::init(opts.log_level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto);

    log::info!("running scenario '{}'", opts.scenario);

    let scenarios: Vec<(Scenario, _)> = match opts.scenario {
        Scenario::All => vec![
            (Scenario::HappyPath, happy_path::run().boxed()),
            (Scenario::HandshakeAuth, handshake_auth::run().boxed()),
            (Scenario::ScriptAbort, script_abort::run().boxed()),
            (Scenario::IdleTimeout, idle_timeout::run().boxed()),
            (Scenario::FragmentLength, fragment_length::run().boxed()),
            (Scenario::GracefulShutdown, graceful_shutdown::run().boxed()),
        ],
        other => vec![(other, run_one(other).boxed())],
    };

    let mut failures = Vec::new();
    for (scenario, fut) in scenarios {
        match fut.await {
            Ok(()) => log::info!("{scenario}: OK"),
            Err(e) => {
                log::error!("{scenario}: FAILED: {e}");
                failures.push(scenario);
            }
        }
    }

    if !failures.is_empty() {
        return Err(anyhow::anyhow!("{} scenario(s) failed: {failures:?}", failures.len()));
    }

    log::info!("all scenarios passed");
    Ok(())
}

fn run_one(scenario: Scenario) -> impl std::future::Future<Output = anyhow::Result<()>> {
    async move {
        match scenario {
            Scenario::HappyPath => happy_path::run().await,
            Scenario::HandshakeAuth => handshake_auth::run().await,
            Scenario::ScriptAbort => script_abort::run().await,
            Scenario::IdleTimeout => idle_timeout::run().await,
            Scenario::FragmentLength => fragment_length::run().await,
            Scenario::GracefulShutdown => graceful_shutdown::run().await,
            Scenario::All => unreachable!("All is expanded before reaching run_one"),
        }
    }
}

trait BoxFuture<'a, T> {
    fn boxed(self) -> std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
}

impl<'a, T, F> BoxFuture<'a, T> for F
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    fn boxed(self) -> std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>> {
        Box::pin(self)
    }
}
