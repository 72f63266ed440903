//! Train a retry policy against the mock server

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use rlretry::{
    AutoRequestInterval, DelayLadder, PacingConfig, RetryError, RetryPolicy, RuntimeConfig,
    Settings,
};

use super::weights::print_table;
use crate::simulator::{classify, MockServer, ServerConfig, ServerFailure};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of calls to make
    #[arg(short = 'n', long, default_value_t = 500)]
    pub calls: usize,

    /// Simulated seconds per wall-clock second
    #[arg(long, default_value_t = 30.0)]
    pub speedup: f64,

    /// Simulated pause between calls, in milliseconds
    #[arg(long, default_value_t = 450)]
    pub interval_ms: u64,

    /// Space calls adaptively instead of using a fixed pause
    #[arg(long)]
    pub pace: bool,

    /// Seed for the mock server and exploration
    #[arg(long)]
    pub seed: Option<u64>,

    /// Weights directory (overrides persistence.weights_dir)
    #[arg(long)]
    pub weights_dir: Option<PathBuf>,

    /// Merge with other processes sharing the weights directory
    #[arg(long)]
    pub distributed: bool,
}

/// Outcome counts for a simulation run
#[derive(Debug, Default)]
pub struct Tally {
    pub succeeded: usize,
    /// Exhausted sequences by the state they ended in
    pub exhausted: BTreeMap<String, usize>,
    /// Failures returned as-is
    pub failed: BTreeMap<String, usize>,
}

impl Tally {
    pub fn record(&mut self, result: &Result<(), RetryError<ServerFailure>>) {
        match result {
            Ok(()) => self.succeeded += 1,
            Err(RetryError::Exhausted { state, .. }) => {
                *self.exhausted.entry(state.to_string()).or_default() += 1;
            }
            Err(RetryError::Operation(failure)) => {
                *self.failed.entry(failure.label().to_string()).or_default() += 1;
            }
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded
            + self.exhausted.values().sum::<usize>()
            + self.failed.values().sum::<usize>()
    }
}

/// Compress the policy's clock to the server's
fn scale(runtime: &mut RuntimeConfig, speedup: f64) -> Result<()> {
    runtime.retry.timeout =
        Duration::try_from_secs_f64(runtime.retry.timeout.as_secs_f64() / speedup)
            .context("Scaled timeout out of range")?;
    // Whole milliseconds, so the ladder survives a checkpoint round trip
    let delays: Vec<u64> = runtime
        .retry
        .ladder
        .delays()
        .iter()
        .map(|d| (d.as_secs_f64() * 1000.0 / speedup).round() as u64)
        .collect();
    runtime.retry.ladder = DelayLadder::from_millis(&delays).context("Invalid scaled ladder")?;
    Ok(())
}

pub async fn run(args: SimulateArgs, mut settings: Settings) -> Result<()> {
    if !(args.speedup.is_finite() && args.speedup > 0.0) {
        bail!("--speedup must be positive, got {}", args.speedup);
    }
    if let Some(dir) = args.weights_dir {
        settings.persistence.weights_dir = Some(dir);
    }
    if args.distributed {
        settings.persistence.distributed = true;
    }
    if args.seed.is_some() {
        settings.learning.seed = args.seed;
    }

    let mut runtime = settings.validate()?;
    scale(&mut runtime, args.speedup)?;
    let policy = runtime.build_policy()?;

    let server = MockServer::new(
        ServerConfig {
            speedup: args.speedup,
            ..ServerConfig::default()
        },
        args.seed.unwrap_or_else(rand::random),
    );
    let pacer = AutoRequestInterval::new(PacingConfig::default())?;
    let pause = server.to_wall(Duration::from_millis(args.interval_ms));

    info!(calls = args.calls, speedup = args.speedup, pace = args.pace, "starting simulation");

    let mut tally = Tally::default();
    let (policy_ref, server_ref) = (&policy, &server);
    for i in 0..args.calls {
        let parameter = server.parameter();
        let param = parameter.as_str();
        let call = move || {
            policy_ref.call(move || std::future::ready(server_ref.handle(param)), classify)
        };

        let result = if args.pace {
            pacer.call(call).await
        } else {
            let result = call().await;
            sleep(pause).await;
            result
        };
        debug!(call = i, %parameter, ok = result.is_ok(), "call finished");
        tally.record(&result);
    }

    if let Err(e) = policy.checkpoint().await {
        warn!("Failed to save final checkpoint: {}", e);
    }

    print_summary(&tally, &server, &policy).await;
    Ok(())
}

async fn print_summary(tally: &Tally, server: &MockServer, policy: &RetryPolicy) {
    println!("Simulation Summary");
    println!("==================");
    println!("Calls:          {}", tally.total());
    println!("Simulated time: {:.1}s", server.now().as_secs_f64());
    println!("Succeeded:      {}", tally.succeeded);
    for (state, count) in &tally.exhausted {
        println!("Gave up after {state}: {count}");
    }
    for (label, count) in &tally.failed {
        println!("Failed with {label}: {count}");
    }

    let agent = policy.agent().lock().await;
    let stats = agent.stats();
    println!();
    println!(
        "Learned {} states from {} sequences (epsilon {:.3})",
        stats.known_states, stats.total_sequences, stats.epsilon
    );
    println!();
    print_table(&agent.export_weights());
}
