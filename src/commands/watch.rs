//! Guarded task loop.
//!
//! Each cycle claims ownership; the owner runs the configured command, the
//! other node only logs that it is observing. Claim errors never run the
//! command and are retried on the next cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Args;
use rand::Rng;

use super::claim::describe;
use super::{FileCoordinator, GlobalArgs, file_coordinator};
use crate::config::WatchConfig;
use crate::error::ExitError;
use crate::identity::{NODE_ENV, get_node_identity};
use crate::record::NodeId;
use crate::subprocess::Tool;

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Node to claim for (default: autodetected)
    #[arg(long, value_enum)]
    pub node: Option<NodeId>,
    /// Lease timeout in minutes (default: lease.timeout_minutes)
    #[arg(long)]
    pub timeout_minutes: Option<u64>,
    /// Seconds between cycles (default: watch.interval_secs)
    #[arg(long)]
    pub interval_secs: Option<u64>,
    /// Run a single cycle and exit; errors become the exit code
    #[arg(long)]
    pub once: bool,
    /// Command to run while this node owns the lease
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleResult {
    Observed,
    Idle,
    Ran { exit_code: i32 },
}

impl WatchArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let config = global.load_config()?;
        let node = get_node_identity(self.node, &config.identity)?;
        let coordinator = file_coordinator(&config, global, self.timeout_minutes)?;
        let interval = match self.interval_secs {
            Some(0) => {
                return Err(ExitError::Config("--interval-secs must be at least 1".into()).into());
            }
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(config.watch.interval_secs),
        };
        let task = self.task(node, &config.watch)?;

        let lease_secs = u64::try_from(coordinator.timeout().num_seconds()).unwrap_or(u64::MAX);
        config
            .watch
            .check_renewal_gap(interval.as_secs(), lease_secs, task.is_some())?;

        let _span = tracing::info_span!("watch", %node).entered();

        if self.once {
            run_cycle(&coordinator, node, task.as_ref(), 1)?;
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        {
            let running = Arc::clone(&running);
            ctrlc::set_handler(move || {
                eprintln!("Received interrupt signal, stopping after this cycle...");
                running.store(false, Ordering::SeqCst);
            })
            .context("installing Ctrl-C handler")?;
        }

        tracing::info!(interval_secs = interval.as_secs(), "watch loop started");
        let mut cycle: u64 = 0;
        while running.load(Ordering::SeqCst) {
            cycle += 1;
            if let Err(e) = run_cycle(&coordinator, node, task.as_ref(), cycle) {
                tracing::error!(cycle, "cycle failed, retrying next cycle: {e:#}");
            }
            let pause = interval + jitter(config.watch.jitter_secs);
            sleep_while(&running, pause);
        }
        tracing::info!(cycles = cycle, "watch loop stopped");
        Ok(())
    }

    fn task(&self, node: NodeId, watch: &WatchConfig) -> anyhow::Result<Option<Tool>> {
        if self.command.is_empty() {
            return Ok(None);
        }
        let tool = Tool::from_argv(&self.command)?
            .env(NODE_ENV, node.as_str())
            .timeout(Duration::from_secs(watch.command_timeout_secs))
            .inherit_output();
        Ok(Some(tool))
    }
}

/// Claim, then run `task` if this node owns the lease.
pub fn run_cycle(
    coordinator: &FileCoordinator,
    node: NodeId,
    task: Option<&Tool>,
    cycle: u64,
) -> anyhow::Result<CycleResult> {
    let outcome = coordinator
        .claim_ownership(node)
        .map_err(ExitError::from)?;

    if !outcome.is_granted() {
        tracing::info!(cycle, "{}", describe(node, &outcome));
        return Ok(CycleResult::Observed);
    }

    tracing::info!(cycle, "{}", describe(node, &outcome));
    let Some(task) = task else {
        return Ok(CycleResult::Idle);
    };

    let started = Instant::now();
    let output = task.run_ok()?;
    tracing::info!(
        cycle,
        command = task.program(),
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "guarded command finished"
    );
    Ok(CycleResult::Ran {
        exit_code: output.exit_code,
    })
}

fn jitter(max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_secs.saturating_mul(1000)))
}

/// Sleep for `total`, waking early once `running` is cleared.
fn sleep_while(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(200)));
    }
}
