use chrono::{DateTime, Utc};
use clap::Args;

use super::claim::format_age;
use super::{GlobalArgs, OutputFormat, file_coordinator};
use crate::clock::Clock;
use crate::coordinator::Coordinator;
use crate::error::ExitError;
use crate::record::{NodeId, OwnershipRecord, timestamp};
use crate::store::{Loaded, OwnershipStore};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
    /// History entries to show in pretty/text output
    #[arg(long, default_value = "5")]
    pub history: usize,
}

/// Derived view used by the pretty and text formats.
#[derive(Debug)]
pub struct StatusReport<'a> {
    pub now: DateTime<Utc>,
    pub active_node: NodeId,
    pub heartbeat_age_secs: i64,
    pub lease_fresh: bool,
    pub record: &'a OwnershipRecord,
}

impl<'a> StatusReport<'a> {
    /// Judge `record` with the coordinator's clock and timeout, the same
    /// inputs a claim would use.
    pub fn new<S: OwnershipStore, C: Clock>(
        record: &'a OwnershipRecord,
        coordinator: &Coordinator<S, C>,
    ) -> Self {
        let now = coordinator.clock().now();
        Self {
            now,
            active_node: record.active_node,
            heartbeat_age_secs: record.heartbeat_age(now).num_seconds(),
            lease_fresh: !record.is_stale(now, coordinator.timeout()),
            record,
        }
    }
}

impl StatusArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let config = global.load_config()?;
        let coordinator = file_coordinator(&config, global, None)?;
        let store = coordinator.store();

        let record = match coordinator.inspect().map_err(ExitError::from)? {
            Loaded::Missing => None,
            Loaded::Corrupt { reason, .. } => {
                return Err(ExitError::Other(format!(
                    "ownership record at {} is unusable: {reason}",
                    store.describe()
                ))
                .into());
            }
            Loaded::Present { record, .. } => Some(record),
        };

        let Some(record) = record else {
            match self.format {
                OutputFormat::Json => println!("null"),
                OutputFormat::Pretty | OutputFormat::Text => {
                    println!("no ownership record at {}", store.describe());
                }
            }
            return Ok(());
        };

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
            OutputFormat::Pretty => self.print_pretty(&StatusReport::new(&record, &coordinator)),
            OutputFormat::Text => self.print_text(&StatusReport::new(&record, &coordinator)),
        }
        Ok(())
    }

    fn print_pretty(&self, report: &StatusReport<'_>) {
        let record = report.record;
        println!("=== Ownership ===\n");
        println!(
            "Active node: {}  ({})",
            report.active_node,
            if report.lease_fresh { "lease fresh" } else { "lease stale" }
        );
        println!(
            "Last heartbeat: {}  ({} ago)",
            timestamp::format(&record.last_heartbeat),
            format_age(record.heartbeat_age(report.now))
        );
        println!("\nHealth:");
        for node in [NodeId::Local, NodeId::Remote] {
            println!("  {node:<7} {}", record.health.get(node).as_str());
        }

        println!("\nTransfers: {}", record.node_history.len());
        for entry in recent(&record.node_history, self.history) {
            println!(
                "  • {}  {} → {}  ({})",
                timestamp::format(&entry.timestamp),
                entry.from_node,
                entry.to_node,
                entry.reason
            );
        }
    }

    fn print_text(&self, report: &StatusReport<'_>) {
        let record = report.record;
        println!("handshake-status");
        println!(
            "owner  node={}  heartbeat={}  age_secs={}  fresh={}",
            report.active_node,
            timestamp::format(&record.last_heartbeat),
            report.heartbeat_age_secs,
            report.lease_fresh
        );
        println!(
            "health  local={}  remote={}",
            record.health.local.as_str(),
            record.health.remote.as_str()
        );
        println!("history  count={}", record.node_history.len());
        for entry in recent(&record.node_history, self.history) {
            println!(
                "transfer  from={}  to={}  at={}  reason={}",
                entry.from_node,
                entry.to_node,
                timestamp::format(&entry.timestamp),
                entry.reason
            );
        }
    }
}

fn recent<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}
