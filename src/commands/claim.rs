use clap::Args;

use super::{GlobalArgs, file_coordinator};
use crate::coordinator::ClaimOutcome;
use crate::error::ExitError;
use crate::identity::get_node_identity;
use crate::record::NodeId;

#[derive(Debug, Args)]
pub struct ClaimArgs {
    /// Node to claim for (default: autodetected)
    #[arg(long, value_enum)]
    pub node: Option<NodeId>,
    /// Lease timeout in minutes (default: lease.timeout_minutes)
    #[arg(long)]
    pub timeout_minutes: Option<u64>,
    /// Only print true/false
    #[arg(short, long)]
    pub quiet: bool,
}

impl ClaimArgs {
    /// Prints `true` when this node may run guarded work, `false` otherwise.
    /// Both are successful exits; only storage or config problems fail.
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let config = global.load_config()?;
        let node = get_node_identity(self.node, &config.identity)?;
        let coordinator = file_coordinator(&config, global, self.timeout_minutes)?;

        let outcome = coordinator
            .claim_ownership(node)
            .map_err(ExitError::from)?;

        println!("{}", outcome.is_granted());
        if !self.quiet {
            eprintln!("{}", describe(node, &outcome));
        }
        Ok(())
    }
}

/// One-line summary of a claim for operators.
pub fn describe(node: NodeId, outcome: &ClaimOutcome) -> String {
    match outcome {
        ClaimOutcome::Initialized => format!("{node}: active (initialized ownership record)"),
        ClaimOutcome::Renewed => format!("{node}: active (heartbeat renewed)"),
        ClaimOutcome::TookOver {
            from,
            heartbeat_age,
        } => format!(
            "{node}: active (took over from {from}, last heartbeat {} ago)",
            format_age(*heartbeat_age)
        ),
        ClaimOutcome::Observing {
            owner,
            heartbeat_age,
        } => format!(
            "{node}: observing ({owner} is active, last heartbeat {} ago)",
            format_age(*heartbeat_age)
        ),
    }
}

/// Human-readable age, e.g. `2h 5m`, `4m 10s`, `12s`.
pub fn format_age(age: chrono::TimeDelta) -> String {
    let secs = age.num_seconds().max(0);
    let (hours, mins, secs) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn describes_each_outcome() {
        assert_eq!(
            describe(NodeId::Local, &ClaimOutcome::Renewed),
            "local: active (heartbeat renewed)"
        );
        assert_eq!(
            describe(
                NodeId::Local,
                &ClaimOutcome::TookOver {
                    from: NodeId::Remote,
                    heartbeat_age: TimeDelta::minutes(15)
                }
            ),
            "local: active (took over from remote, last heartbeat 15m 0s ago)"
        );
        assert_eq!(
            describe(
                NodeId::Remote,
                &ClaimOutcome::Observing {
                    owner: NodeId::Local,
                    heartbeat_age: TimeDelta::seconds(42)
                }
            ),
            "remote: observing (local is active, last heartbeat 42s ago)"
        );
    }

    #[test]
    fn format_age_clamps_negative_ages() {
        assert_eq!(format_age(TimeDelta::seconds(-30)), "0s");
        assert_eq!(format_age(TimeDelta::minutes(125)), "2h 5m");
    }
}
