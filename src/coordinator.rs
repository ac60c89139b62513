//! The ownership handshake.
//!
//! Two nodes share one record. Whoever holds a fresh heartbeat owns
//! execution; the other node stays idle until that heartbeat is older than
//! the lease timeout, then takes over. Each claim is one
//! read / decide / compare-and-swap cycle against the store, retried once if
//! a concurrent writer got there first.

use std::time::Duration;

use chrono::TimeDelta;

use crate::clock::Clock;
use crate::record::{NodeId, OwnershipRecord, REASON_TIMEOUT};
use crate::store::{Loaded, OwnershipStore, StoreError, Swap, Version};

/// Lease timeout used when nothing else is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Extra attempts after a compare-and-swap conflict.
const CONFLICT_RETRIES: usize = 1;

/// What a claim decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No usable record existed; a default one was written with the caller as owner.
    Initialized,
    /// The caller already owned the lease and refreshed its heartbeat.
    Renewed,
    /// The peer's heartbeat was stale; ownership moved to the caller.
    TookOver { from: NodeId, heartbeat_age: TimeDelta },
    /// The peer holds a fresh lease. Nothing was changed unless the record had
    /// to be initialized first; a record initialized by `remote` names `local`
    /// as owner with `health.local` still `unknown` (see
    /// [`OwnershipRecord::initial`]).
    Observing { owner: NodeId, heartbeat_age: TimeDelta },
}

impl ClaimOutcome {
    /// Whether the caller may run guarded work this cycle.
    pub const fn is_granted(&self) -> bool {
        !matches!(self, Self::Observing { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ownership record at {location} kept changing during the claim; not claiming")]
    Contended { location: String },
}

/// Pure claim decision: the outcome plus the record to persist, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub outcome: ClaimOutcome,
    pub write: Option<OwnershipRecord>,
}

/// Decide a claim by `node` against `current` (`None` when there is no usable record).
pub fn decide(
    current: Option<OwnershipRecord>,
    node: NodeId,
    now: chrono::DateTime<chrono::Utc>,
    timeout: TimeDelta,
) -> Decision {
    let initialized = current.is_none();
    let mut record = current.unwrap_or_else(|| OwnershipRecord::initial(now));
    let threshold = u64::try_from(timeout.num_seconds()).ok();

    if record.active_node == node {
        record.renew(node, now);
        record.failover_threshold_seconds = threshold;
        let outcome = if initialized {
            ClaimOutcome::Initialized
        } else {
            ClaimOutcome::Renewed
        };
        return Decision {
            outcome,
            write: Some(record),
        };
    }

    let owner = record.active_node;
    let heartbeat_age = record.heartbeat_age(now);

    if record.is_stale(now, timeout) {
        record.transfer_to(node, now, REASON_TIMEOUT);
        record.failover_threshold_seconds = threshold;
        return Decision {
            outcome: ClaimOutcome::TookOver {
                from: owner,
                heartbeat_age,
            },
            write: Some(record),
        };
    }

    Decision {
        outcome: ClaimOutcome::Observing {
            owner,
            heartbeat_age,
        },
        write: initialized.then_some(record),
    }
}

/// Gates execution between the two nodes through a shared store.
pub struct Coordinator<S, C> {
    store: S,
    clock: C,
    timeout: TimeDelta,
}

impl<S: OwnershipStore, C: Clock> Coordinator<S, C> {
    pub fn new(store: S, clock: C, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout: TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX),
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Time source used for every lease decision.
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    pub const fn timeout(&self) -> TimeDelta {
        self.timeout
    }

    /// Ask for execution rights on behalf of `node`.
    ///
    /// `Ok` with a granted outcome means the record now names `node` as owner
    /// and that write is on the store. Any error means the caller must not
    /// act this cycle.
    pub fn claim_ownership(&self, node: NodeId) -> Result<ClaimOutcome, ClaimError> {
        for attempt in 0..=CONFLICT_RETRIES {
            let loaded = self.store.load()?;
            let expected = loaded.version();
            let current = self.usable_record(loaded, node);

            let decision = decide(current, node, self.clock.now(), self.timeout);
            let Some(record) = decision.write else {
                tracing::debug!(%node, outcome = ?decision.outcome, "lease held by peer");
                return Ok(decision.outcome);
            };

            match self.store.compare_and_swap(&expected, &record)? {
                Swap::Applied => {
                    log_outcome(node, &decision.outcome);
                    return Ok(decision.outcome);
                }
                Swap::Conflict => {
                    tracing::debug!(%node, attempt, "ownership record changed during claim, re-reading");
                }
            }
        }

        Err(ClaimError::Contended {
            location: self.store.describe(),
        })
    }

    /// [`Self::claim_ownership`] reduced to the go / no-go answer.
    pub fn claim(&self, node: NodeId) -> Result<bool, ClaimError> {
        self.claim_ownership(node).map(|outcome| outcome.is_granted())
    }

    /// Current record without claiming anything.
    pub fn inspect(&self) -> Result<Loaded, StoreError> {
        self.store.load()
    }

    fn usable_record(&self, loaded: Loaded, node: NodeId) -> Option<OwnershipRecord> {
        match loaded {
            Loaded::Missing => None,
            Loaded::Corrupt { reason, version } => {
                tracing::warn!(
                    store = %self.store.describe(),
                    unreadable = version == Version::Unreadable,
                    "ignoring corrupt ownership record, starting from defaults: {reason}"
                );
                None
            }
            Loaded::Present { record, .. } => {
                self.check_threshold(&record, node);
                Some(record)
            }
        }
    }

    fn check_threshold(&self, record: &OwnershipRecord, node: NodeId) {
        let Some(theirs) = record.failover_threshold_seconds else {
            return;
        };
        let ours = self.timeout.num_seconds();
        if record.active_node != node && u64::try_from(ours).ok() != Some(theirs) {
            tracing::warn!(
                owner = %record.active_node,
                owner_timeout_secs = theirs,
                our_timeout_secs = ours,
                "lease timeout differs from the owner's; ownership may oscillate"
            );
        }
    }
}

fn log_outcome(node: NodeId, outcome: &ClaimOutcome) {
    match outcome {
        ClaimOutcome::Initialized => {
            tracing::info!(%node, "initialized ownership record");
        }
        ClaimOutcome::Renewed => tracing::debug!(%node, "heartbeat renewed"),
        ClaimOutcome::TookOver {
            from,
            heartbeat_age,
        } => {
            tracing::info!(
                %node,
                %from,
                heartbeat_age_secs = heartbeat_age.num_seconds(),
                "peer heartbeat stale, ownership transferred"
            );
        }
        ClaimOutcome::Observing { owner, .. } => {
            tracing::info!(%node, %owner, "initialized ownership record; peer holds the lease");
        }
    }
}
