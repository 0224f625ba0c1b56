//! Driver leases.
//!
//! At most one process drives an instance at a time. A driver claims the
//! journal lease before its first boundary and renews it while it runs;
//! another process may take the instance over only after the lease lapses.

use std::time::Duration;

use uuid::Uuid;
use waypoint_types::error::RepositoryError;

use crate::repository::workflow::WorkflowJournal;

/// How long a lease stays valid without renewal unless configured.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(50);

/// Identity and lifetime of the leases one manager takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSettings {
    /// Unique per manager, so two processes never share an owner.
    pub owner: String,
    pub ttl: Duration,
}

impl LeaseSettings {
    pub fn new(ttl: Duration) -> Self {
        Self {
            owner: format!("{}-{}", std::process::id(), Uuid::now_v7()),
            ttl,
        }
    }

    /// A third of the ttl, floored at 50ms.
    pub fn renew_every(&self) -> Duration {
        (self.ttl / 3).max(MIN_RENEW_INTERVAL)
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_TTL)
    }
}

/// Renew the lease on `id` until it is lost. Never returns while the lease
/// is held.
pub(crate) async fn keep_alive<J: WorkflowJournal>(journal: &J, id: Uuid, lease: &LeaseSettings) {
    let mut ticker = tokio::time::interval(lease.renew_every());
    // The first tick completes immediately; the claim was just taken.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match journal.claim_driver(&id, &lease.owner, lease.ttl).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(
                    workflow_id = %id,
                    owner = %lease.owner,
                    "driver lease taken over by another process"
                );
                return;
            }
            // Delivered or cleaned up; the driver is about to finish.
            Err(RepositoryError::NotFound) => std::future::pending::<()>().await,
            Err(err) => {
                tracing::warn!(workflow_id = %id, error = %err, "driver lease renewal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_interval_is_a_fraction_of_ttl() {
        let lease = LeaseSettings::new(Duration::from_secs(30));
        assert_eq!(lease.renew_every(), Duration::from_secs(10));

        let short = LeaseSettings::new(Duration::ZERO);
        assert_eq!(short.renew_every(), MIN_RENEW_INTERVAL);
    }

    #[test]
    fn owners_are_unique() {
        assert_ne!(LeaseSettings::default().owner, LeaseSettings::default().owner);
    }
}
