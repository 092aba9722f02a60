//! Claim leases (§4.5 `claim_run`/`claim_task`) and per-step timeouts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which deadline fired. Mirrors the step/workflow timeout surfaces that
/// become `step.failed`/`cancellation.requested` writes when they expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// A step ran longer than its configured `StepOptions::timeout`.
    StepExecution,
    /// A run's `max_duration_ms` elapsed; becomes `cancellation.requested`.
    MaxDuration,
    /// A claim lease expired without renewal; subject to the recovery sweeper.
    ClaimExpired,
}

/// A time-bounded exclusive lease on a run or step (§4.5). Acts as a lease,
/// not a mutex: it tolerates worker death by simply expiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub holder: uuid::Uuid,
    pub expires_at: DateTime<Utc>,
}

impl ClaimLease {
    pub fn new(holder: uuid::Uuid, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, worker_id: uuid::Uuid, now: DateTime<Utc>) -> bool {
        self.holder == worker_id && !self.is_expired(now)
    }

    /// Renew the lease. Only the current holder should call this; the
    /// storage layer enforces that with a CAS on `(run_id, holder)`.
    pub fn renew(&mut self, ttl: Duration, now: DateTime<Utc>) {
        self.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expires_after_ttl() {
        let now = Utc::now();
        let holder = uuid::Uuid::now_v7();
        let lease = ClaimLease::new(holder, Duration::from_secs(30), now);
        assert!(!lease.is_expired(now + chrono::Duration::seconds(10)));
        assert!(lease.is_expired(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn lease_is_held_only_by_its_holder() {
        let now = Utc::now();
        let holder = uuid::Uuid::now_v7();
        let other = uuid::Uuid::now_v7();
        let lease = ClaimLease::new(holder, Duration::from_secs(30), now);
        assert!(lease.is_held_by(holder, now));
        assert!(!lease.is_held_by(other, now));
    }

    #[test]
    fn renew_extends_expiry() {
        let now = Utc::now();
        let holder = uuid::Uuid::now_v7();
        let mut lease = ClaimLease::new(holder, Duration::from_secs(5), now);
        let later = now + chrono::Duration::seconds(4);
        lease.renew(Duration::from_secs(30), later);
        assert!(!lease.is_expired(later + chrono::Duration::seconds(10)));
    }
}
