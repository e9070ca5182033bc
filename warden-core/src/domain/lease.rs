//! Ownership lease domain types
//!
//! A pipeline is driven by at most one executor at a time. The executor proves
//! ownership with a [`LeaseGrant`], whose fence token lets the store reject
//! writes from an owner whose lease was taken over in the meantime.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one executor process instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create an owner ID from an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique owner ID with a readable prefix (e.g. "worker")
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Generation number of a pipeline's lease
///
/// Bumped every time ownership changes hands through a claim. Writes carry the
/// token they were granted and are rejected once the stored token moved on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FenceToken(pub i64);

impl FenceToken {
    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current holder of a pipeline
///
/// Owner and heartbeat are a single value so one can never be set without the
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner_id: OwnerId,
    pub last_heartbeat: DateTime<Utc>,
}

impl Lease {
    /// Time elapsed since the last heartbeat
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }

    /// Whether the holder has been silent for longer than `stale_after`
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.age(now) > stale_after
    }
}

/// Proof of ownership handed to the executor by a successful claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub pipeline_id: Uuid,
    pub owner_id: OwnerId,
    pub fence_token: FenceToken,
    pub heartbeat_at: DateTime<Utc>,
}

/// Result of a claim attempt
///
/// Losing a claim to another owner is a normal coordination outcome, so it is
/// a variant here rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(LeaseGrant),
    Denied { current_owner: Option<OwnerId> },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    pub fn grant(&self) -> Option<&LeaseGrant> {
        match self {
            ClaimOutcome::Claimed(grant) => Some(grant),
            ClaimOutcome::Denied { .. } => None,
        }
    }

    pub fn into_grant(self) -> Option<LeaseGrant> {
        match self {
            ClaimOutcome::Claimed(grant) => Some(grant),
            ClaimOutcome::Denied { .. } => None,
        }
    }
}

/// Heartbeat value that is strictly later than `previous`
///
/// Stores keep microsecond precision, so two renewals within the same
/// microsecond still move forward by one tick.
pub fn next_heartbeat(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + Duration::microseconds(1);
    if now > floor { now } else { floor }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_heartbeat_uses_now_when_later() {
        let previous = Utc::now();
        let now = previous + Duration::seconds(5);
        assert_eq!(next_heartbeat(previous, now), now);
    }

    #[test]
    fn test_next_heartbeat_strictly_advances() {
        let previous = Utc::now();
        assert!(next_heartbeat(previous, previous) > previous);
        assert!(next_heartbeat(previous, previous - Duration::seconds(1)) > previous);
    }

    #[test]
    fn test_lease_staleness() {
        let now = Utc::now();
        let lease = Lease {
            owner_id: OwnerId::from("worker-a"),
            last_heartbeat: now - Duration::seconds(90),
        };
        assert!(lease.is_stale(now, Duration::seconds(60)));
        assert!(!lease.is_stale(now, Duration::seconds(120)));
    }

    #[test]
    fn test_generated_owner_ids_are_unique() {
        let a = OwnerId::generate("worker");
        let b = OwnerId::generate("worker");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("worker-"));
    }

    #[test]
    fn test_claim_outcome_accessors() {
        let grant = LeaseGrant {
            pipeline_id: Uuid::new_v4(),
            owner_id: OwnerId::from("worker-a"),
            fence_token: FenceToken(3),
            heartbeat_at: Utc::now(),
        };
        let claimed = ClaimOutcome::Claimed(grant.clone());
        assert!(claimed.is_claimed());
        assert_eq!(claimed.into_grant(), Some(grant));

        let denied = ClaimOutcome::Denied {
            current_owner: Some(OwnerId::from("worker-b")),
        };
        assert!(!denied.is_claimed());
        assert!(denied.grant().is_none());
    }
}
