//! Local execution locks for actions.
//!
//! A lock only stops this process from handling the same action twice
//! concurrently. Exclusion across processes comes from the store's conditional
//! status updates.
//!
//! Outcomes recorded here outlive the lock: once the venue has answered for an
//! action, only its terminal status write may be retried, never the command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hedge_core::bus::ActionOutcome;
use hedge_core::Error;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct LockEntry {
    acquired: Instant,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct UnsettledOutcome {
    outcome: ActionOutcome,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockStats {
    pub held: usize,
    pub unsettled: usize,
    pub acquired: u64,
    pub contended: u64,
    pub released: u64,
    pub released_failed: u64,
    pub stale_released: u64,
}

pub struct ActionConsistencyManager {
    locks: DashMap<Uuid, LockEntry>,
    unsettled: DashMap<Uuid, UnsettledOutcome>,
    stale_timeout: Duration,
    acquired: AtomicU64,
    contended: AtomicU64,
    released: AtomicU64,
    released_failed: AtomicU64,
    stale_released: AtomicU64,
}

impl ActionConsistencyManager {
    pub fn new(stale_timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            unsettled: DashMap::new(),
            stale_timeout,
            acquired: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            released: AtomicU64::new(0),
            released_failed: AtomicU64::new(0),
            stale_released: AtomicU64::new(0),
        }
    }

    /// Take the lock for `action_id`. False if already held.
    pub fn acquire(&self, action_id: Uuid) -> bool {
        match self.locks.entry(action_id) {
            Entry::Occupied(_) => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                debug!(action_id = %action_id, "Action lock already held");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(LockEntry {
                    acquired: Instant::now(),
                    acquired_at: Utc::now(),
                });
                self.acquired.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Release after a successful execution.
    pub fn release(&self, action_id: Uuid) -> bool {
        let removed = self.locks.remove(&action_id).is_some();
        if removed {
            self.released.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Release after a failed execution.
    pub fn release_failed(&self, action_id: Uuid) -> bool {
        let removed = self.locks.remove(&action_id).is_some();
        if removed {
            self.released_failed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Force-release every lock held longer than the staleness timeout.
    /// Returns the released ids; the actions become reclaimable.
    pub fn cleanup_stale(&self) -> Vec<Uuid> {
        let stale: Vec<(Uuid, DateTime<Utc>)> = self
            .locks
            .iter()
            .filter(|e| e.acquired.elapsed() >= self.stale_timeout)
            .map(|e| (*e.key(), e.acquired_at))
            .collect();

        let mut released = Vec::with_capacity(stale.len());
        for (action_id, acquired_at) in stale {
            let removed = self
                .locks
                .remove_if(&action_id, |_, e| e.acquired.elapsed() >= self.stale_timeout)
                .is_some();
            if removed {
                self.stale_released.fetch_add(1, Ordering::Relaxed);
                let violation = Error::ConsistencyViolation {
                    message: format!(
                        "lock on action {} held past {}s",
                        action_id,
                        self.stale_timeout.as_secs()
                    ),
                };
                warn!(
                    action_id = %action_id,
                    acquired_at = %acquired_at,
                    error = %violation,
                    "Force-released stale action lock"
                );
                released.push(action_id);
            }
        }
        released
    }

    /// Remember the venue's answer for `action_id` until its terminal status
    /// is stored.
    pub fn record_outcome(&self, action_id: Uuid, outcome: ActionOutcome) {
        self.unsettled.insert(
            action_id,
            UnsettledOutcome {
                outcome,
                recorded_at: Utc::now(),
            },
        );
    }

    /// The recorded answer for an action whose terminal write has not landed.
    pub fn unsettled_outcome(&self, action_id: Uuid) -> Option<ActionOutcome> {
        self.unsettled.get(&action_id).map(|e| {
            debug!(
                action_id = %action_id,
                recorded_at = %e.recorded_at,
                "Found unsettled action outcome"
            );
            e.outcome.clone()
        })
    }

    /// Forget the recorded outcome once the store holds a terminal status.
    pub fn settle(&self, action_id: Uuid) -> bool {
        self.unsettled.remove(&action_id).is_some()
    }

    pub fn is_locked(&self, action_id: Uuid) -> bool {
        self.locks.contains_key(&action_id)
    }

    pub fn held(&self) -> usize {
        self.locks.len()
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            held: self.locks.len(),
            unsettled: self.unsettled.len(),
            acquired: self.acquired.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            released_failed: self.released_failed.load(Ordering::Relaxed),
            stale_released: self.stale_released.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let locks = ActionConsistencyManager::new(Duration::from_secs(300));
        let id = Uuid::new_v4();

        assert!(locks.acquire(id));
        assert!(!locks.acquire(id));
        assert!(locks.is_locked(id));

        assert!(locks.release(id));
        assert!(locks.acquire(id));
        assert!(locks.release_failed(id));
        assert!(!locks.release(id));

        let stats = locks.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.contended, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.released_failed, 1);
        assert_eq!(stats.held, 0);
    }

    #[test]
    fn test_cleanup_stale() {
        let locks = ActionConsistencyManager::new(Duration::ZERO);
        let id = Uuid::new_v4();
        locks.acquire(id);

        assert_eq!(locks.cleanup_stale(), vec![id]);
        assert!(!locks.is_locked(id));
        assert!(locks.acquire(id));
        assert_eq!(locks.stats().stale_released, 1);
    }

    #[test]
    fn test_outcome_survives_release_and_stale_cleanup() {
        let locks = ActionConsistencyManager::new(Duration::ZERO);
        let id = Uuid::new_v4();
        locks.acquire(id);
        locks.record_outcome(
            id,
            ActionOutcome::Failed {
                reason: "rejected".to_string(),
            },
        );

        locks.release_failed(id);
        locks.acquire(id);
        locks.cleanup_stale();
        assert!(!locks.is_locked(id));
        assert!(matches!(
            locks.unsettled_outcome(id),
            Some(ActionOutcome::Failed { .. })
        ));
        assert_eq!(locks.stats().unsettled, 1);

        assert!(locks.settle(id));
        assert!(!locks.settle(id));
        assert!(locks.unsettled_outcome(id).is_none());
    }

    #[test]
    fn test_cleanup_keeps_fresh_locks() {
        let locks = ActionConsistencyManager::new(Duration::from_secs(300));
        let id = Uuid::new_v4();
        locks.acquire(id);
        assert!(locks.cleanup_stale().is_empty());
        assert_eq!(locks.held(), 1);
    }
}
