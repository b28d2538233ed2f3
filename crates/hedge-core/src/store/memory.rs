use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{EntityKind, FeedEntity, FeedFilter, FeedItem, Store, SubscriptionFeed};
use crate::bus::Fanout;
use crate::types::{AccountSnapshot, Action, ActionStatus, Position, PositionStatus};
use crate::{Error, Result};

/// In-memory store and feed, used by tests and single-host deployments.
///
/// Every mutation is published to matching subscribers after the record
/// guard is released.
pub struct MemoryStore {
    positions: DashMap<Uuid, Position>,
    actions: DashMap<Uuid, Action>,
    accounts: DashMap<String, AccountSnapshot>,
    feed: Fanout<FeedItem>,
    subscriptions: AtomicU64,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(feed_capacity: usize) -> Self {
        Self {
            positions: DashMap::new(),
            actions: DashMap::new(),
            accounts: DashMap::new(),
            feed: Fanout::new(feed_capacity),
            subscriptions: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing the feed: closes every open subscription and, while
    /// unavailable, refuses new ones.
    pub fn set_feed_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.feed.close_all();
        }
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    fn publish(&self, entity: FeedEntity) {
        let report = self.feed.publish(FeedItem {
            entity,
            timestamp: Utc::now(),
        });
        trace!(delivered = report.delivered, "Store change published");
    }

    fn next_version(current: Option<u64>) -> Option<u64> {
        Some(current.unwrap_or(0) + 1)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_position(&self, position: &Position) -> Result<Position> {
        let mut stored = position.clone();
        stored.version = Some(1);
        match self.positions.entry(stored.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::Store {
                    message: format!("position {} already exists", stored.id),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(stored.clone());
            }
        }
        self.publish(FeedEntity::Position(stored.clone()));
        Ok(stored)
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>> {
        Ok(self.positions.get(&id).map(|p| p.clone()))
    }

    async fn update_position(&self, position: &Position) -> Result<Position> {
        let stored = {
            let mut entry = self.positions.get_mut(&position.id).ok_or_else(|| Error::NotFound {
                entity: "position",
                id: position.id.to_string(),
            })?;
            let mut next = position.clone();
            next.version = Self::next_version(entry.version);
            next.updated_at = Utc::now();
            *entry = next.clone();
            next
        };
        self.publish(FeedEntity::Position(stored.clone()));
        Ok(stored)
    }

    async fn replace_position_if(
        &self,
        position: &Position,
        expected: PositionStatus,
    ) -> Result<Option<Position>> {
        let stored = {
            let Some(mut entry) = self.positions.get_mut(&position.id) else {
                return Ok(None);
            };
            if entry.status != expected {
                debug!(
                    position_id = %position.id,
                    expected = %expected,
                    actual = %entry.status,
                    "Conditional position replace skipped"
                );
                return Ok(None);
            }
            let mut next = position.clone();
            next.version = Self::next_version(entry.version);
            next.updated_at = Utc::now();
            *entry = next.clone();
            next
        };
        self.publish(FeedEntity::Position(stored.clone()));
        Ok(Some(stored))
    }

    async fn delete_position(&self, id: Uuid) -> Result<bool> {
        Ok(self.positions.remove(&id).is_some())
    }

    async fn update_position_status_if(
        &self,
        id: Uuid,
        expected: PositionStatus,
        next: PositionStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        let stored = {
            let Some(mut entry) = self.positions.get_mut(&id) else {
                return Ok(false);
            };
            if entry.status != expected {
                return Ok(false);
            }
            entry.status = next;
            entry.status_reason = reason;
            entry.version = Self::next_version(entry.version);
            entry.updated_at = Utc::now();
            entry.clone()
        };
        self.publish(FeedEntity::Position(stored));
        Ok(true)
    }

    async fn list_positions(&self, filter: &FeedFilter) -> Result<Vec<Position>> {
        let mut positions: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| filter.matches(&p.account_id, &p.owner))
            .map(|p| p.clone())
            .collect();
        positions.sort_by_key(|p| p.created_at);
        Ok(positions)
    }

    async fn insert_action(&self, action: &Action) -> Result<Action> {
        let mut stored = action.clone();
        stored.version = Some(1);
        match self.actions.entry(stored.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::Store {
                    message: format!("action {} already exists", stored.id),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(stored.clone());
            }
        }
        self.publish(FeedEntity::Action(stored.clone()));
        Ok(stored)
    }

    async fn get_action(&self, id: Uuid) -> Result<Option<Action>> {
        Ok(self.actions.get(&id).map(|a| a.clone()))
    }

    async fn update_action_status_if(
        &self,
        id: Uuid,
        expected: ActionStatus,
        next: ActionStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        let stored = {
            let Some(mut entry) = self.actions.get_mut(&id) else {
                return Ok(false);
            };
            if entry.status != expected {
                return Ok(false);
            }
            entry.status = next;
            if reason.is_some() {
                entry.failure_reason = reason;
            }
            entry.version = Self::next_version(entry.version);
            entry.updated_at = Utc::now();
            entry.clone()
        };
        self.publish(FeedEntity::Action(stored));
        Ok(true)
    }

    async fn list_actions(
        &self,
        filter: &FeedFilter,
        status: Option<ActionStatus>,
    ) -> Result<Vec<Action>> {
        let mut actions: Vec<Action> = self
            .actions
            .iter()
            .filter(|a| filter.matches(&a.account_id, &a.owner))
            .filter(|a| status.map(|s| a.status == s).unwrap_or(true))
            .map(|a| a.clone())
            .collect();
        actions.sort_by_key(|a| a.created_at);
        Ok(actions)
    }

    async fn upsert_account(&self, account: &AccountSnapshot) -> Result<()> {
        self.accounts
            .insert(account.account_id.clone(), account.clone());
        self.publish(FeedEntity::Account(account.clone()));
        Ok(())
    }

    async fn list_accounts(&self, filter: &FeedFilter) -> Result<Vec<AccountSnapshot>> {
        Ok(self
            .accounts
            .iter()
            .filter(|a| filter.matches(&a.account_id, &a.owner))
            .map(|a| a.clone())
            .collect())
    }
}

#[async_trait]
impl SubscriptionFeed for MemoryStore {
    async fn subscribe(
        &self,
        kind: EntityKind,
        filter: FeedFilter,
    ) -> Result<mpsc::Receiver<FeedItem>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::connection("subscription feed unavailable"));
        }
        let n = self.subscriptions.fetch_add(1, Ordering::Relaxed);
        let name = format!("{:?}-{}", kind, n).to_lowercase();
        Ok(self.feed.subscribe_filtered(name, move |item: &FeedItem| {
            item.entity.kind() == kind
                && filter.matches(item.entity.account_id(), item.entity.owner())
        }))
    }
}
