//! Durable store and subscription feed seams.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::{AccountSnapshot, Action, ActionStatus, Position, PositionStatus};
use crate::Result;

/// Kind of record carried by the subscription feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Position,
    Action,
    Account,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum FeedEntity {
    Position(Position),
    Action(Action),
    Account(AccountSnapshot),
}

impl FeedEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Position(_) => EntityKind::Position,
            Self::Action(_) => EntityKind::Action,
            Self::Account(_) => EntityKind::Account,
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            Self::Position(p) => &p.account_id,
            Self::Action(a) => &a.account_id,
            Self::Account(a) => &a.account_id,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            Self::Position(p) => &p.owner,
            Self::Action(a) => &a.owner,
            Self::Account(a) => &a.owner,
        }
    }
}

/// One change notification. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub entity: FeedEntity,
    pub timestamp: DateTime<Utc>,
}

/// Record filter for queries and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedFilter {
    pub account_ids: Option<Vec<String>>,
    pub owner: Option<String>,
}

impl FeedFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accounts<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.account_ids = Some(accounts.into_iter().map(Into::into).collect());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn matches(&self, account_id: &str, owner: &str) -> bool {
        if let Some(ref accounts) = self.account_ids {
            if !accounts.iter().any(|a| a == account_id) {
                return false;
            }
        }
        if let Some(ref expected) = self.owner {
            if expected != owner {
                return false;
            }
        }
        true
    }
}

/// Durable CRUD store with conditional status updates.
///
/// Conditional updates are atomic per record and bump its version. They are
/// the only cross-process exclusion primitive available to the engines.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_position(&self, position: &Position) -> Result<Position>;

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>>;

    /// Unconditional overwrite of an existing position.
    async fn update_position(&self, position: &Position) -> Result<Position>;

    /// Overwrite a position only while its stored status equals `expected`.
    async fn replace_position_if(
        &self,
        position: &Position,
        expected: PositionStatus,
    ) -> Result<Option<Position>>;

    async fn delete_position(&self, id: Uuid) -> Result<bool>;

    async fn update_position_status_if(
        &self,
        id: Uuid,
        expected: PositionStatus,
        next: PositionStatus,
        reason: Option<String>,
    ) -> Result<bool>;

    async fn list_positions(&self, filter: &FeedFilter) -> Result<Vec<Position>>;

    async fn insert_action(&self, action: &Action) -> Result<Action>;

    async fn get_action(&self, id: Uuid) -> Result<Option<Action>>;

    async fn update_action_status_if(
        &self,
        id: Uuid,
        expected: ActionStatus,
        next: ActionStatus,
        reason: Option<String>,
    ) -> Result<bool>;

    async fn list_actions(
        &self,
        filter: &FeedFilter,
        status: Option<ActionStatus>,
    ) -> Result<Vec<Action>>;

    async fn upsert_account(&self, account: &AccountSnapshot) -> Result<()>;

    async fn list_accounts(&self, filter: &FeedFilter) -> Result<Vec<AccountSnapshot>>;
}

/// Change-notification stream over the store.
#[async_trait]
pub trait SubscriptionFeed: Send + Sync {
    async fn subscribe(
        &self,
        kind: EntityKind,
        filter: FeedFilter,
    ) -> Result<mpsc::Receiver<FeedItem>>;
}

/// Read-only view of the positions known to this process.
pub trait PositionSnapshots: Send + Sync {
    fn positions(&self) -> Vec<Position>;
}
