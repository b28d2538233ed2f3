//! Trading actions executed on behalf of an owning client.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::command::Command;
use super::position::Direction;

/// Execution status of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Created, waiting to be claimed.
    Pending,
    /// Claimed; the owning process must execute it.
    Executing,
    Executed,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Executing => "EXECUTING",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of [`ActionKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Entry,
    Close,
    ModifyStop,
}

/// Typed action payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Entry {
        symbol: String,
        direction: Direction,
        volume: Decimal,
    },
    Close {
        position_id: Uuid,
    },
    ModifyStop {
        position_id: Uuid,
        new_stop_price: Decimal,
    },
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Entry { .. } => ActionType::Entry,
            Self::Close { .. } => ActionType::Close,
            Self::ModifyStop { .. } => ActionType::ModifyStop,
        }
    }
}

/// A unit of work addressed to one account and executed by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    /// Client identity that must execute this action.
    pub owner: String,
    pub account_id: String,
    pub kind: ActionKind,
    pub status: ActionStatus,
    /// Position this action targets, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Action {
    pub fn new(owner: impl Into<String>, account_id: impl Into<String>, kind: ActionKind) -> Self {
        let now = Utc::now();
        let position_id = match &kind {
            ActionKind::Entry { .. } => None,
            ActionKind::Close { position_id } | ActionKind::ModifyStop { position_id, .. } => {
                Some(*position_id)
            }
        };
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            account_id: account_id.into(),
            kind,
            status: ActionStatus::Pending,
            position_id,
            failure_reason: None,
            version: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_position(mut self, position_id: Uuid) -> Self {
        self.position_id = Some(position_id);
        self
    }

    pub fn with_status(mut self, status: ActionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }

    pub fn is_owned_by(&self, identity: &str) -> bool {
        self.owner == identity
    }

    /// The venue command that executes this action. The action id doubles as
    /// the command id so venue results can be correlated back.
    pub fn to_command(&self) -> Command {
        match &self.kind {
            ActionKind::Entry {
                symbol,
                direction,
                volume,
            } => Command::Open {
                command_id: self.id,
                account_id: self.account_id.clone(),
                symbol: symbol.clone(),
                direction: *direction,
                volume: *volume,
            },
            ActionKind::Close { position_id } => Command::Close {
                command_id: self.id,
                position_id: *position_id,
            },
            ActionKind::ModifyStop {
                position_id,
                new_stop_price,
            } => Command::ModifyStop {
                command_id: self.id,
                position_id: *position_id,
                new_stop_price: *new_stop_price,
            },
        }
    }
}
